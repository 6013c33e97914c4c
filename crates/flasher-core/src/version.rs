//! Firmware version strings.
//!
//! Versions come from several sources with different shapes: EmberZNet
//! build strings (`7.1.3.0 GA`, `7.2.2.0 build 190`), CPC version triples
//! (`4.3.1`), OpenThread NCP strings
//! (`SL-OPENTHREAD/2.2.2.0_GitHub-91fa1f455`) and GBL metadata. They are
//! compared by their dotted numeric core, then by the numeric build suffix;
//! a non-numeric commit suffix participates in equality only.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    components: Vec<u64>,
    build: Option<u64>,
    commit: Option<String>,
}

impl Version {
    /// Parse a version string. Returns `None` when no leading dotted
    /// numeric core can be found.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();

        // `SL-OPENTHREAD/2.2.2.0_GitHub-91fa1f455`: the product prefix is
        // not part of the version.
        let after_prefix = match trimmed.rfind('/') {
            Some(idx) => &trimmed[idx + 1..],
            None => trimmed,
        };

        // An underscore separates the numeric core from a commit tag.
        let (core_part, underscore_commit) = match after_prefix.split_once('_') {
            Some((core, commit)) => (core, Some(commit.to_string())),
            None => (after_prefix, None),
        };

        let mut components = Vec::new();
        let mut rest = core_part;

        for (idx, token) in core_part.split('.').enumerate() {
            // The final component may carry a trailing suffix, e.g.
            // `0 build 190`, `0-gsdk`, `0 GA`.
            let numeric: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();

            if numeric.is_empty() {
                break;
            }

            components.push(numeric.parse().ok()?);

            let consumed: usize = core_part
                .split('.')
                .take(idx + 1)
                .map(|t| t.len() + 1)
                .sum::<usize>()
                - 1;
            rest = &core_part[consumed.min(core_part.len())..];

            if token.len() != numeric.len() {
                // Suffix glued onto the digits; stop consuming components.
                let offset = consumed - (token.len() - numeric.len());
                rest = &core_part[offset..];
                break;
            }
        }

        if components.is_empty() {
            return None;
        }

        let mut build = None;
        let mut commit = underscore_commit;

        let suffix = rest.trim_start_matches(['.', ' ', '-']).trim();
        if !suffix.is_empty() {
            let word = suffix.strip_prefix("build").map(str::trim).unwrap_or(suffix);

            match word.parse::<u64>() {
                Ok(n) => build = Some(n),
                Err(_) if commit.is_none() => commit = Some(word.to_string()),
                Err(_) => {}
            }
        }

        Some(Self {
            raw: trimmed.to_string(),
            components,
            build,
            commit,
        })
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }

    pub fn build(&self) -> Option<u64> {
        self.build
    }

    pub fn commit(&self) -> Option<&str> {
        self.commit.as_deref()
    }

    /// Numeric ordering key: components padded with zeros, then the build.
    fn cmp_numeric(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());

        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);

            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }

        self.build.unwrap_or(0).cmp(&other.build.unwrap_or(0))
    }

    /// Whether two versions describe the same firmware closely enough to
    /// skip a reflash: equal numeric cores, with the build required to
    /// match only when both sides specify one.
    pub fn compatible_with(&self, other: &Self) -> bool {
        let len = self.components.len().max(other.components.len());

        let cores_equal = (0..len).all(|i| {
            self.components.get(i).copied().unwrap_or(0)
                == other.components.get(i).copied().unwrap_or(0)
        });

        let builds_equal = match (self.build, other.build) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };

        cores_equal && builds_equal
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::new(s).ok_or_else(|| format!("not a version string: {s:?}"))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_numeric(other) == Ordering::Equal && self.commit == other.commit
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp_numeric(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::new(s).unwrap()
    }

    #[test]
    fn test_parse_plain() {
        let version = v("7.1.3.0");
        assert_eq!(version.components(), &[7, 1, 3, 0]);
        assert_eq!(version.build(), None);
        assert_eq!(version.to_string(), "7.1.3.0");
    }

    #[test]
    fn test_parse_build_suffix() {
        let version = v("7.2.2.0 build 190");
        assert_eq!(version.components(), &[7, 2, 2, 0]);
        assert_eq!(version.build(), Some(190));
    }

    #[test]
    fn test_parse_openthread() {
        let version = v("SL-OPENTHREAD/2.2.2.0_GitHub-91fa1f455");
        assert_eq!(version.components(), &[2, 2, 2, 0]);
        assert_eq!(version.commit(), Some("GitHub-91fa1f455"));
    }

    #[test]
    fn test_parse_non_numeric_suffix() {
        let version = v("7.1.3.0 GA");
        assert_eq!(version.components(), &[7, 1, 3, 0]);
        assert_eq!(version.build(), None);
        assert_eq!(version.commit(), Some("GA"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Version::new("BL >").is_none());
        assert!(Version::new("").is_none());
    }

    #[test]
    fn test_self_comparison() {
        for s in ["2.00.01", "7.2.2.0 build 190", "4.2.2"] {
            let a = v(s);
            let b = v(s);
            assert_eq!(a, b);
            assert!(a >= b);
            assert!(!(a > b));
            assert!(a.compatible_with(&b));
        }
    }

    #[test]
    fn test_ordering() {
        assert!(v("2.00.01") > v("2.00.00"));
        assert!(v("2.10.01") > v("2.00.02"));
        assert!(v("7.2.0.0") > v("7.1.3.0"));
        assert!(v("7.2.2.0 build 191") > v("7.2.2.0 build 190"));
    }

    #[test]
    fn test_missing_components_are_zero() {
        assert_eq!(v("4.1.3"), v("4.1.3.0"));
        assert!(!(v("4.1.3") < v("4.1.3.0")));
    }

    #[test]
    fn test_commit_equality_only() {
        let a = v("SL-OPENTHREAD/2.2.2.1_GitHub-91fa1f455");
        let b = v("SL-OPENTHREAD/2.2.2.0_GitHub-asdfoo");
        assert!(a > b);
        assert!(a.compatible_with(&v("SL-OPENTHREAD/2.2.2.1_GitHub-other")));
        assert_ne!(a, v("SL-OPENTHREAD/2.2.2.1_GitHub-other"));
    }

    #[test]
    fn test_compatible_with_build() {
        assert!(v("7.2.2.0").compatible_with(&v("7.2.2.0 build 190")));
        assert!(!v("7.2.2.0 build 191").compatible_with(&v("7.2.2.0 build 190")));
    }
}
