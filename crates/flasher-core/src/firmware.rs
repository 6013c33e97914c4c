//! Firmware image and application personality model.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use tracing::warn;

use crate::version::Version;

/// Firmware image flavors shipped as GBL containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareImageType {
    /// EmberZNet Zigbee NCP firmware.
    NcpUartHw,
    /// Multiprotocol RCP (via zigbeed / OpenThread).
    RcpUart802154,
    /// Zigbee NCP + OpenThread RCP.
    ZigbeeNcpRcpUart802154,
    /// Standalone Zigbee router firmware.
    ZigbeeRouterUartHw,
    /// The Gecko bootloader itself.
    GeckoBootloader,
}

impl FirmwareImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirmwareImageType::NcpUartHw => "ncp-uart-hw",
            FirmwareImageType::RcpUart802154 => "rcp-uart-802154",
            FirmwareImageType::ZigbeeNcpRcpUart802154 => "zigbee-ncp-rcp-uart-802154",
            FirmwareImageType::ZigbeeRouterUartHw => "zigbee-router-uart-hw",
            FirmwareImageType::GeckoBootloader => "gecko-bootloader",
        }
    }
}

impl fmt::Display for FirmwareImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FirmwareImageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ncp-uart-hw" => Ok(FirmwareImageType::NcpUartHw),
            "rcp-uart-802154" => Ok(FirmwareImageType::RcpUart802154),
            "zigbee-ncp-rcp-uart-802154" => Ok(FirmwareImageType::ZigbeeNcpRcpUart802154),
            "zigbee-router-uart-hw" => Ok(FirmwareImageType::ZigbeeRouterUartHw),
            "gecko-bootloader" => Ok(FirmwareImageType::GeckoBootloader),
            other => Err(format!("unknown firmware image type: {other:?}")),
        }
    }
}

/// Application personality currently running on the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationType {
    GeckoBootloader,
    Cpc,
    Ezsp,
    Spinel,
}

impl ApplicationType {
    pub const ALL: [ApplicationType; 4] = [
        ApplicationType::GeckoBootloader,
        ApplicationType::Cpc,
        ApplicationType::Ezsp,
        ApplicationType::Spinel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationType::GeckoBootloader => "bootloader",
            ApplicationType::Cpc => "cpc",
            ApplicationType::Ezsp => "ezsp",
            ApplicationType::Spinel => "spinel",
        }
    }

    /// The firmware image types a running application is compatible with.
    /// Flashing outside this set is a cross-flash. The bootloader has no
    /// compatible image type: flashing from it is always a cross-flash.
    pub fn compatible_image_types(&self) -> &'static [FirmwareImageType] {
        match self {
            ApplicationType::Ezsp => &[FirmwareImageType::NcpUartHw],
            ApplicationType::Cpc => &[
                FirmwareImageType::RcpUart802154,
                FirmwareImageType::ZigbeeNcpRcpUart802154,
            ],
            ApplicationType::Spinel => &[FirmwareImageType::RcpUart802154],
            ApplicationType::GeckoBootloader => &[],
        }
    }

    /// Default probe baudrates, most likely first.
    pub fn default_baudrates(&self) -> &'static [u32] {
        match self {
            ApplicationType::GeckoBootloader => &[115_200],
            ApplicationType::Cpc => &[460_800, 115_200, 230_400],
            ApplicationType::Ezsp => &[115_200],
            ApplicationType::Spinel => &[460_800],
        }
    }
}

impl fmt::Display for ApplicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bootloader" => Ok(ApplicationType::GeckoBootloader),
            "cpc" => Ok(ApplicationType::Cpc),
            "ezsp" => Ok(ApplicationType::Ezsp),
            "spinel" => Ok(ApplicationType::Spinel),
            other => Err(format!("unknown application type: {other:?}")),
        }
    }
}

/// Which application type a firmware image will boot into.
pub fn image_application_type(image_type: FirmwareImageType) -> Option<ApplicationType> {
    match image_type {
        FirmwareImageType::NcpUartHw | FirmwareImageType::ZigbeeRouterUartHw => {
            Some(ApplicationType::Ezsp)
        }
        FirmwareImageType::RcpUart802154 | FirmwareImageType::ZigbeeNcpRcpUart802154 => {
            Some(ApplicationType::Cpc)
        }
        FirmwareImageType::GeckoBootloader => None,
    }
}

pub const METADATA_VERSION: u64 = 1;

/// Build metadata embedded by the firmware build pipeline inside the GBL
/// `METADATA` tag as a small JSON document.
#[derive(Debug, Clone)]
pub struct NabuCasaMetadata {
    pub metadata_version: u64,
    pub sdk_version: Option<Version>,
    pub ezsp_version: Option<Version>,
    pub ot_rcp_version: Option<Version>,
    pub cpc_version: Option<Version>,
    pub fw_type: Option<FirmwareImageType>,
    pub baudrate: Option<u32>,
    original: Value,
}

impl NabuCasaMetadata {
    pub fn from_json(json: Value) -> Result<Self, String> {
        let obj = json
            .as_object()
            .ok_or_else(|| "metadata is not a JSON object".to_string())?;

        let metadata_version = obj
            .get("metadata_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| "missing metadata_version".to_string())?;

        if metadata_version > METADATA_VERSION {
            return Err(format!(
                "unknown metadata version {metadata_version}, expected {METADATA_VERSION}"
            ));
        }

        let version = |key: &str| -> Option<Version> {
            obj.get(key).and_then(Value::as_str).and_then(Version::new)
        };

        let fw_type = match obj.get("fw_type").and_then(Value::as_str) {
            Some(s) => Some(s.parse::<FirmwareImageType>()?),
            None => None,
        };

        let known = [
            "metadata_version",
            "sdk_version",
            "ezsp_version",
            "ot_rcp_version",
            "cpc_version",
            "fw_type",
            "baudrate",
        ];
        for key in obj.keys().filter(|k| !known.contains(&k.as_str())) {
            warn!(key = %key, "Unexpected key in firmware metadata");
        }

        Ok(Self {
            metadata_version,
            sdk_version: version("sdk_version"),
            ezsp_version: version("ezsp_version"),
            ot_rcp_version: version("ot_rcp_version"),
            cpc_version: version("cpc_version"),
            fw_type,
            baudrate: obj
                .get("baudrate")
                .and_then(Value::as_u64)
                .map(|b| b as u32),
            original: json,
        })
    }

    /// The version to show users and compare against the running
    /// application, in order of preference.
    pub fn public_version(&self) -> Option<&Version> {
        self.cpc_version
            .as_ref()
            .or(self.ezsp_version.as_ref())
            .or(self.ot_rcp_version.as_ref())
            .or(self.sdk_version.as_ref())
    }

    /// The metadata exactly as embedded in the image.
    pub fn original_json(&self) -> &Value {
        &self.original
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_image_type_roundtrip() {
        for s in [
            "ncp-uart-hw",
            "rcp-uart-802154",
            "zigbee-ncp-rcp-uart-802154",
            "zigbee-router-uart-hw",
            "gecko-bootloader",
        ] {
            let parsed: FirmwareImageType = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }

    #[test]
    fn test_compatibility_mapping() {
        assert_eq!(
            ApplicationType::Ezsp.compatible_image_types(),
            &[FirmwareImageType::NcpUartHw]
        );
        assert!(ApplicationType::Cpc
            .compatible_image_types()
            .contains(&FirmwareImageType::ZigbeeNcpRcpUart802154));
        assert!(ApplicationType::GeckoBootloader
            .compatible_image_types()
            .is_empty());
    }

    #[test]
    fn test_metadata_parse() {
        let metadata = NabuCasaMetadata::from_json(json!({
            "metadata_version": 1,
            "sdk_version": "4.1.3",
            "fw_type": "rcp-uart-802154",
            "baudrate": 115200,
        }))
        .unwrap();

        assert_eq!(metadata.metadata_version, 1);
        assert_eq!(metadata.fw_type, Some(FirmwareImageType::RcpUart802154));
        assert_eq!(metadata.baudrate, Some(115_200));
        assert_eq!(
            metadata.public_version().unwrap(),
            &Version::new("4.1.3").unwrap()
        );
    }

    #[test]
    fn test_metadata_version_preference() {
        let metadata = NabuCasaMetadata::from_json(json!({
            "metadata_version": 1,
            "sdk_version": "4.1.3",
            "ezsp_version": "7.1.3.0",
        }))
        .unwrap();

        assert_eq!(
            metadata.public_version().unwrap(),
            &Version::new("7.1.3.0").unwrap()
        );
    }

    #[test]
    fn test_metadata_rejects_future_version() {
        assert!(NabuCasaMetadata::from_json(json!({ "metadata_version": 2 })).is_err());
    }
}
