//! GBL firmware container codec.
//!
//! A GBL image is a stream of `(tag: u32 LE, length: u32 LE, payload)`
//! records. The first record must be `HEADER_V3` and the last must be
//! `END`, whose 4-byte payload is a CRC-32 over every byte that precedes
//! it (including the END record's own tag and length words).

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

use crate::firmware::{FirmwareImageType, NabuCasaMetadata};
use crate::version::Version;

const GBL_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Error, Debug)]
pub enum GblError {
    #[error("malformed GBL image: {0}")]
    MalformedGbl(String),

    #[error("GBL checksum mismatch: image says {expected:#010X}, computed {computed:#010X}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("GBL image carries no metadata tag")]
    MissingMetadata,
}

/// Record tags, in the order the bootloader expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagId {
    HeaderV3,
    Application,
    SeUpgrade,
    Bootloader,
    Prog,
    ProgLz4,
    ProgLzma,
    EraseProg,
    Metadata,
    Signature,
    End,
}

impl TagId {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0x03A617EB => Some(TagId::HeaderV3),
            0xF40A0AF4 => Some(TagId::Application),
            0x5EA617EB => Some(TagId::SeUpgrade),
            0xF50909F5 => Some(TagId::Bootloader),
            0xFE0101FE => Some(TagId::Prog),
            0xFD0505FD => Some(TagId::ProgLz4),
            0xFD0707FD => Some(TagId::ProgLzma),
            0xFD0303FD => Some(TagId::EraseProg),
            0xF60808F6 => Some(TagId::Metadata),
            0xF70A0AF7 => Some(TagId::Signature),
            0xFC0404FC => Some(TagId::End),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            TagId::HeaderV3 => 0x03A617EB,
            TagId::Application => 0xF40A0AF4,
            TagId::SeUpgrade => 0x5EA617EB,
            TagId::Bootloader => 0xF50909F5,
            TagId::Prog => 0xFE0101FE,
            TagId::ProgLz4 => 0xFD0505FD,
            TagId::ProgLzma => 0xFD0707FD,
            TagId::EraseProg => 0xFD0303FD,
            TagId::Metadata => 0xF60808F6,
            TagId::Signature => 0xF70A0AF7,
            TagId::End => 0xFC0404FC,
        }
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({:#010X})", self.to_u32())
    }
}

/// A parsed, validated GBL image. Immutable after parsing; serialization
/// returns the exact original bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GblImage {
    tags: Vec<(TagId, Vec<u8>)>,
    raw: Vec<u8>,
}

impl GblImage {
    pub fn parse(data: &[u8]) -> Result<Self, GblError> {
        let mut cursor = Cursor::new(data);
        let mut tags: Vec<(TagId, Vec<u8>)> = Vec::new();

        loop {
            let offset = cursor.position() as usize;
            let remaining = data.len() - offset;

            if remaining < 8 {
                return Err(GblError::MalformedGbl(format!(
                    "truncated record header at offset {offset}"
                )));
            }

            let raw_tag = cursor.read_u32::<LittleEndian>().expect("checked length");
            let length = cursor.read_u32::<LittleEndian>().expect("checked length") as usize;

            let tag = TagId::from_u32(raw_tag).ok_or_else(|| {
                GblError::MalformedGbl(format!(
                    "unknown tag {raw_tag:#010X} at offset {offset}"
                ))
            })?;

            if tags.is_empty() && tag != TagId::HeaderV3 {
                return Err(GblError::MalformedGbl(format!(
                    "image does not start with HEADER_V3, found {tag}"
                )));
            }

            if length > remaining - 8 {
                return Err(GblError::MalformedGbl(format!(
                    "record {tag} overruns the image: {length} bytes with {} remaining",
                    remaining - 8
                )));
            }

            let payload = data[offset + 8..offset + 8 + length].to_vec();
            cursor.set_position((offset + 8 + length) as u64);
            tags.push((tag, payload));

            if tag == TagId::End {
                if length != 4 {
                    return Err(GblError::MalformedGbl(format!(
                        "END record payload is {length} bytes, expected 4"
                    )));
                }

                // The CRC covers everything up to and including the END
                // record's tag and length words.
                let crc_offset = offset + 8;
                let expected = u32::from_le_bytes(
                    data[crc_offset..crc_offset + 4].try_into().expect("4 bytes"),
                );
                let computed = GBL_CRC.checksum(&data[..crc_offset]);

                if computed != expected {
                    return Err(GblError::ChecksumMismatch { expected, computed });
                }

                break;
            }

            if remaining - 8 - length == 0 {
                return Err(GblError::MalformedGbl("image has no END record".into()));
            }
        }

        Ok(Self {
            tags,
            raw: data.to_vec(),
        })
    }

    pub fn tags(&self) -> impl Iterator<Item = (TagId, &[u8])> {
        self.tags.iter().map(|(tag, value)| (*tag, value.as_slice()))
    }

    pub fn first_tag(&self, tag_id: TagId) -> Option<&[u8]> {
        self.tags
            .iter()
            .find(|(tag, _)| *tag == tag_id)
            .map(|(_, value)| value.as_slice())
    }

    /// Parsed build metadata, if the image carries a `METADATA` record.
    pub fn metadata(&self) -> Result<NabuCasaMetadata, GblError> {
        let payload = self
            .first_tag(TagId::Metadata)
            .ok_or(GblError::MissingMetadata)?;

        let json = serde_json::from_slice(payload)
            .map_err(|e| GblError::MalformedGbl(format!("metadata is not JSON: {e}")))?;

        NabuCasaMetadata::from_json(json).map_err(GblError::MalformedGbl)
    }

    pub fn firmware_type(&self) -> Option<FirmwareImageType> {
        self.metadata().ok().and_then(|m| m.fw_type)
    }

    pub fn version(&self) -> Option<Version> {
        self.metadata().ok().and_then(|m| m.public_version().cloned())
    }

    /// The original image bytes, exactly as parsed.
    pub fn serialized_bytes(&self) -> &[u8] {
        &self.raw
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Assemble a GBL image from tag payloads, appending a valid END record.
    pub fn build_gbl(tags: &[(TagId, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();

        for (tag, payload) in tags {
            out.extend_from_slice(&tag.to_u32().to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(payload);
        }

        out.extend_from_slice(&TagId::End.to_u32().to_le_bytes());
        out.extend_from_slice(&4u32.to_le_bytes());
        let crc = GBL_CRC.checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::build_gbl;
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let data = build_gbl(&[
            (TagId::HeaderV3, &[0x03, 0x00, 0x00, 0x00]),
            (TagId::Application, &[0xAA; 16]),
            (TagId::Prog, &[0x55; 64]),
        ]);

        let image = GblImage::parse(&data).unwrap();
        assert_eq!(image.tags().count(), 4);
        assert_eq!(image.serialized_bytes(), &data[..]);

        let reparsed = GblImage::parse(image.serialized_bytes()).unwrap();
        assert_eq!(reparsed, image);
    }

    #[test]
    fn test_crc_matches_end_record() {
        let data = build_gbl(&[(TagId::HeaderV3, &[0; 4]), (TagId::Prog, &[1, 2, 3, 4])]);
        let image = GblImage::parse(&data).unwrap();

        let crc_bytes = image.first_tag(TagId::End).unwrap();
        let recomputed = GBL_CRC.checksum(&data[..data.len() - 4]);
        assert_eq!(crc_bytes, recomputed.to_le_bytes());
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut data = build_gbl(&[(TagId::HeaderV3, &[0; 4]), (TagId::Prog, &[9; 8])]);
        let last = data.len() - 1;
        data[last] ^= 0x01;

        match GblImage::parse(&data) {
            Err(GblError::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_header_must_be_first() {
        let data = build_gbl(&[(TagId::Prog, &[0; 4])]);
        assert!(matches!(
            GblImage::parse(&data),
            Err(GblError::MalformedGbl(_))
        ));
    }

    #[test]
    fn test_missing_end_record() {
        let mut data = Vec::new();
        data.extend_from_slice(&TagId::HeaderV3.to_u32().to_le_bytes());
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&[0; 4]);

        assert!(matches!(
            GblImage::parse(&data),
            Err(GblError::MalformedGbl(_))
        ));
    }

    #[test]
    fn test_record_overrun() {
        let mut data = Vec::new();
        data.extend_from_slice(&TagId::HeaderV3.to_u32().to_le_bytes());
        data.extend_from_slice(&100u32.to_le_bytes());
        data.extend_from_slice(&[0; 4]);

        assert!(matches!(
            GblImage::parse(&data),
            Err(GblError::MalformedGbl(_))
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());

        assert!(matches!(
            GblImage::parse(&data),
            Err(GblError::MalformedGbl(_))
        ));
    }

    #[test]
    fn test_metadata_extraction() {
        let metadata_json =
            br#"{"metadata_version": 1, "sdk_version": "4.1.3", "fw_type": "rcp-uart-802154"}"#;
        let data = build_gbl(&[
            (TagId::HeaderV3, &[0; 4]),
            (TagId::Metadata, metadata_json),
            (TagId::Prog, &[0; 16]),
        ]);

        let image = GblImage::parse(&data).unwrap();
        let metadata = image.metadata().unwrap();
        assert_eq!(
            metadata.fw_type,
            Some(crate::firmware::FirmwareImageType::RcpUart802154)
        );
        assert_eq!(
            image.firmware_type(),
            Some(crate::firmware::FirmwareImageType::RcpUart802154)
        );
        assert_eq!(image.version(), Some(Version::new("4.1.3").unwrap()));
    }

    #[test]
    fn test_missing_metadata() {
        let data = build_gbl(&[(TagId::HeaderV3, &[0; 4])]);
        let image = GblImage::parse(&data).unwrap();
        assert!(matches!(image.metadata(), Err(GblError::MissingMetadata)));
    }
}
