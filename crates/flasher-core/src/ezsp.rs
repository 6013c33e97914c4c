//! EZSP command layer on top of the ASH link.
//!
//! Only the small command vocabulary needed for probing, bootloader entry
//! and EUI-64 token access is implemented. The protocol version is
//! negotiated first: `version` is always sent in the legacy (v4) frame
//! format, and the negotiated version then selects the framing and frame
//! IDs for everything else.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info};

use crate::ash::AshSession;
use crate::error::Error;
use crate::transport::Transport;
use crate::version::Version;

/// Protocol version used for the initial `version` exchange.
const PROBE_PROTOCOL_VERSION: u8 = 4;

/// First protocol version using the extended (16-bit frame ID) format.
const EXTENDED_FRAME_FORMAT_VERSION: u8 = 8;

const EMBER_SUCCESS: u8 = 0x00;

/// Reboot into the standalone (Gecko) bootloader.
const STANDALONE_BOOTLOADER_MODE: u8 = 0x01;

/// Manufacturing token IDs.
const MFG_STRING: u8 = 0x01;
const MFG_CUSTOM_EUI_64: u8 = 0x0C;

/// EZSP commands used by the flasher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameId {
    Version,
    GetMfgToken,
    SetMfgToken,
    GetEui64,
    LaunchStandaloneBootloader,
}

impl FrameId {
    /// Numeric frame ID under the negotiated protocol version. The IDs of
    /// the commands used here are stable across EZSP v4 through v13, but
    /// every lookup goes through the negotiated version so a future split
    /// has a single place to land.
    fn id(self, _protocol_version: u8) -> u16 {
        match self {
            FrameId::Version => 0x0000,
            FrameId::GetMfgToken => 0x000B,
            FrameId::SetMfgToken => 0x000C,
            FrameId::GetEui64 => 0x0026,
            FrameId::LaunchStandaloneBootloader => 0x008F,
        }
    }
}

/// IEEE EUI-64 node identifier.
///
/// Displayed and parsed in big-endian `aa:bb:cc:dd:ee:ff:00:11` order;
/// serialized to the EZSP wire in reversed (little-endian) byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub fn wire_bytes(&self) -> [u8; 8] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        let mut array: [u8; 8] = bytes.try_into().ok()?;
        array.reverse();
        Some(Self(array))
    }
}

impl FromStr for Eui64 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|&c| c != ':').collect();

        if hex.len() != 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("expected 16 hex digits, got {s:?}"));
        }

        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|e| e.to_string())?;
        }

        Ok(Self(bytes))
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{b:02x}")).collect();
        f.write_str(&parts.join(":"))
    }
}

/// Stack info reported by the `version` command.
#[derive(Debug, Clone, Copy)]
pub struct StackInfo {
    pub protocol_version: u8,
    pub stack_type: u8,
    pub stack_version: u16,
}

/// A connected EZSP client holding an exclusive borrow of the transport.
pub struct EzspClient<'a, T: Transport> {
    ash: AshSession<'a, T>,
    seq: u8,
    protocol_version: u8,
    stack_info: StackInfo,
}

impl<'a, T: Transport> EzspClient<'a, T> {
    /// Reset the NCP, establish the ASH link and negotiate the EZSP
    /// protocol version.
    pub fn connect(transport: &'a mut T, timeout: Duration) -> Result<Self, Error> {
        let mut ash = AshSession::new(transport);
        ash.connect(timeout)?;

        let mut client = Self {
            ash,
            seq: 0,
            protocol_version: PROBE_PROTOCOL_VERSION,
            stack_info: StackInfo {
                protocol_version: PROBE_PROTOCOL_VERSION,
                stack_type: 0,
                stack_version: 0,
            },
        };

        client.negotiate_version(timeout)?;
        Ok(client)
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn stack_info(&self) -> StackInfo {
        self.stack_info
    }

    fn negotiate_version(&mut self, timeout: Duration) -> Result<(), Error> {
        let info = self.send_version(PROBE_PROTOCOL_VERSION, timeout)?;

        if info.protocol_version != PROBE_PROTOCOL_VERSION {
            debug!(
                version = info.protocol_version,
                "NCP speaks a newer EZSP, renegotiating"
            );
            self.protocol_version = info.protocol_version;
            self.stack_info = self.send_version(info.protocol_version, timeout)?;
        } else {
            self.stack_info = info;
        }

        info!(
            protocol = self.protocol_version,
            stack_type = self.stack_info.stack_type,
            stack_version = format!("{:#06X}", self.stack_info.stack_version),
            "EZSP session established"
        );
        Ok(())
    }

    /// The `version` command, always in legacy framing.
    fn send_version(&mut self, desired: u8, timeout: Duration) -> Result<StackInfo, Error> {
        let seq = self.next_seq();
        let request = [seq, 0x00, 0x00, desired];
        let response = self.ash.command(&request, timeout)?;

        if response.len() < 7 || response[0] != seq || response[1] & 0x80 == 0 {
            return Err(Error::Protocol(format!(
                "malformed version response: {response:02X?}"
            )));
        }

        Ok(StackInfo {
            protocol_version: response[3],
            stack_type: response[4],
            stack_version: u16::from_le_bytes([response[5], response[6]]),
        })
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    /// Send a command and return its response parameters.
    fn command(
        &mut self,
        frame_id: FrameId,
        params: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let id = frame_id.id(self.protocol_version);
        let seq = self.next_seq();
        let mut request = vec![seq, 0x00];

        if self.protocol_version >= EXTENDED_FRAME_FORMAT_VERSION {
            request.push(0x01);
            request.extend_from_slice(&id.to_le_bytes());
        } else {
            request.push(id as u8);
        }
        request.extend_from_slice(params);

        let response = self.ash.command(&request, timeout)?;
        let header_len = if self.protocol_version >= EXTENDED_FRAME_FORMAT_VERSION {
            5
        } else {
            3
        };

        if response.len() < header_len {
            return Err(Error::Protocol(format!(
                "EZSP response too short: {response:02X?}"
            )));
        }

        if response[0] != seq {
            return Err(Error::Protocol(format!(
                "EZSP sequence mismatch: sent {seq}, got {}",
                response[0]
            )));
        }

        if response[1] & 0x80 == 0 {
            return Err(Error::Protocol("EZSP frame is not a response".into()));
        }

        let response_id = if self.protocol_version >= EXTENDED_FRAME_FORMAT_VERSION {
            u16::from_le_bytes([response[3], response[4]])
        } else {
            response[2] as u16
        };

        if response_id != id {
            return Err(Error::Protocol(format!(
                "EZSP frame ID mismatch: sent {id:#06X}, got {response_id:#06X}"
            )));
        }

        Ok(response[header_len..].to_vec())
    }

    fn get_mfg_token(&mut self, token: u8, timeout: Duration) -> Result<Vec<u8>, Error> {
        let response = self.command(FrameId::GetMfgToken, &[token], timeout)?;

        let length = *response
            .first()
            .ok_or_else(|| Error::Protocol("empty getMfgToken response".into()))?
            as usize;

        if response.len() < 1 + length {
            return Err(Error::Protocol(format!(
                "getMfgToken reports {length} bytes but carries {}",
                response.len() - 1
            )));
        }

        Ok(response[1..1 + length].to_vec())
    }

    /// Read the manufacturing build string and parse it as the running
    /// application version (e.g. `7.1.3.0 GA` reads as `7.1.3.0`).
    pub fn app_version(&mut self, timeout: Duration) -> Result<Version, Error> {
        let token = self.get_mfg_token(MFG_STRING, timeout)?;
        let text = String::from_utf8_lossy(&token);
        let text = text.trim_end_matches('\0').trim();

        parse_build_string(text).ok_or_else(|| {
            Error::Protocol(format!("cannot parse version from build string {text:?}"))
        })
    }

    /// Reboot the NCP into the Gecko bootloader. The link drops on success.
    pub fn launch_bootloader(&mut self, timeout: Duration) -> Result<(), Error> {
        let response = self.command(
            FrameId::LaunchStandaloneBootloader,
            &[STANDALONE_BOOTLOADER_MODE],
            timeout,
        )?;

        match response.first() {
            Some(&EMBER_SUCCESS) => Ok(()),
            Some(&status) => Err(Error::Protocol(format!(
                "EmberZNet refused to enter the bootloader (status {status:#04X})"
            ))),
            None => Err(Error::Protocol("empty launch bootloader response".into())),
        }
    }

    pub fn get_eui64(&mut self, timeout: Duration) -> Result<Eui64, Error> {
        let response = self.command(FrameId::GetEui64, &[], timeout)?;

        Eui64::from_wire(&response).ok_or_else(|| {
            Error::Protocol(format!("malformed getEui64 response: {response:02X?}"))
        })
    }

    /// Whether the custom EUI-64 token can still be written. The token is
    /// one-time-programmable: once burned, only an identical write is
    /// acceptable.
    pub fn can_write_custom_eui64(&mut self, timeout: Duration) -> Result<bool, Error> {
        let token = self.get_mfg_token(MFG_CUSTOM_EUI_64, timeout)?;
        Ok(token.iter().all(|&b| b == 0xFF))
    }

    pub fn write_custom_eui64(&mut self, eui64: Eui64, timeout: Duration) -> Result<(), Error> {
        let mut params = vec![MFG_CUSTOM_EUI_64, 8];
        params.extend_from_slice(&eui64.wire_bytes());

        let response = self.command(FrameId::SetMfgToken, &params, timeout)?;

        match response.first() {
            Some(&EMBER_SUCCESS) => Ok(()),
            Some(&status) => Err(Error::Protocol(format!(
                "failed to write EUI-64 token (status {status:#04X})"
            ))),
            None => Err(Error::Protocol("empty setMfgToken response".into())),
        }
    }
}

/// Extract a version from an EmberZNet build string: the leading dotted
/// numeric token plus an optional `build N` suffix.
fn parse_build_string(text: &str) -> Option<Version> {
    let mut words = text.split_whitespace();
    let core = words.next()?;

    match (words.next(), words.next()) {
        (Some("build"), Some(n)) => Version::new(&format!("{core} build {n}")),
        _ => Version::new(core),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ash::AshFrame;
    use crate::transport::MockTransport;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn ncp_data(frm_num: u8, ack_num: u8, payload: &[u8]) -> Vec<u8> {
        AshFrame::Data {
            frm_num,
            ack_num,
            retx: false,
            payload: payload.to_vec(),
        }
        .serialize()
    }

    fn rstack() -> Vec<u8> {
        AshFrame::RstAck { version: 2, code: 0x02 }.serialize()
    }

    #[test]
    fn test_probe_version_exchange() {
        let mut mock = MockTransport::new();
        mock.queue_read(&rstack());
        // version(4): stack type 2, stack version 0x6771.
        mock.queue_read(&ncp_data(0, 1, &[0x00, 0x80, 0x00, 0x04, 0x02, 0x71, 0x67]));
        // getMfgToken(MFG_STRING) -> "7.1.3.0 GA"
        let mut token_rsp = vec![0x01, 0x80, 0x0B, 10];
        token_rsp.extend_from_slice(b"7.1.3.0 GA");
        mock.queue_read(&ncp_data(1, 2, &token_rsp));

        let mut client = EzspClient::connect(&mut mock, TIMEOUT).unwrap();
        assert_eq!(client.protocol_version(), 4);
        assert_eq!(client.stack_info().stack_type, 2);
        assert_eq!(client.stack_info().stack_version, 0x6771);

        let version = client.app_version(TIMEOUT).unwrap();
        assert_eq!(version.to_string(), "7.1.3.0");
        assert_eq!(version, Version::new("7.1.3.0").unwrap());
    }

    #[test]
    fn test_version_renegotiation() {
        let mut mock = MockTransport::new();
        mock.queue_read(&rstack());
        // NCP supports v13; the host re-sends version(13).
        mock.queue_read(&ncp_data(0, 1, &[0x00, 0x80, 0x00, 0x0D, 0x02, 0x00, 0x74]));
        mock.queue_read(&ncp_data(1, 2, &[0x01, 0x80, 0x00, 0x0D, 0x02, 0x00, 0x74]));

        let client = EzspClient::connect(&mut mock, TIMEOUT).unwrap();
        assert_eq!(client.protocol_version(), 13);

        // Both version commands go out in legacy framing.
        let writes = mock.writes();
        let mut framer = crate::ash::AshFramer::new();
        for write in writes {
            framer.push(write);
        }

        let mut datas = Vec::new();
        while let Ok(Some(frame)) = framer.next_frame() {
            if let AshFrame::Data { payload, .. } = frame {
                datas.push(payload);
            }
        }

        assert_eq!(datas[0], vec![0x00, 0x00, 0x00, 0x04]);
        assert_eq!(datas[1], vec![0x01, 0x00, 0x00, 0x0D]);
    }

    #[test]
    fn test_extended_framing_after_negotiation() {
        let mut mock = MockTransport::new();
        mock.queue_read(&rstack());
        mock.queue_read(&ncp_data(0, 1, &[0x00, 0x80, 0x00, 0x0D, 0x02, 0x00, 0x74]));
        mock.queue_read(&ncp_data(1, 2, &[0x01, 0x80, 0x00, 0x0D, 0x02, 0x00, 0x74]));
        // launchStandaloneBootloader response, extended framing.
        mock.queue_read(&ncp_data(2, 3, &[0x02, 0x80, 0x01, 0x8F, 0x00, 0x00]));

        let mut client = EzspClient::connect(&mut mock, TIMEOUT).unwrap();
        client.launch_bootloader(TIMEOUT).unwrap();

        let mut framer = crate::ash::AshFramer::new();
        for write in mock.writes() {
            framer.push(write);
        }

        let mut last_data = None;
        while let Ok(Some(frame)) = framer.next_frame() {
            if let AshFrame::Data { payload, .. } = frame {
                last_data = Some(payload);
            }
        }

        assert_eq!(
            last_data.unwrap(),
            vec![0x02, 0x00, 0x01, 0x8F, 0x00, 0x01]
        );
    }

    #[test]
    fn test_launch_bootloader_failure_status() {
        let mut mock = MockTransport::new();
        mock.queue_read(&rstack());
        mock.queue_read(&ncp_data(0, 1, &[0x00, 0x80, 0x00, 0x04, 0x02, 0x71, 0x67]));
        mock.queue_read(&ncp_data(1, 2, &[0x01, 0x80, 0x8F, 0x01]));

        let mut client = EzspClient::connect(&mut mock, TIMEOUT).unwrap();
        assert!(matches!(
            client.launch_bootloader(TIMEOUT),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_eui64_parsing() {
        let eui: Eui64 = "aa:bb:cc:dd:ee:ff:00:11".parse().unwrap();
        assert_eq!(eui.0, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11]);
        assert_eq!(eui.to_string(), "aa:bb:cc:dd:ee:ff:00:11");

        let bare: Eui64 = "AABBCCDDEEFF0011".parse().unwrap();
        assert_eq!(bare, eui);

        assert_eq!(
            eui.wire_bytes(),
            [0x11, 0x00, 0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]
        );
        assert_eq!(Eui64::from_wire(&eui.wire_bytes()), Some(eui));

        assert!("aa:bb".parse::<Eui64>().is_err());
        assert!("zz:bb:cc:dd:ee:ff:00:11".parse::<Eui64>().is_err());
    }

    #[test]
    fn test_parse_build_string() {
        assert_eq!(
            parse_build_string("7.1.3.0 GA").unwrap().to_string(),
            "7.1.3.0"
        );
        assert_eq!(
            parse_build_string("7.2.2.0 build 190").unwrap().build(),
            Some(190)
        );
        assert!(parse_build_string("BL >").is_none());
    }
}
