//! Spinel (OpenThread host–NCP) session over HDLC-lite framing.
//!
//! HDLC-lite frames are delimited by `0x7E` flags, escape reserved bytes
//! with `0x7D, b ^ 0x20`, and end with a little-endian CRC-16/X-25 over
//! the unescaped content. Spinel command and property IDs use the packed
//! 7-bit little-endian varint encoding.

use std::time::{Duration, Instant};

use crc::{Crc, CRC_16_IBM_SDLC};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::transport::Transport;
use crate::version::Version;

const HDLC_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const XON: u8 = 0x11;
const XOFF: u8 = 0x13;
const VENDOR: u8 = 0xF8;

const RESERVED: [u8; 5] = [FLAG, ESCAPE, XON, XOFF, VENDOR];

pub const CMD_RESET: u32 = 1;
pub const CMD_PROP_VALUE_GET: u32 = 2;
pub const CMD_PROP_VALUE_SET: u32 = 3;
pub const CMD_PROP_VALUE_IS: u32 = 6;

pub const PROP_NCP_VERSION: u32 = 2;
pub const PROP_CAPS: u32 = 5;

/// `CMD_RESET` argument requesting the Gecko bootloader.
const RESET_BOOTLOADER: u8 = 3;

const COMMAND_RETRIES: u32 = 3;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);
const BAD_FRAME_BUDGET: u32 = 10;

/// Encode an unsigned integer as a Spinel packed varint (7 bits per
/// octet, least significant first, continuation bit on all but the last).
pub fn encode_packed(mut value: u32) -> Vec<u8> {
    let mut out = Vec::new();

    loop {
        let chunk = (value & 0x7F) as u8;
        value >>= 7;

        if value == 0 {
            out.push(chunk);
            break;
        }
        out.push(chunk | 0x80);
    }

    out
}

/// Decode a packed varint, returning the value and the bytes consumed.
pub fn decode_packed(data: &[u8]) -> Result<(u32, usize), Error> {
    let mut value: u32 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 4 {
            return Err(Error::Protocol("packed integer too long".into()));
        }

        value |= ((byte & 0x7F) as u32) << (7 * i);

        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    Err(Error::Protocol("truncated packed integer".into()))
}

/// Wrap `data` in an HDLC-lite frame.
pub fn hdlc_encode(data: &[u8]) -> Vec<u8> {
    let mut payload = data.to_vec();
    let crc = HDLC_CRC.checksum(data);
    payload.extend_from_slice(&crc.to_le_bytes());

    let mut out = vec![FLAG];
    for &byte in &payload {
        if RESERVED.contains(&byte) {
            out.push(ESCAPE);
            out.push(byte ^ 0x20);
        } else {
            out.push(byte);
        }
    }
    out.push(FLAG);
    out
}

/// Restartable HDLC-lite decoder. Flag bytes may appear between frames
/// any number of times; empty inter-frame chunks are ignored.
#[derive(Default)]
pub struct HdlcFramer {
    buffer: Vec<u8>,
}

impl HdlcFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Decode the next frame's unescaped content.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            let flag_pos = match self.buffer.iter().position(|&b| b == FLAG) {
                Some(pos) => pos,
                None => return Ok(None),
            };

            let chunk: Vec<u8> = self.buffer.drain(..=flag_pos).collect();
            let chunk = &chunk[..chunk.len() - 1];

            if chunk.is_empty() {
                continue;
            }

            let mut unescaped = Vec::with_capacity(chunk.len());
            let mut escaping = false;
            for &byte in chunk {
                if escaping {
                    unescaped.push(byte ^ 0x20);
                    escaping = false;
                } else if byte == ESCAPE {
                    escaping = true;
                } else {
                    unescaped.push(byte);
                }
            }
            if escaping {
                return Err(Error::Framing("dangling HDLC escape".into()));
            }

            if unescaped.len() < 3 {
                return Err(Error::Framing(format!(
                    "HDLC frame too short: {} bytes",
                    unescaped.len()
                )));
            }

            let (data, crc_bytes) = unescaped.split_at(unescaped.len() - 2);
            let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
            let computed = HDLC_CRC.checksum(data);

            if computed != expected {
                return Err(Error::Framing(format!(
                    "HDLC CRC mismatch: expected {expected:#06X}, computed {computed:#06X}"
                )));
            }

            return Ok(Some(data.to_vec()));
        }
    }
}

/// A Spinel frame: header byte, packed command, raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpinelFrame {
    pub header: u8,
    pub command: u32,
    pub payload: Vec<u8>,
}

impl SpinelFrame {
    pub fn new(tid: u8, command: u32, payload: Vec<u8>) -> Self {
        Self {
            header: 0x80 | (tid & 0x0F),
            command,
            payload,
        }
    }

    pub fn tid(&self) -> u8 {
        self.header & 0x0F
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![self.header];
        out.extend_from_slice(&encode_packed(self.command));
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let header = *data
            .first()
            .ok_or_else(|| Error::Protocol("empty Spinel frame".into()))?;

        // The two flag bits must be 0b10.
        if header & 0xC0 != 0x80 {
            return Err(Error::Protocol(format!(
                "invalid Spinel header {header:#04X}"
            )));
        }

        let (command, consumed) = decode_packed(&data[1..])?;

        Ok(Self {
            header,
            command,
            payload: data[1 + consumed..].to_vec(),
        })
    }
}

/// Minimal Spinel session holding an exclusive borrow of the transport.
pub struct SpinelSession<'a, T: Transport> {
    transport: &'a mut T,
    framer: HdlcFramer,
    tid: u8,
    bad_frames: u32,
}

impl<'a, T: Transport> SpinelSession<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            framer: HdlcFramer::new(),
            tid: 0,
            bad_frames: 0,
        }
    }

    /// Identify the firmware by reading `PROP_NCP_VERSION`.
    pub fn probe(&mut self, timeout: Duration) -> Result<Version, Error> {
        let response = self.send_command(
            CMD_PROP_VALUE_GET,
            encode_packed(PROP_NCP_VERSION),
            timeout,
        )?;

        let value = expect_property(&response, PROP_NCP_VERSION)?;
        let text = value.split(|&b| b == 0).next().unwrap_or(&[]);
        let text = String::from_utf8_lossy(text);

        // `SL-OPENTHREAD/2.2.2.0_GitHub-91fa1f455; EFR32; Mar 14 2023`:
        // the build date after the first semicolon is not stable.
        let short = text.split(';').next().unwrap_or(&text).trim();

        let version = Version::new(short)
            .ok_or_else(|| Error::Protocol(format!("cannot parse NCP version {text:?}")))?;

        debug!(version = %version, "Spinel NCP identified");
        Ok(version)
    }

    /// Read the NCP's capability list.
    pub fn caps(&mut self, timeout: Duration) -> Result<Vec<u32>, Error> {
        let response =
            self.send_command(CMD_PROP_VALUE_GET, encode_packed(PROP_CAPS), timeout)?;

        let mut value = expect_property(&response, PROP_CAPS)?;
        let mut caps = Vec::new();

        while !value.is_empty() {
            let (cap, consumed) = decode_packed(value)?;
            caps.push(cap);
            value = &value[consumed..];
        }

        Ok(caps)
    }

    /// Reboot into the Gecko bootloader. The NCP does not answer; the
    /// link simply drops.
    pub fn launch_bootloader(&mut self) -> Result<(), Error> {
        let frame = SpinelFrame::new(self.next_tid(), CMD_RESET, vec![RESET_BOOTLOADER]);
        self.transport.write_all(&hdlc_encode(&frame.serialize()))?;
        Ok(())
    }

    fn next_tid(&mut self) -> u8 {
        // TID 0 is reserved for unsolicited frames; cycle through 1..=15.
        self.tid = (self.tid % 15) + 1;
        self.tid
    }

    /// Send a command and wait for the response with a matching TID.
    fn send_command(
        &mut self,
        command: u32,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<SpinelFrame, Error> {
        let tid = self.next_tid();
        let frame = SpinelFrame::new(tid, command, payload);
        let wire = hdlc_encode(&frame.serialize());

        for attempt in 0..=COMMAND_RETRIES {
            trace!(tid = tid, command = command, "Sending Spinel frame");
            self.transport.write_all(&wire)?;

            let deadline = Instant::now() + timeout.min(COMMAND_TIMEOUT);
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }

                let response = match self.read_frame(remaining) {
                    Ok(frame) => frame,
                    Err(Error::Timeout { .. }) => break,
                    Err(e) => return Err(e),
                };

                if response.tid() == tid {
                    return Ok(response);
                }
                trace!(tid = response.tid(), "Dropping unmatched Spinel frame");
            }

            debug!(
                attempt = attempt + 1,
                retries = COMMAND_RETRIES + 1,
                "Spinel command unanswered, retrying"
            );
        }

        Err(Error::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<SpinelFrame, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.framer.next_frame() {
                Ok(Some(data)) => match SpinelFrame::parse(&data) {
                    Ok(frame) => {
                        self.bad_frames = 0;
                        return Ok(frame);
                    }
                    Err(e) => {
                        warn!(error = %e, "Undecodable Spinel frame");
                        self.count_bad_frame()?;
                        continue;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Dropping bad HDLC frame");
                    self.count_bad_frame()?;
                    continue;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            let mut buf = [0u8; 256];
            let n = self.transport.read_with_deadline(&mut buf, remaining)?;
            self.framer.push(&buf[..n]);
        }
    }

    fn count_bad_frame(&mut self) -> Result<(), Error> {
        self.bad_frames += 1;

        if self.bad_frames >= BAD_FRAME_BUDGET {
            return Err(Error::SessionFailed(
                "too many consecutive bad frames".into(),
            ));
        }
        Ok(())
    }
}

/// Validate a `PROP_VALUE_IS` response for `prop` and return its value.
fn expect_property(frame: &SpinelFrame, prop: u32) -> Result<&[u8], Error> {
    if frame.command != CMD_PROP_VALUE_IS {
        return Err(Error::Protocol(format!(
            "expected PROP_VALUE_IS, got command {}",
            frame.command
        )));
    }

    let (got, consumed) = decode_packed(&frame.payload)?;
    if got != prop {
        return Err(Error::Protocol(format!(
            "property mismatch: asked for {prop}, got {got}"
        )));
    }

    Ok(&frame.payload[consumed..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    const TIMEOUT: Duration = Duration::from_secs(1);

    const NCP_VERSION: &str = "SL-OPENTHREAD/2.2.2.0_GitHub-91fa1f455; EFR32; Mar 14 2023 16:03:40";

    fn prop_is_frame(tid: u8, prop: u32, value: &[u8]) -> Vec<u8> {
        let mut payload = encode_packed(prop);
        payload.extend_from_slice(value);
        hdlc_encode(&SpinelFrame::new(tid, CMD_PROP_VALUE_IS, payload).serialize())
    }

    #[test]
    fn test_packed_encoding() {
        assert_eq!(encode_packed(0), vec![0x00]);
        assert_eq!(encode_packed(127), vec![0x7F]);
        assert_eq!(encode_packed(128), vec![0x80, 0x01]);
        assert_eq!(encode_packed(300), vec![0xAC, 0x02]);

        for value in [0u32, 1, 127, 128, 300, 16384, 0x1F_FFFF] {
            let encoded = encode_packed(value);
            assert_eq!(decode_packed(&encoded).unwrap(), (value, encoded.len()));
        }
    }

    #[test]
    fn test_x25_check_value() {
        assert_eq!(HDLC_CRC.checksum(b"123456789"), 0x906E);
    }

    #[test]
    fn test_hdlc_roundtrip() {
        let data = vec![0x81, 0x02, 0x7E, 0x7D, 0x11, 0x13, 0xF8, 0x42];
        let wire = hdlc_encode(&data);

        let mut framer = HdlcFramer::new();
        framer.push(&wire);
        assert_eq!(framer.next_frame().unwrap(), Some(data));
    }

    #[test]
    fn test_interframe_flags_ignored() {
        let mut framer = HdlcFramer::new();
        framer.push(&[FLAG, FLAG]);
        framer.push(&hdlc_encode(&[0x81, 0x06]));
        framer.push(&[FLAG]);

        assert_eq!(framer.next_frame().unwrap(), Some(vec![0x81, 0x06]));
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    #[test]
    fn test_hdlc_crc_mismatch() {
        let mut wire = hdlc_encode(&[0x81, 0x06]);
        wire[1] ^= 0x40;

        let mut framer = HdlcFramer::new();
        framer.push(&wire);
        assert!(matches!(framer.next_frame(), Err(Error::Framing(_))));
    }

    #[test]
    fn test_spinel_frame_parse() {
        let frame = SpinelFrame::new(7, CMD_PROP_VALUE_GET, encode_packed(PROP_NCP_VERSION));
        let parsed = SpinelFrame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(parsed.tid(), 7);

        assert!(SpinelFrame::parse(&[0x40, 0x02]).is_err());
    }

    #[test]
    fn test_probe_version() {
        let mut mock = MockTransport::new();
        mock.queue_read(&prop_is_frame(1, PROP_NCP_VERSION, NCP_VERSION.as_bytes()));

        let mut session = SpinelSession::new(&mut mock);
        let version = session.probe(TIMEOUT).unwrap();

        assert_eq!(version.components(), &[2, 2, 2, 0]);
        assert_eq!(version.to_string(), "SL-OPENTHREAD/2.2.2.0_GitHub-91fa1f455");
    }

    #[test]
    fn test_unmatched_tid_dropped() {
        let mut mock = MockTransport::new();
        mock.queue_read(&prop_is_frame(9, PROP_NCP_VERSION, NCP_VERSION.as_bytes()));
        mock.queue_read(&prop_is_frame(1, PROP_NCP_VERSION, NCP_VERSION.as_bytes()));

        let mut session = SpinelSession::new(&mut mock);
        assert!(session.probe(TIMEOUT).is_ok());
    }

    #[test]
    fn test_caps_list() {
        let mut value = Vec::new();
        for cap in [1u32, 2, 4, 512] {
            value.extend_from_slice(&encode_packed(cap));
        }

        let mut mock = MockTransport::new();
        mock.queue_read(&prop_is_frame(1, PROP_CAPS, &value));

        let mut session = SpinelSession::new(&mut mock);
        assert_eq!(session.caps(TIMEOUT).unwrap(), vec![1, 2, 4, 512]);
    }

    #[test]
    fn test_launch_bootloader_frame() {
        let mut mock = MockTransport::new();
        let mut session = SpinelSession::new(&mut mock);
        session.launch_bootloader().unwrap();

        let mut framer = HdlcFramer::new();
        framer.push(&mock.writes()[0]);
        let data = framer.next_frame().unwrap().unwrap();
        let frame = SpinelFrame::parse(&data).unwrap();

        assert_eq!(frame.command, CMD_RESET);
        assert_eq!(frame.payload, vec![RESET_BOOTLOADER]);
        assert_eq!(frame.tid(), 1);
    }
}
