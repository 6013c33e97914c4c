//! CPC (Co-Processor Communication) session.
//!
//! Only the unnumbered system-endpoint commands needed to identify a CPC
//! secondary and reboot it into the bootloader are implemented. Transport
//! frames are `[flag, len_lo, len_hi, endpoint, control, hcs_lo, hcs_hi]`
//! followed by the payload and a payload FCS; both checksums are
//! CRC-16/CCITT-FALSE, little-endian on the wire.

use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt};
use crc::{Crc, CRC_16_IBM_3740};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::transport::Transport;
use crate::version::Version;

const CPC_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

const FLAG: u8 = 0x14;
const HEADER_LEN: usize = 7;

/// Endpoint 0 carries system commands; endpoint 15 answers the
/// secondary-side application version query.
pub const ENDPOINT_SYSTEM: u8 = 0;
pub const ENDPOINT_SECONDARY_VERSION: u8 = 15;

/// Unnumbered frame, poll/final: `(UNNUMBERED = 0b11) << 6 | 0x04`.
const CONTROL_UNNUMBERED_POLL_FINAL: u8 = 0xC4;

const CMD_RESET: u8 = 0x01;
const CMD_PROP_VALUE_GET: u8 = 0x02;
const CMD_PROP_VALUE_SET: u8 = 0x03;
const CMD_PROP_VALUE_IS: u8 = 0x06;

const PROP_SECONDARY_CPC_VERSION: u32 = 0x03;
const PROP_SECONDARY_APP_VERSION: u32 = 0x04;
const PROP_BOOTLOADER_REBOOT_MODE: u32 = 0x202;

const REBOOT_MODE_BOOTLOADER: u32 = 1;

const COMMAND_RETRIES: u32 = 3;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);
const BAD_FRAME_BUDGET: u32 = 10;

/// Raw CPC transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpcFrame {
    pub endpoint: u8,
    pub control: u8,
    pub payload: Vec<u8>,
}

impl CpcFrame {
    pub fn serialize(&self) -> Vec<u8> {
        // The length field counts the payload plus its two FCS bytes.
        let length = (self.payload.len() + 2) as u16;

        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + 2);
        out.push(FLAG);
        out.extend_from_slice(&length.to_le_bytes());
        out.push(self.endpoint);
        out.push(self.control);

        let hcs = CPC_CRC.checksum(&out);
        out.extend_from_slice(&hcs.to_le_bytes());

        out.extend_from_slice(&self.payload);
        let fcs = CPC_CRC.checksum(&self.payload);
        out.extend_from_slice(&fcs.to_le_bytes());
        out
    }
}

/// Restartable CPC frame decoder. Garbage before the flag byte is dropped
/// silently; a corrupt header or body consumes one byte and resyncs.
#[derive(Default)]
pub struct CpcFramer {
    buffer: Vec<u8>,
}

impl CpcFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn resync(&mut self) {
        self.buffer.drain(..1);
    }

    pub fn next_frame(&mut self) -> Result<Option<CpcFrame>, Error> {
        // Drop anything before a flag byte.
        match self.buffer.iter().position(|&b| b == FLAG) {
            Some(0) => {}
            Some(pos) => {
                self.buffer.drain(..pos);
            }
            None => {
                self.buffer.clear();
                return Ok(None);
            }
        }

        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut cursor = std::io::Cursor::new(&self.buffer[1..]);
        let length = cursor.read_u16::<LittleEndian>().expect("checked length") as usize;
        let endpoint = cursor.read_u8().expect("checked length");
        let control = cursor.read_u8().expect("checked length");
        let hcs = cursor.read_u16::<LittleEndian>().expect("checked length");

        if CPC_CRC.checksum(&self.buffer[..5]) != hcs {
            self.resync();
            return Err(Error::Framing("CPC header checksum mismatch".into()));
        }

        if length < 2 {
            self.resync();
            return Err(Error::Framing(format!("CPC length field too small: {length}")));
        }

        if self.buffer.len() < HEADER_LEN + length {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_LEN..HEADER_LEN + length - 2].to_vec();
        let fcs = u16::from_le_bytes([
            self.buffer[HEADER_LEN + length - 2],
            self.buffer[HEADER_LEN + length - 1],
        ]);

        if CPC_CRC.checksum(&payload) != fcs {
            self.resync();
            return Err(Error::Framing("CPC payload checksum mismatch".into()));
        }

        self.buffer.drain(..HEADER_LEN + length);

        Ok(Some(CpcFrame {
            endpoint,
            control,
            payload,
        }))
    }
}

/// Unnumbered system command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnnumberedFrame {
    pub command_id: u8,
    pub seq: u8,
    pub payload: Vec<u8>,
}

impl UnnumberedFrame {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![self.command_id, self.seq];
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 4 {
            return Err(Error::Protocol("unnumbered frame too short".into()));
        }

        let length = u16::from_le_bytes([data[2], data[3]]) as usize;
        if data.len() < 4 + length {
            return Err(Error::Protocol("unnumbered frame payload truncated".into()));
        }

        Ok(Self {
            command_id: data[0],
            seq: data[1],
            payload: data[4..4 + length].to_vec(),
        })
    }
}

/// Minimal CPC session holding an exclusive borrow of the transport.
pub struct CpcSession<'a, T: Transport> {
    transport: &'a mut T,
    framer: CpcFramer,
    seq: u8,
    bad_frames: u32,
}

impl<'a, T: Transport> CpcSession<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            framer: CpcFramer::new(),
            seq: 0,
            bad_frames: 0,
        }
    }

    /// Identify the secondary by reading its CPC version triple.
    pub fn probe(&mut self, timeout: Duration) -> Result<Version, Error> {
        let response = self.send_unnumbered(
            ENDPOINT_SYSTEM,
            CMD_PROP_VALUE_GET,
            &prop_payload(PROP_SECONDARY_CPC_VERSION, &[]),
            timeout,
        )?;

        let value = expect_property(&response, PROP_SECONDARY_CPC_VERSION)?;
        if value.len() != 12 {
            return Err(Error::Protocol(format!(
                "CPC version property is {} bytes, expected 12",
                value.len()
            )));
        }

        let mut cursor = std::io::Cursor::new(value);
        let major = cursor.read_u32::<LittleEndian>().expect("checked length");
        let minor = cursor.read_u32::<LittleEndian>().expect("checked length");
        let patch = cursor.read_u32::<LittleEndian>().expect("checked length");

        let version = Version::new(&format!("{major}.{minor}.{patch}"))
            .ok_or_else(|| Error::Protocol("unparseable CPC version".into()))?;

        debug!(version = %version, "CPC secondary identified");
        Ok(version)
    }

    /// Read the application version string the secondary reports on the
    /// version query endpoint.
    pub fn secondary_app_version(&mut self, timeout: Duration) -> Result<Version, Error> {
        let response = self.send_unnumbered(
            ENDPOINT_SECONDARY_VERSION,
            CMD_PROP_VALUE_GET,
            &prop_payload(PROP_SECONDARY_APP_VERSION, &[]),
            timeout,
        )?;

        let value = expect_property(&response, PROP_SECONDARY_APP_VERSION)?;
        let text = value.split(|&b| b == 0).next().unwrap_or(&[]);
        let text = String::from_utf8_lossy(text);

        Version::new(&text).ok_or_else(|| {
            Error::Protocol(format!("cannot parse secondary app version {text:?}"))
        })
    }

    /// Arm the bootloader reboot mode, then reset the secondary. The link
    /// drops once the reset takes; the reset response itself is
    /// best-effort.
    pub fn launch_bootloader(&mut self, timeout: Duration) -> Result<(), Error> {
        self.send_unnumbered(
            ENDPOINT_SYSTEM,
            CMD_PROP_VALUE_SET,
            &prop_payload(
                PROP_BOOTLOADER_REBOOT_MODE,
                &REBOOT_MODE_BOOTLOADER.to_le_bytes(),
            ),
            timeout,
        )?;

        match self.send_unnumbered(ENDPOINT_SYSTEM, CMD_RESET, &[], timeout) {
            Ok(_) | Err(Error::Timeout { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Send an unnumbered frame and wait for the response carrying the
    /// same command sequence number.
    fn send_unnumbered(
        &mut self,
        endpoint: u8,
        command_id: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<UnnumberedFrame, Error> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        let frame = CpcFrame {
            endpoint,
            control: CONTROL_UNNUMBERED_POLL_FINAL,
            payload: UnnumberedFrame {
                command_id,
                seq,
                payload: payload.to_vec(),
            }
            .serialize(),
        };
        let wire = frame.serialize();

        for attempt in 0..=COMMAND_RETRIES {
            trace!(endpoint = endpoint, command = command_id, seq = seq, "Sending CPC frame");
            self.transport.write_all(&wire)?;

            let deadline = Instant::now() + timeout.min(COMMAND_TIMEOUT);
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }

                let frame = match self.read_frame(remaining) {
                    Ok(frame) => frame,
                    Err(Error::Timeout { .. }) => break,
                    Err(e) => return Err(e),
                };

                match UnnumberedFrame::parse(&frame.payload) {
                    Ok(unnumbered) if unnumbered.seq == seq => return Ok(unnumbered),
                    Ok(unnumbered) => {
                        trace!(seq = unnumbered.seq, "Dropping unsolicited CPC frame")
                    }
                    Err(e) => warn!(error = %e, "Undecodable CPC subframe"),
                }
            }

            debug!(
                attempt = attempt + 1,
                retries = COMMAND_RETRIES + 1,
                "CPC command unanswered, retrying"
            );
        }

        Err(Error::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<CpcFrame, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.framer.next_frame() {
                Ok(Some(frame)) => {
                    self.bad_frames = 0;
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) => {
                    self.bad_frames += 1;
                    warn!(error = %e, count = self.bad_frames, "Dropping bad CPC frame");

                    if self.bad_frames >= BAD_FRAME_BUDGET {
                        return Err(Error::SessionFailed(
                            "too many consecutive bad frames".into(),
                        ));
                    }
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
}

fn prop_payload(prop: u32, value: &[u8]) -> Vec<u8> {
    let mut out = prop.to_le_bytes().to_vec();
    out.extend_from_slice(value);
    out
}

/// Validate a `PROP_VALUE_IS` response for `prop` and return its value.
fn expect_property(frame: &UnnumberedFrame, prop: u32) -> Result<&[u8], Error> {
    if frame.command_id != CMD_PROP_VALUE_IS {
        return Err(Error::Protocol(format!(
            "expected PROP_VALUE_IS, got command {:#04X}",
            frame.command_id
        )));
    }

    if frame.payload.len() < 4 {
        return Err(Error::Protocol("property response too short".into()));
    }

    let got = u32::from_le_bytes(frame.payload[..4].try_into().expect("4 bytes"));
    if got != prop {
        return Err(Error::Protocol(format!(
            "property mismatch: asked for {prop:#X}, got {got:#X}"
        )));
    }

    Ok(&frame.payload[4..])
}
