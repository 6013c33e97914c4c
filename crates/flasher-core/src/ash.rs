//! ASH (Asynchronous Serial Host) link layer.
//!
//! ASH frames are byte-stuffed and terminated with a `0x7E` flag. DATA
//! frame payloads are XORed with a fixed pseudo-random sequence before
//! transmission, and every frame carries a big-endian CRC-16/CCITT-FALSE
//! over the control byte plus the payload as it appears on the wire.
//!
//! The session is a sliding window of one: a DATA frame is not followed by
//! another until it has been acknowledged, which keeps the host side free
//! of any background ACK timers.

use std::time::{Duration, Instant};

use crc::{Crc, CRC_16_IBM_3740};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::transport::Transport;

const ASH_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const XON: u8 = 0x11;
const XOFF: u8 = 0x13;
const SUBSTITUTE: u8 = 0x18;
const CANCEL: u8 = 0x1A;

const RESERVED: [u8; 6] = [FLAG, ESCAPE, XON, XOFF, SUBSTITUTE, CANCEL];

/// Consecutive undecodable frames tolerated before the session fails.
const BAD_FRAME_BUDGET: u32 = 10;

/// Time to wait for an ACK of a transmitted DATA frame.
const T_RX_ACK: Duration = Duration::from_millis(1600);

/// Retransmissions of a DATA frame before the session fails.
const TX_RETRIES: u32 = 3;

/// RST attempts during connection establishment.
const RESET_ATTEMPTS: u32 = 3;

/// XOR the buffer with the ASH pseudo-random sequence (seed 0x42).
fn randomize(data: &mut [u8]) {
    let mut state: u8 = 0x42;

    for byte in data {
        *byte ^= state;
        state = (state >> 1) ^ ((state & 1) * 0xB8);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AshFrame {
    Data {
        frm_num: u8,
        ack_num: u8,
        retx: bool,
        payload: Vec<u8>,
    },
    Ack {
        ack_num: u8,
    },
    Nak {
        ack_num: u8,
    },
    Rst,
    RstAck {
        version: u8,
        code: u8,
    },
    Error {
        version: u8,
        code: u8,
    },
}

impl AshFrame {
    /// Serialize to wire bytes, including stuffing and the trailing flag.
    pub fn serialize(&self) -> Vec<u8> {
        let mut body = Vec::new();

        match self {
            AshFrame::Data {
                frm_num,
                ack_num,
                retx,
                payload,
            } => {
                body.push((*frm_num << 4) | ((*retx as u8) << 3) | *ack_num);
                let start = body.len();
                body.extend_from_slice(payload);
                randomize(&mut body[start..]);
            }
            AshFrame::Ack { ack_num } => body.push(0x80 | *ack_num),
            AshFrame::Nak { ack_num } => body.push(0xA0 | *ack_num),
            AshFrame::Rst => body.push(0xC0),
            AshFrame::RstAck { version, code } => body.extend_from_slice(&[0xC1, *version, *code]),
            AshFrame::Error { version, code } => body.extend_from_slice(&[0xC2, *version, *code]),
        }

        let crc = ASH_CRC.checksum(&body);
        body.extend_from_slice(&crc.to_be_bytes());

        let mut out = Vec::with_capacity(body.len() + 2);
        for &byte in &body {
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

    /// Parse an unstuffed, CRC-stripped frame body.
    fn from_body(control: u8, data: &[u8]) -> Result<Self, Error> {
        match control {
            0xC0 => Ok(AshFrame::Rst),
            0xC1 | 0xC2 => {
                if data.len() != 2 {
                    return Err(Error::Framing(format!(
                        "control {control:#04X} frame with {} data bytes",
                        data.len()
                    )));
                }

                let (version, code) = (data[0], data[1]);
                Ok(if control == 0xC1 {
                    AshFrame::RstAck { version, code }
                } else {
                    AshFrame::Error { version, code }
                })
            }
            c if c & 0x80 == 0 => {
                let mut payload = data.to_vec();
                randomize(&mut payload);

                Ok(AshFrame::Data {
                    frm_num: (c >> 4) & 0x07,
                    ack_num: c & 0x07,
                    retx: c & 0x08 != 0,
                    payload,
                })
            }
            c if c & 0xE0 == 0x80 => Ok(AshFrame::Ack { ack_num: c & 0x07 }),
            c if c & 0xE0 == 0xA0 => Ok(AshFrame::Nak { ack_num: c & 0x07 }),
            c => Err(Error::Framing(format!("unknown control byte {c:#04X}"))),
        }
    }
}

/// Restartable ASH frame decoder. Bytes before the first flag are dropped
/// silently; a bad frame consumes its bytes so decoding resumes at the
/// next flag.
#[derive(Default)]
pub struct AshFramer {
    buffer: Vec<u8>,
}

impl AshFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Decode the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<AshFrame>, Error> {
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

            // A Cancel byte voids everything sent before it.
            let chunk = match chunk.iter().rposition(|&b| b == CANCEL) {
                Some(pos) => &chunk[pos + 1..],
                None => chunk,
            };
            if chunk.is_empty() {
                continue;
            }

            let mut body = Vec::with_capacity(chunk.len());
            let mut escaping = false;
            for &byte in chunk {
                if escaping {
                    body.push(byte ^ 0x20);
                    escaping = false;
                } else if byte == ESCAPE {
                    escaping = true;
                } else {
                    body.push(byte);
                }
            }
            if escaping {
                return Err(Error::Framing("dangling escape byte".into()));
            }

            if body.len() < 3 {
                return Err(Error::Framing(format!("frame too short: {} bytes", body.len())));
            }

            let (data, crc_bytes) = body.split_at(body.len() - 2);
            let expected = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
            let computed = ASH_CRC.checksum(data);

            if computed != expected {
                return Err(Error::Framing(format!(
                    "CRC mismatch: expected {expected:#06X}, computed {computed:#06X}"
                )));
            }

            return AshFrame::from_body(data[0], &data[1..]).map(Some);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AshState {
    Disconnected,
    Resetting,
    Connected,
    Failed,
}

/// Window-of-one ASH session over a borrowed transport.
pub struct AshSession<'a, T: Transport> {
    transport: &'a mut T,
    framer: AshFramer,
    state: AshState,
    tx_seq: u8,
    rx_seq: u8,
    bad_frames: u32,
}

impl<'a, T: Transport> AshSession<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            framer: AshFramer::new(),
            state: AshState::Disconnected,
            tx_seq: 0,
            rx_seq: 0,
            bad_frames: 0,
        }
    }

    /// Reset the NCP and wait for its RSTACK.
    pub fn connect(&mut self, timeout: Duration) -> Result<(), Error> {
        self.transport.reset_input_buffer()?;
        self.framer.clear();
        self.state = AshState::Resetting;

        let per_attempt = timeout / RESET_ATTEMPTS;

        for attempt in 0..RESET_ATTEMPTS {
            debug!(attempt = attempt + 1, "Sending ASH RST");
            self.transport.write_all(&AshFrame::Rst.serialize())?;

            let deadline = Instant::now() + per_attempt;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }

                match self.read_frame(remaining) {
                    Ok(AshFrame::RstAck { version, code }) => {
                        debug!(version = version, code = code, "NCP reset complete");
                        self.state = AshState::Connected;
                        self.tx_seq = 0;
                        self.rx_seq = 0;
                        return Ok(());
                    }
                    Ok(frame) => trace!(?frame, "Ignoring frame while resetting"),
                    Err(Error::Timeout { .. }) => break,
                    Err(e) => return Err(e),
                }
            }
        }

        self.state = AshState::Failed;
        Err(Error::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    /// Send one DATA frame and return the payload of the in-order DATA
    /// frame the NCP answers with.
    pub fn command(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, Error> {
        if self.state != AshState::Connected {
            return Err(Error::SessionFailed("ASH session is not connected".into()));
        }

        let frm_num = self.tx_seq;
        let expected_ack = (frm_num + 1) % 8;
        let deadline = Instant::now() + timeout;
        let mut retries = 0;
        let mut retx = false;

        self.send_data(frm_num, retx, payload)?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            match self.read_frame(remaining.min(T_RX_ACK)) {
                Ok(AshFrame::Ack { ack_num }) => {
                    if ack_num == expected_ack {
                        self.tx_seq = expected_ack;
                    }
                }
                Ok(AshFrame::Nak { .. }) => {
                    retries += 1;
                    if retries > TX_RETRIES {
                        self.state = AshState::Failed;
                        return Err(Error::SessionFailed("NCP rejected frame repeatedly".into()));
                    }
                    retx = true;
                    self.send_data(frm_num, retx, payload)?;
                }
                Ok(AshFrame::Data {
                    frm_num: their_frm,
                    ack_num,
                    payload: response,
                    ..
                }) => {
                    if ack_num == expected_ack {
                        self.tx_seq = expected_ack;
                    }

                    if their_frm == self.rx_seq {
                        self.rx_seq = (self.rx_seq + 1) % 8;
                        self.send_ack()?;
                        return Ok(response);
                    }

                    // Duplicate or stale frame: re-acknowledge our position.
                    trace!(frm = their_frm, expected = self.rx_seq, "Re-acking stale DATA");
                    self.send_ack()?;
                }
                Ok(AshFrame::Error { code, .. }) => {
                    self.state = AshState::Failed;
                    return Err(Error::SessionFailed(format!(
                        "NCP entered error state (code {code:#04X})"
                    )));
                }
                Ok(AshFrame::RstAck { .. }) => {
                    self.state = AshState::Failed;
                    return Err(Error::SessionFailed("NCP reset unexpectedly".into()));
                }
                Ok(AshFrame::Rst) => {}
                Err(Error::Timeout { .. }) => {
                    retries += 1;
                    if retries > TX_RETRIES {
                        self.state = AshState::Failed;
                        return Err(Error::SessionFailed(
                            "no acknowledgement from NCP after retries".into(),
                        ));
                    }

                    warn!(frm = frm_num, retry = retries, "ACK timeout, retransmitting");
                    self.transport
                        .write_all(&AshFrame::Nak { ack_num: self.rx_seq }.serialize())?;
                    retx = true;
                    self.send_data(frm_num, retx, payload)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn send_data(&mut self, frm_num: u8, retx: bool, payload: &[u8]) -> Result<(), Error> {
        let frame = AshFrame::Data {
            frm_num,
            ack_num: self.rx_seq,
            retx,
            payload: payload.to_vec(),
        };
        self.transport.write_all(&frame.serialize())?;
        Ok(())
    }

    fn send_ack(&mut self) -> Result<(), Error> {
        self.transport
            .write_all(&AshFrame::Ack { ack_num: self.rx_seq }.serialize())?;
        Ok(())
    }

    /// Read frames off the transport, tolerating up to a budget of
    /// consecutive bad frames.
    fn read_frame(&mut self, timeout: Duration) -> Result<AshFrame, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.framer.next_frame() {
                Ok(Some(frame)) => {
                    self.bad_frames = 0;
                    trace!(?frame, "Received ASH frame");
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) => {
                    self.bad_frames += 1;
                    warn!(error = %e, count = self.bad_frames, "Dropping bad ASH frame");

                    if self.bad_frames >= BAD_FRAME_BUDGET {
                        self.state = AshState::Failed;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_pseudo_random_sequence() {
        let mut data = vec![0u8; 5];
        randomize(&mut data);
        assert_eq!(data, vec![0x42, 0x21, 0xA8, 0x54, 0x2A]);
    }

    #[test]
    fn test_randomize_is_involution() {
        let mut data = b"hello ash".to_vec();
        randomize(&mut data);
        randomize(&mut data);
        assert_eq!(data, b"hello ash");
    }

    #[test]
    fn test_rst_frame_bytes() {
        // CRC-16/CCITT-FALSE of 0xC0 is 0x38BC.
        assert_eq!(AshFrame::Rst.serialize(), vec![0xC0, 0x38, 0xBC, 0x7E]);
    }

    #[test]
    fn test_data_frame_roundtrip() {
        let frame = AshFrame::Data {
            frm_num: 3,
            ack_num: 5,
            retx: false,
            payload: vec![0x00, 0x00, 0x00, 0x04],
        };

        let mut framer = AshFramer::new();
        framer.push(&frame.serialize());
        assert_eq!(framer.next_frame().unwrap(), Some(frame));
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    #[test]
    fn test_reserved_bytes_are_stuffed() {
        // 0x42 ^ 0x7E = 0x3C: a payload starting with 0x3C randomizes to
        // the flag byte, which must get escaped on the wire.
        let frame = AshFrame::Data {
            frm_num: 0,
            ack_num: 0,
            retx: false,
            payload: vec![0x3C, 0x11, 0x13],
        };

        let wire = frame.serialize();
        assert_eq!(wire.iter().filter(|&&b| b == FLAG).count(), 1);
        assert_eq!(*wire.last().unwrap(), FLAG);

        let mut framer = AshFramer::new();
        framer.push(&wire);
        assert_eq!(framer.next_frame().unwrap(), Some(frame));
    }

    #[test]
    fn test_garbage_before_flag_is_dropped() {
        let mut framer = AshFramer::new();
        let mut bytes = vec![0x00, 0x01, 0x02, FLAG];
        bytes.extend_from_slice(&AshFrame::Rst.serialize());
        framer.push(&bytes);

        // The garbage chunk fails CRC; the real frame decodes next.
        assert!(framer.next_frame().is_err());
        assert_eq!(framer.next_frame().unwrap(), Some(AshFrame::Rst));
    }

    #[test]
    fn test_cancel_voids_partial_frame() {
        let mut framer = AshFramer::new();
        let mut bytes = vec![0x00, 0x01, CANCEL];
        bytes.extend_from_slice(&AshFrame::Rst.serialize());
        framer.push(&bytes);

        assert_eq!(framer.next_frame().unwrap(), Some(AshFrame::Rst));
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut wire = AshFrame::Rst.serialize();
        wire[1] ^= 0xFF;

        let mut framer = AshFramer::new();
        framer.push(&wire);
        assert!(matches!(framer.next_frame(), Err(Error::Framing(_))));
    }

    #[test]
    fn test_connect_handshake() {
        let mut mock = MockTransport::new();
        mock.queue_read(&AshFrame::RstAck { version: 2, code: 0x02 }.serialize());

        let mut session = AshSession::new(&mut mock);
        session.connect(Duration::from_secs(1)).unwrap();

        assert_eq!(mock.writes()[0], AshFrame::Rst.serialize());
    }

    #[test]
    fn test_connect_timeout_retries_rst() {
        let mut mock = MockTransport::new();
        let mut session = AshSession::new(&mut mock);

        assert!(matches!(
            session.connect(Duration::from_millis(3)),
            Err(Error::Timeout { .. })
        ));
        // One RST per attempt.
        assert_eq!(mock.writes().len(), RESET_ATTEMPTS as usize);
    }

    #[test]
    fn test_command_exchange() {
        let mut mock = MockTransport::new();
        mock.queue_read(&AshFrame::RstAck { version: 2, code: 0x02 }.serialize());
        mock.queue_read(
            &AshFrame::Data {
                frm_num: 0,
                ack_num: 1,
                retx: false,
                payload: vec![0xAB, 0xCD],
            }
            .serialize(),
        );

        let mut session = AshSession::new(&mut mock);
        session.connect(Duration::from_secs(1)).unwrap();

        let response = session.command(&[0x01, 0x02], Duration::from_secs(1)).unwrap();
        assert_eq!(response, vec![0xAB, 0xCD]);

        // RST, DATA, then our ACK of the response.
        assert_eq!(mock.writes().len(), 3);
        assert_eq!(
            mock.writes()[2],
            AshFrame::Ack { ack_num: 1 }.serialize()
        );
    }

    #[test]
    fn test_nak_triggers_retransmit() {
        let mut mock = MockTransport::new();
        mock.queue_read(&AshFrame::RstAck { version: 2, code: 0x02 }.serialize());
        mock.queue_read(&AshFrame::Nak { ack_num: 0 }.serialize());
        mock.queue_read(
            &AshFrame::Data {
                frm_num: 0,
                ack_num: 1,
                retx: false,
                payload: vec![0x99],
            }
            .serialize(),
        );

        let mut session = AshSession::new(&mut mock);
        session.connect(Duration::from_secs(1)).unwrap();
        let response = session.command(&[0x42], Duration::from_secs(1)).unwrap();
        assert_eq!(response, vec![0x99]);

        // RST, DATA, retransmitted DATA (retx bit set), ACK.
        assert_eq!(mock.writes().len(), 4);
        let retx_frame = AshFrame::Data {
            frm_num: 0,
            ack_num: 0,
            retx: true,
            payload: vec![0x42],
        };
        assert_eq!(mock.writes()[2], retx_frame.serialize());
    }
}
