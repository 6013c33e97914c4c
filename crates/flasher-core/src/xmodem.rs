//! XMODEM-CRC sender, as spoken by the Gecko bootloader's `upload gbl`
//! menu entry.
//!
//! 128-byte blocks, each `SOH, n, 255 - n, data, CRC-16/XMODEM (BE)`.
//! Block numbers start at 1 and wrap modulo 256. The receiver announces
//! readiness by emitting `C` and acknowledges every block.

use std::time::{Duration, Instant};

use crc::{Crc, CRC_16_XMODEM};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::transport::Transport;

const XMODEM_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

pub const BLOCK_SIZE: usize = 128;

const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const READY: u8 = b'C';

/// Padding for the final partial block.
const PAD_BYTE: u8 = 0x1A;

/// How long the receiver gets to emit the initial `C`.
const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Response deadline per transmitted block.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Retransmissions of a single block before giving up.
const MAX_RETRIES: u32 = 10;

/// Pad `data` up to a whole number of blocks.
pub fn pad_to_block_size(mut data: Vec<u8>) -> Vec<u8> {
    let remainder = data.len() % BLOCK_SIZE;
    if remainder != 0 {
        data.resize(data.len() + BLOCK_SIZE - remainder, PAD_BYTE);
    }
    data
}

/// Serialize one block packet.
fn packet(number: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(payload.len(), BLOCK_SIZE);

    let mut out = Vec::with_capacity(3 + BLOCK_SIZE + 2);
    out.push(SOH);
    out.push(number);
    out.push(255 - number);
    out.extend_from_slice(payload);
    out.extend_from_slice(&XMODEM_CRC.checksum(payload).to_be_bytes());
    out
}

/// Send `data` over `transport`, reporting `(block, total_blocks)` after
/// every acknowledged block. The data is padded to the block size first.
pub fn send<T: Transport>(
    transport: &mut T,
    data: &[u8],
    mut progress: impl FnMut(u32, u32),
) -> Result<(), Error> {
    let data = pad_to_block_size(data.to_vec());
    let total_blocks = (data.len() / BLOCK_SIZE) as u32;

    wait_for_ready(transport)?;
    debug!(blocks = total_blocks, "XMODEM receiver ready");

    for (index, block) in data.chunks(BLOCK_SIZE).enumerate() {
        let block_index = index as u32 + 1;
        let number = (block_index & 0xFF) as u8;

        send_with_retries(transport, &packet(number, block), block_index)?;
        progress(block_index, total_blocks);
    }

    send_with_retries(transport, &[EOT], total_blocks)?;
    debug!("XMODEM transfer complete");
    Ok(())
}

/// Wait for the initial `C`. Anything else the bootloader prints on the
/// way into XMODEM mode is discarded.
fn wait_for_ready<T: Transport>(transport: &mut T) -> Result<(), Error> {
    let deadline = Instant::now() + READY_TIMEOUT;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::XmodemFailed {
                block: 0,
                reason: "receiver never became ready".into(),
            });
        }

        let mut buf = [0u8; 64];
        let n = transport.read_with_deadline(&mut buf, remaining)?;

        if buf[..n].contains(&READY) {
            return Ok(());
        }
    }
}

/// Transmit `payload` until the receiver ACKs it.
fn send_with_retries<T: Transport>(
    transport: &mut T,
    payload: &[u8],
    block: u32,
) -> Result<(), Error> {
    let mut cancels = 0u32;

    for attempt in 0..=MAX_RETRIES {
        trace!(block = block, attempt = attempt, "Sending XMODEM block");
        transport.write_all(payload)?;

        let mut response = [0u8; 1];
        match transport.read_with_deadline(&mut response, RESPONSE_TIMEOUT) {
            Ok(_) => {}
            Err(e) => {
                return Err(Error::XmodemFailed {
                    block,
                    reason: Error::from(e).to_string(),
                })
            }
        }

        match response[0] {
            ACK => return Ok(()),
            NAK => {
                warn!(block = block, "Receiver NAKed block, retransmitting");
                cancels = 0;
            }
            CAN => {
                cancels += 1;
                if cancels >= 2 {
                    return Err(Error::XmodemFailed {
                        block,
                        reason: "receiver cancelled the transfer".into(),
                    });
                }
            }
            other => {
                warn!(block = block, byte = other, "Unexpected XMODEM response");
                cancels = 0;
            }
        }
    }

    Err(Error::XmodemFailed {
        block,
        reason: format!("no acknowledgement after {MAX_RETRIES} retries"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_padding() {
        assert_eq!(pad_to_block_size(vec![0; 128]).len(), 128);
        assert_eq!(pad_to_block_size(vec![0; 129]).len(), 256);

        let padded = pad_to_block_size(vec![1; 100]);
        assert_eq!(padded.len(), 128);
        assert!(padded[100..].iter().all(|&b| b == PAD_BYTE));
    }

    #[test]
    fn test_packet_layout() {
        let payload = [0xABu8; BLOCK_SIZE];
        let pkt = packet(1, &payload);

        assert_eq!(pkt.len(), 3 + BLOCK_SIZE + 2);
        assert_eq!(pkt[0], SOH);
        assert_eq!(pkt[1], 1);
        assert_eq!(pkt[2], 254);
        assert_eq!(&pkt[3..3 + BLOCK_SIZE], &payload);

        let crc = u16::from_be_bytes([pkt[131], pkt[132]]);
        assert_eq!(crc, XMODEM_CRC.checksum(&payload));
    }

    #[test]
    fn test_xmodem_check_value() {
        // CRC-16/XMODEM of "123456789" is 0x31C3.
        assert_eq!(XMODEM_CRC.checksum(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_block_numbers_wrap() {
        // Block 255 is numbered 0xFF, block 256 wraps to 0x00.
        assert_eq!((255u32 & 0xFF) as u8, 0xFF);
        assert_eq!((256u32 & 0xFF) as u8, 0x00);
    }

    #[test]
    fn test_three_block_transfer() {
        let mut mock = MockTransport::new();
        mock.queue_read(&[READY]);
        mock.queue_read(&[ACK]);
        mock.queue_read(&[ACK]);
        mock.queue_read(&[ACK]);
        mock.queue_read(&[ACK]); // EOT

        let data = vec![0x5A; 3 * BLOCK_SIZE];
        let mut seen = Vec::new();
        send(&mut mock, &data, |block, total| seen.push((block, total))).unwrap();

        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);

        let writes = mock.writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0][..3], [SOH, 1, 254]);
        assert_eq!(writes[1][..3], [SOH, 2, 253]);
        assert_eq!(writes[2][..3], [SOH, 3, 252]);
        assert_eq!(writes[3], vec![EOT]);
    }

    #[test]
    fn test_nak_retransmits_same_block() {
        let mut mock = MockTransport::new();
        mock.queue_read(&[READY]);
        mock.queue_read(&[NAK]);
        mock.queue_read(&[ACK]);
        mock.queue_read(&[ACK]); // EOT

        let data = vec![0x11; BLOCK_SIZE];
        send(&mut mock, &data, |_, _| {}).unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0], writes[1]);
    }

    #[test]
    fn test_double_cancel_aborts() {
        let mut mock = MockTransport::new();
        mock.queue_read(&[READY]);
        mock.queue_read(&[CAN]);
        mock.queue_read(&[CAN]);

        let data = vec![0x22; BLOCK_SIZE];
        match send(&mut mock, &data, |_, _| {}) {
            Err(Error::XmodemFailed { block: 1, reason }) => {
                assert!(reason.contains("cancelled"));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_reports_block_number() {
        let mut mock = MockTransport::new();
        mock.queue_read(&[READY]);
        mock.queue_read(&[ACK]);
        // No response for block 2.

        let data = vec![0x33; 2 * BLOCK_SIZE];
        match send(&mut mock, &data, |_, _| {}) {
            Err(Error::XmodemFailed { block: 2, .. }) => {}
            other => panic!("expected block-2 failure, got {other:?}"),
        }
    }
}
