//! Scripted in-memory transport for testing.

use std::collections::VecDeque;
use std::time::Duration;

use super::traits::{Transport, TransportError};

/// Mock transport for unit testing protocol sessions.
///
/// Reads pop pre-queued chunks in order; an empty queue reads as a
/// timeout. Writes are captured for later inspection. The probing and
/// flashing flows are strictly request/response, so lock-step scripting is
/// sufficient.
#[derive(Default)]
pub struct MockTransport {
    reads: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    baudrate: u32,
    baud_history: Vec<u32>,
    control_lines: Vec<(bool, bool)>,
    input_resets: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            baudrate: 115_200,
            ..Self::default()
        }
    }

    /// Queue bytes to be returned by a future read.
    pub fn queue_read(&mut self, data: &[u8]) {
        self.reads.push_back(data.to_vec());
    }

    /// All captured writes, in order.
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// Everything written, as one contiguous stream.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.writes.concat()
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    /// Baudrates applied via `set_baudrate`, in order.
    pub fn baud_history(&self) -> &[u32] {
        &self.baud_history
    }

    /// DTR/RTS states applied via `set_control_lines`, in order.
    pub fn control_lines(&self) -> &[(bool, bool)] {
        &self.control_lines
    }

    pub fn input_resets(&self) -> usize {
        self.input_resets
    }
}

impl Transport for MockTransport {
    fn read_with_deadline(
        &mut self,
        buf: &mut [u8],
        deadline: Duration,
    ) -> Result<usize, TransportError> {
        let mut chunk = match self.reads.pop_front() {
            Some(chunk) => chunk,
            None => {
                return Err(TransportError::Timeout {
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);

        if n < chunk.len() {
            self.reads.push_front(chunk.split_off(n));
        }

        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.writes.push(data.to_vec());
        Ok(())
    }

    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), TransportError> {
        self.baudrate = baudrate;
        self.baud_history.push(baudrate);
        Ok(())
    }

    fn baudrate(&self) -> u32 {
        self.baudrate
    }

    fn reset_input_buffer(&mut self) -> Result<(), TransportError> {
        self.input_resets += 1;
        Ok(())
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), TransportError> {
        self.control_lines.push((dtr, rts));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_queue() {
        let mut mock = MockTransport::new();
        mock.queue_read(b"hello");

        let mut buf = [0u8; 3];
        assert_eq!(mock.read_with_deadline(&mut buf, Duration::ZERO).unwrap(), 3);
        assert_eq!(&buf, b"hel");

        let mut buf = [0u8; 8];
        assert_eq!(mock.read_with_deadline(&mut buf, Duration::ZERO).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");

        assert!(matches!(
            mock.read_with_deadline(&mut buf, Duration::ZERO),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_write_capture() {
        let mut mock = MockTransport::new();
        mock.write_all(b"abc").unwrap();
        mock.write_all(b"def").unwrap();
        assert_eq!(mock.writes().len(), 2);
        assert_eq!(mock.written_bytes(), b"abcdef");
    }
}
