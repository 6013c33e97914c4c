//! Byte stream transport abstraction.
//!
//! Defines the `Transport` trait the protocol sessions run on, allowing
//! different implementations (serial port, mock, socket bridges).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract serial byte stream.
///
/// All reads carry an explicit deadline; a read that sees no bytes within
/// the deadline returns `TransportError::Timeout`, which callers treat as
/// a recoverable outcome rather than a failure. Sessions hold an exclusive
/// `&mut` borrow for the duration of a command/response pair, so no
/// interior locking is needed.
pub trait Transport {
    /// Read available bytes into `buf`, waiting at most `deadline`.
    /// Returns the number of bytes read (at least 1) or `Timeout`.
    fn read_with_deadline(
        &mut self,
        buf: &mut [u8],
        deadline: Duration,
    ) -> Result<usize, TransportError>;

    /// Write all bytes and flush them toward the device.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Reconfigure the line speed. Pending output is drained first and
    /// pending input is discarded.
    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), TransportError>;

    /// Current line speed.
    fn baudrate(&self) -> u32;

    /// Discard any received-but-unread bytes.
    fn reset_input_buffer(&mut self) -> Result<(), TransportError>;

    /// Drive the DTR/RTS modem control lines. Used for boards whose reset
    /// and boot pins hang off the USB-serial adapter.
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), TransportError> {
        let _ = (dtr, rts);
        Err(TransportError::Unsupported("control lines"))
    }
}
