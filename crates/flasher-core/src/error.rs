//! Crate-wide error type.

use thiserror::Error;

use crate::gbl::GblError;
use crate::transport::TransportError;

/// Errors surfaced by the flasher core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport I/O: {0}")]
    TransportIo(String),

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("framing error: {0}")]
    Framing(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session failed: {0}")]
    SessionFailed(String),

    #[error("no application responded on any probed method/baudrate")]
    ProbeExhausted,

    #[error("invalid firmware image: {0}")]
    ImageInvalid(#[from] GblError),

    #[error(
        "running image type {running} does not match firmware image type {image}; \
         pass --allow-cross-flashing to override"
    )]
    CrossFlashRefused { running: String, image: String },

    #[error(
        "firmware version {image} does not upgrade running version {running}; \
         pass --allow-downgrades to override"
    )]
    DowngradeRefused { running: String, image: String },

    #[error("could not enter the bootloader: {0}")]
    BootloaderEntryFailed(String),

    #[error("XMODEM transfer failed at block {block}: {reason}")]
    XmodemFailed { block: u32, reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { timeout_ms } => Error::Timeout { timeout_ms },
            other => Error::TransportIo(other.to_string()),
        }
    }
}

impl Error {
    /// Whether this error indicates the probed protocol is not what is
    /// running on the device, as opposed to nothing answering at this baud.
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(
            self,
            Error::SessionFailed(_) | Error::Framing(_) | Error::Protocol(_)
        )
    }
}
