//! Serial port transport backed by the `serialport` crate.

use std::io::Read;
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::debug;

use super::traits::{Transport, TransportError};

/// Production transport over a local serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    baudrate: u32,
}

impl SerialTransport {
    /// Open `path` at the given baudrate, 8N1, no flow control.
    pub fn open(path: &str, baudrate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| TransportError::OpenFailed(format!("{path}: {e}")))?;

        debug!(path = %path, baudrate = baudrate, "Opened serial port");

        Ok(Self { port, baudrate })
    }
}

impl Transport for SerialTransport {
    fn read_with_deadline(
        &mut self,
        buf: &mut [u8],
        deadline: Duration,
    ) -> Result<usize, TransportError> {
        self.port
            .set_timeout(deadline)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        match self.port.read(buf) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(TransportError::Timeout {
                timeout_ms: deadline.as_millis() as u64,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(TransportError::Disconnected)
            }
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        std::io::Write::write_all(&mut self.port, data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.port
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), TransportError> {
        if baudrate == self.baudrate {
            return Ok(());
        }

        // Drain what we queued, then drop whatever the old speed received.
        self.port
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.port
            .set_baud_rate(baudrate)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        debug!(baudrate = baudrate, "Reconfigured baudrate");
        self.baudrate = baudrate;
        Ok(())
    }

    fn baudrate(&self) -> u32 {
        self.baudrate
    }

    fn reset_input_buffer(&mut self) -> Result<(), TransportError> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), TransportError> {
        self.port
            .write_data_terminal_ready(dtr)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.port
            .write_request_to_send(rts)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }
}
