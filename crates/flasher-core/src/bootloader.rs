//! Gecko bootloader menu driver.
//!
//! The bootloader is line-oriented: it prints a versioned banner and a
//! numbered menu, then waits at a `BL > ` prompt. Uploading goes through
//! menu option `1`, which starts an XMODEM-CRC receiver.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::bytes::Regex;
use tracing::{debug, trace};

use crate::error::Error;
use crate::transport::Transport;
use crate::version::Version;
use crate::xmodem;

const OPTION_UPLOAD_FIRMWARE: &[u8] = b"1";
const OPTION_RUN_FIRMWARE: &[u8] = b"2";

/// How long the bootloader gets to report the upload status after the
/// XMODEM EOT is acknowledged.
const UPLOAD_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

fn menu_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?-u)\r\n(?:Gecko|\w+ Serial) Bootloader v(?P<version>.*?)\r\n1\. upload (?:gbl|ebl)\r\n2\. run\r\n3\. ebl info\r\nBL > ",
        )
        .expect("static regex")
    })
}

fn upload_status_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s-u)\r\nSerial upload (?P<status>complete|aborted)\r\n(?P<message>.*?)\x00?$")
            .expect("static regex")
    })
}

/// Menu-mode client holding an exclusive borrow of the transport.
pub struct BootloaderClient<'a, T: Transport> {
    transport: &'a mut T,
    buffer: Vec<u8>,
}

impl<'a, T: Transport> BootloaderClient<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            buffer: Vec::new(),
        }
    }

    /// Poke the bootloader with a carriage return and wait for either the
    /// full menu banner (version captured) or a bare `BL > ` prompt
    /// (version unknown).
    pub fn probe(&mut self, timeout: Duration) -> Result<Option<Version>, Error> {
        self.transport.write_all(b"\r")?;
        self.wait_for_menu(timeout)
    }

    /// Select `run` to boot the application. The bootloader prints the
    /// menu again only if there is no application to run.
    pub fn run_firmware(&mut self) -> Result<(), Error> {
        self.transport.write_all(OPTION_RUN_FIRMWARE)?;
        Ok(())
    }

    /// Select `upload gbl` and stream the image with XMODEM-CRC.
    pub fn upload_firmware(
        &mut self,
        firmware: &[u8],
        progress: impl FnMut(u32, u32),
    ) -> Result<(), Error> {
        self.buffer.clear();
        self.transport.write_all(OPTION_UPLOAD_FIRMWARE)?;

        xmodem::send(self.transport, firmware, progress)?;

        let status = self.wait_for_upload_status()?;
        debug!(status = %status, "Bootloader upload status");

        if status != "complete" {
            let total_blocks = (xmodem::pad_to_block_size(firmware.to_vec()).len()
                / xmodem::BLOCK_SIZE) as u32;
            return Err(Error::XmodemFailed {
                block: total_blocks,
                reason: format!("bootloader reported: {status}"),
            });
        }

        Ok(())
    }

    fn wait_for_menu(&mut self, timeout: Duration) -> Result<Option<Version>, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(captures) = menu_regex().captures(&self.buffer) {
                let version_bytes = &captures["version"];
                let version_text = String::from_utf8_lossy(version_bytes).into_owned();
                self.buffer.clear();

                debug!(version = %version_text, "Bootloader menu");
                return Ok(Version::new(&version_text));
            }

            if self.buffer.ends_with(b"BL > ") {
                trace!("Bootloader prompt without banner");
                self.buffer.clear();
                return Ok(None);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            let mut buf = [0u8; 256];
            let n = self.transport.read_with_deadline(&mut buf, remaining)?;
            self.buffer.extend_from_slice(&buf[..n]);
        }
    }

    fn wait_for_upload_status(&mut self) -> Result<String, Error> {
        let deadline = Instant::now() + UPLOAD_STATUS_TIMEOUT;

        loop {
            if let Some(captures) = upload_status_regex().captures(&self.buffer) {
                let status = String::from_utf8_lossy(&captures["status"]).into_owned();
                let message = String::from_utf8_lossy(&captures["message"]).into_owned();
                self.buffer.clear();

                return Ok(if status == "complete" { status } else { message });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Protocol(
                    "bootloader did not report an upload status".into(),
                ));
            }

            let mut buf = [0u8; 256];
            let n = self.transport.read_with_deadline(&mut buf, remaining)?;
            self.buffer.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    const TIMEOUT: Duration = Duration::from_secs(1);

    pub(crate) const MENU: &[u8] = b"\r\nGecko Bootloader v1.12.0\r\n1. upload gbl\r\n2. run\r\n3. ebl info\r\nBL > ";

    #[test]
    fn test_probe_with_banner() {
        let mut mock = MockTransport::new();
        mock.queue_read(MENU);

        let mut client = BootloaderClient::new(&mut mock);
        let version = client.probe(TIMEOUT).unwrap();
        assert_eq!(version.unwrap().to_string(), "1.12.0");

        assert_eq!(mock.writes()[0], b"\r");
    }

    #[test]
    fn test_probe_with_bare_prompt() {
        let mut mock = MockTransport::new();
        mock.queue_read(b"\r\n");
        mock.queue_read(b"BL > ");

        let mut client = BootloaderClient::new(&mut mock);
        assert_eq!(client.probe(TIMEOUT).unwrap(), None);
    }

    #[test]
    fn test_probe_legacy_serial_banner() {
        let mut mock = MockTransport::new();
        mock.queue_read(b"\r\nEM3x Serial Bootloader v5.4.1.0\r\n1. upload ebl\r\n2. run\r\n3. ebl info\r\nBL > ");

        let mut client = BootloaderClient::new(&mut mock);
        let version = client.probe(TIMEOUT).unwrap();
        assert_eq!(version.unwrap().to_string(), "5.4.1.0");
    }

    #[test]
    fn test_probe_timeout_on_silence() {
        let mut mock = MockTransport::new();
        let mut client = BootloaderClient::new(&mut mock);

        assert!(matches!(
            client.probe(Duration::from_millis(5)),
            Err(Error::Timeout { .. })
        ));
    }

    #[test]
    fn test_upload_complete() {
        let mut mock = MockTransport::new();
        mock.queue_read(b"C");
        mock.queue_read(&[0x06]); // ACK block 1
        mock.queue_read(&[0x06]); // ACK EOT
        mock.queue_read(b"\r\nSerial upload complete\r\n");

        let firmware = vec![0xAA; xmodem::BLOCK_SIZE];
        let mut client = BootloaderClient::new(&mut mock);
        client.upload_firmware(&firmware, |_, _| {}).unwrap();

        assert_eq!(mock.writes()[0], OPTION_UPLOAD_FIRMWARE);
    }

    #[test]
    fn test_upload_aborted() {
        let mut mock = MockTransport::new();
        mock.queue_read(b"C");
        mock.queue_read(&[0x06]);
        mock.queue_read(&[0x06]);
        mock.queue_read(b"\r\nSerial upload aborted\r\nCRC error\x00");

        let firmware = vec![0xAA; xmodem::BLOCK_SIZE];
        let mut client = BootloaderClient::new(&mut mock);

        match client.upload_firmware(&firmware, |_, _| {}) {
            Err(Error::XmodemFailed { reason, .. }) => assert!(reason.contains("CRC error")),
            other => panic!("expected upload failure, got {other:?}"),
        }
    }

    #[test]
    fn test_run_firmware_sends_option() {
        let mut mock = MockTransport::new();
        let mut client = BootloaderClient::new(&mut mock);
        client.run_firmware().unwrap();
        assert_eq!(mock.writes()[0], OPTION_RUN_FIRMWARE);
    }
}
