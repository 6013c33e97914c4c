//! flasher-core: universal Silicon Labs radio firmware flasher.
//!
//! Identifies the application running on a Silicon Labs radio coprocessor
//! (Gecko bootloader, EmberZNet EZSP, CPC or Spinel), reboots it into the
//! Gecko bootloader and uploads a GBL firmware image over XMODEM-CRC.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: abstract serial byte stream (serialport, mock)
//! - **Framing & sessions**: ASH/EZSP, CPC and Spinel protocol stacks,
//!   each implementing just enough for a version query and bootloader entry
//! - **Bootloader**: Gecko bootloader menu driver and XMODEM-CRC sender
//! - **GBL**: firmware container parsing and CRC validation
//! - **Events**: observer pattern for UI decoupling
//! - **Flasher**: high-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use flasher_core::flasher::{Flasher, FlasherConfig, FlashPolicy};
//! use flasher_core::gbl::GblImage;
//! use flasher_core::transport::SerialTransport;
//!
//! let firmware = std::fs::read("firmware.gbl").unwrap();
//! let image = GblImage::parse(&firmware).unwrap();
//!
//! let transport = SerialTransport::open("/dev/ttyUSB0", 115_200).unwrap();
//! let mut flasher = Flasher::new(transport, FlasherConfig::default());
//! flasher.flash(&image, &FlashPolicy::default()).unwrap();
//! ```

pub mod ash;
pub mod bootloader;
pub mod cpc;
pub mod error;
pub mod events;
pub mod ezsp;
pub mod firmware;
pub mod flasher;
pub mod gbl;
pub mod spinel;
pub mod transport;
pub mod version;
pub mod xmodem;

// Re-exports for convenience
pub use error::Error;
pub use events::{FlashEvent, FlashObserver, FlashPhase, NullObserver, TracingObserver};
pub use ezsp::Eui64;
pub use firmware::{ApplicationType, FirmwareImageType, NabuCasaMetadata};
pub use flasher::{
    BootloaderReset, Flasher, FlasherConfig, FlashOutcome, FlashPolicy, ProbeResult,
};
pub use gbl::{GblError, GblImage};
pub use transport::{MockTransport, SerialTransport, Transport, TransportError};
pub use version::Version;
