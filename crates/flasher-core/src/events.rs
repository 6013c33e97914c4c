//! Event system for UI decoupling.
//!
//! The CLI (or any other front-end) subscribes to flashing events without
//! tight coupling to the orchestrator.

use std::fmt;

use crate::firmware::ApplicationType;
use crate::version::Version;

/// Flashing phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    /// Sweeping probe methods and baudrates.
    Probing,
    /// Commanding the running application into the bootloader.
    EnteringBootloader,
    /// XMODEM transfer in progress.
    Uploading,
    /// Launching the freshly written application.
    Running,
    /// All operations complete.
    Complete,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::Probing => write!(f, "Probing"),
            FlashPhase::EnteringBootloader => write!(f, "Entering Bootloader"),
            FlashPhase::Uploading => write!(f, "Uploading"),
            FlashPhase::Running => write!(f, "Running Firmware"),
            FlashPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Events emitted by the flasher.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// A probe attempt is starting.
    ProbeAttempt {
        app_type: ApplicationType,
        baudrate: u32,
    },
    /// The running application was identified.
    Detected {
        app_type: ApplicationType,
        version: Option<Version>,
        baudrate: u32,
    },
    /// Phase changed.
    PhaseChanged { phase: FlashPhase },
    /// XMODEM progress after an acknowledged block.
    Progress { block: u32, total_blocks: u32 },
    /// Flash finished successfully.
    Complete,
}

/// Observer trait for receiving flasher events.
pub trait FlashObserver {
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::ProbeAttempt { app_type, baudrate } => {
                tracing::debug!(method = %app_type, baudrate = baudrate, "Probing");
            }
            FlashEvent::Detected {
                app_type,
                version,
                baudrate,
            } => {
                let version = version
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "unknown".into());
                tracing::info!(
                    app = %app_type,
                    version = %version,
                    baudrate = baudrate,
                    "Detected running application"
                );
            }
            FlashEvent::PhaseChanged { phase } => {
                tracing::info!(phase = %phase, "Phase changed");
            }
            FlashEvent::Progress {
                block,
                total_blocks,
            } => {
                tracing::debug!(
                    progress = %format!("{}/{}", block, total_blocks),
                    "Upload progress"
                );
            }
            FlashEvent::Complete => {
                tracing::info!("Flash complete");
            }
        }
    }
}
