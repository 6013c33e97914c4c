//! Flash orchestrator: baud sweep probing, upgrade policy, bootloader
//! entry and the end-to-end flash sequence.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bootloader::BootloaderClient;
use crate::cpc::CpcSession;
use crate::error::Error;
use crate::events::{FlashEvent, FlashObserver, FlashPhase, TracingObserver};
use crate::ezsp::{Eui64, EzspClient};
use crate::firmware::{image_application_type, ApplicationType};
use crate::gbl::GblImage;
use crate::spinel::SpinelSession;
use crate::transport::Transport;
use crate::version::Version;

/// Deadline for the cheap carriage-return bootloader probe.
const BOOTLOADER_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for the application-protocol probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the menu banner after commanding a reboot.
const BOOTLOADER_ENTRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Menu banner attempts before giving up on bootloader entry.
const BOOTLOADER_ENTRY_ATTEMPTS: u32 = 3;

/// Settle time after commanding a reboot, before reconfiguring the line.
const REBOOT_DELAY: Duration = Duration::from_millis(500);

/// Hold time for each step of a DTR/RTS reset pattern.
const RESET_TOGGLE_DELAY: Duration = Duration::from_millis(100);

/// External reset strategies that land the radio in its bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderReset {
    /// Home Assistant Yellow: MGM210P reset via GPIO (external hook).
    Yellow,
    /// iHost: reset via GPIO (external hook).
    IHost,
    /// Sonoff ZBDongle-E: reset via the adapter's DTR/RTS lines.
    Sonoff,
}

/// Hook invoked for reset strategies the core cannot drive itself.
pub type ResetHook = Box<dyn FnMut() -> Result<(), Error>>;

/// Outcome of a successful probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub app_type: ApplicationType,
    pub app_version: Option<Version>,
    pub baudrate_used: u32,
}

/// Gates evaluated between probing and flashing.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashPolicy {
    pub allow_cross_flashing: bool,
    pub allow_downgrades: bool,
    pub ensure_exact_version: bool,
    pub force: bool,
}

/// Result of a `flash` call that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOutcome {
    Flashed,
    /// The exact requested version is already running.
    AlreadyRunning,
}

#[derive(Debug, PartialEq, Eq)]
enum PolicyDecision {
    Proceed,
    SkipAlreadyRunning,
}

/// Flasher configuration: probe order and per-application baudrates.
#[derive(Debug, Clone)]
pub struct FlasherConfig {
    pub probe_methods: Vec<ApplicationType>,
    pub bootloader_baudrates: Vec<u32>,
    pub cpc_baudrates: Vec<u32>,
    pub ezsp_baudrates: Vec<u32>,
    pub spinel_baudrates: Vec<u32>,
    pub bootloader_reset: Option<BootloaderReset>,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            probe_methods: ApplicationType::ALL.to_vec(),
            bootloader_baudrates: ApplicationType::GeckoBootloader
                .default_baudrates()
                .to_vec(),
            cpc_baudrates: ApplicationType::Cpc.default_baudrates().to_vec(),
            ezsp_baudrates: ApplicationType::Ezsp.default_baudrates().to_vec(),
            spinel_baudrates: ApplicationType::Spinel.default_baudrates().to_vec(),
            bootloader_reset: None,
        }
    }
}

impl FlasherConfig {
    fn baudrates_for(&self, app_type: ApplicationType) -> &[u32] {
        match app_type {
            ApplicationType::GeckoBootloader => &self.bootloader_baudrates,
            ApplicationType::Cpc => &self.cpc_baudrates,
            ApplicationType::Ezsp => &self.ezsp_baudrates,
            ApplicationType::Spinel => &self.spinel_baudrates,
        }
    }

    fn baudrates_for_mut(&mut self, app_type: ApplicationType) -> &mut Vec<u32> {
        match app_type {
            ApplicationType::GeckoBootloader => &mut self.bootloader_baudrates,
            ApplicationType::Cpc => &mut self.cpc_baudrates,
            ApplicationType::Ezsp => &mut self.ezsp_baudrates,
            ApplicationType::Spinel => &mut self.spinel_baudrates,
        }
    }

    /// The rate the bootloader menu is driven at.
    fn bootloader_baudrate(&self) -> u32 {
        self.bootloader_baudrates.first().copied().unwrap_or(115_200)
    }
}

/// Reorder `list` so the given elements come first, keeping the rest in
/// their original order.
fn put_first<E: PartialEq + Copy>(list: &[E], first: &[E]) -> Vec<E> {
    let mut out: Vec<E> = first.to_vec();
    out.extend(list.iter().copied().filter(|e| !first.contains(e)));
    out
}

/// The orchestrator. Owns the transport; protocol sessions borrow it for
/// the duration of a command/response exchange.
pub struct Flasher<T: Transport, O: FlashObserver> {
    transport: T,
    config: FlasherConfig,
    observer: O,
    reset_hook: Option<ResetHook>,
}

impl<T: Transport> Flasher<T, TracingObserver> {
    pub fn new(transport: T, config: FlasherConfig) -> Self {
        Self::with_observer(transport, config, TracingObserver)
    }
}

impl<T: Transport, O: FlashObserver> Flasher<T, O> {
    pub fn with_observer(transport: T, config: FlasherConfig, observer: O) -> Self {
        Self {
            transport,
            config,
            observer,
            reset_hook: None,
        }
    }

    /// Install the hook used for GPIO-driven reset strategies.
    pub fn set_reset_hook(&mut self, hook: ResetHook) {
        self.reset_hook = Some(hook);
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Identify the running application by sweeping `(method, baudrate)`
    /// pairs in order.
    pub fn probe(&mut self) -> Result<ProbeResult, Error> {
        self.observer.on_event(&FlashEvent::PhaseChanged {
            phase: FlashPhase::Probing,
        });

        let methods = match self.apply_reset()? {
            // A hardware reset lands the device in its bootloader, so
            // probe that first regardless of the configured order.
            true => put_first(
                &self.config.probe_methods,
                &[ApplicationType::GeckoBootloader],
            ),
            false => self.config.probe_methods.clone(),
        };

        for method in methods {
            info!(method = %method, "Probing");

            for baudrate in self.config.baudrates_for(method).to_vec() {
                self.observer.on_event(&FlashEvent::ProbeAttempt {
                    app_type: method,
                    baudrate,
                });

                self.transport.set_baudrate(baudrate)?;
                self.transport.reset_input_buffer()?;

                match self.probe_method(method) {
                    Ok(app_version) => {
                        let result = ProbeResult {
                            app_type: method,
                            app_version,
                            baudrate_used: baudrate,
                        };

                        self.observer.on_event(&FlashEvent::Detected {
                            app_type: result.app_type,
                            version: result.app_version.clone(),
                            baudrate: result.baudrate_used,
                        });
                        return Ok(result);
                    }
                    Err(Error::Timeout { .. }) => {
                        debug!(method = %method, baudrate = baudrate, "No answer");
                    }
                    Err(e) if e.is_protocol_mismatch() => {
                        // Something answered, but not in this protocol:
                        // the method is wrong, not the baudrate.
                        debug!(method = %method, error = %e, "Different protocol answered");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Err(Error::ProbeExhausted)
    }

    fn probe_method(&mut self, method: ApplicationType) -> Result<Option<Version>, Error> {
        match method {
            ApplicationType::GeckoBootloader => {
                BootloaderClient::new(&mut self.transport).probe(BOOTLOADER_PROBE_TIMEOUT)
            }
            ApplicationType::Cpc => CpcSession::new(&mut self.transport)
                .probe(PROBE_TIMEOUT)
                .map(Some),
            ApplicationType::Ezsp => {
                let mut client = EzspClient::connect(&mut self.transport, PROBE_TIMEOUT)?;
                client.app_version(PROBE_TIMEOUT).map(Some)
            }
            ApplicationType::Spinel => SpinelSession::new(&mut self.transport)
                .probe(PROBE_TIMEOUT)
                .map(Some),
        }
    }

    /// Probe, validate policy, enter the bootloader and stream the image.
    pub fn flash(&mut self, image: &GblImage, policy: &FlashPolicy) -> Result<FlashOutcome, Error> {
        if let Ok(metadata) = image.metadata() {
            self.apply_metadata_hints(
                metadata.fw_type.and_then(image_application_type),
                metadata.baudrate,
            );
        }

        let probe = self.probe()?;

        match self.check_policy(&probe, image, policy)? {
            PolicyDecision::SkipAlreadyRunning => {
                info!("Requested firmware is already running, not flashing");
                return Ok(FlashOutcome::AlreadyRunning);
            }
            PolicyDecision::Proceed => {}
        }

        self.enter_bootloader(&probe)?;

        self.observer.on_event(&FlashEvent::PhaseChanged {
            phase: FlashPhase::Uploading,
        });

        let observer = &self.observer;
        let mut client = BootloaderClient::new(&mut self.transport);
        client.upload_firmware(image.serialized_bytes(), |block, total_blocks| {
            observer.on_event(&FlashEvent::Progress {
                block,
                total_blocks,
            });
        })?;

        self.observer.on_event(&FlashEvent::PhaseChanged {
            phase: FlashPhase::Running,
        });
        BootloaderClient::new(&mut self.transport).run_firmware()?;

        self.observer.on_event(&FlashEvent::Complete);
        Ok(FlashOutcome::Flashed)
    }

    /// Write the custom EUI-64 token of an EmberZNet device. Returns
    /// `false` when the address already matches and nothing was written.
    pub fn write_ieee(&mut self, new_eui64: Eui64) -> Result<bool, Error> {
        let probe = self.probe()?;

        if probe.app_type != ApplicationType::Ezsp {
            return Err(Error::Protocol(format!(
                "device is running {}, not EmberZNet",
                probe.app_type
            )));
        }

        let mut client = EzspClient::connect(&mut self.transport, PROBE_TIMEOUT)?;
        let current = client.get_eui64(PROBE_TIMEOUT)?;
        info!(current = %current, "Current device IEEE address");

        if current == new_eui64 {
            info!("Device IEEE address already matches, not overwriting");
            return Ok(false);
        }

        if !client.can_write_custom_eui64(PROBE_TIMEOUT)? {
            return Err(Error::Protocol(
                "IEEE address has already been written, it cannot be written again".into(),
            ));
        }

        client.write_custom_eui64(new_eui64, PROBE_TIMEOUT)?;
        info!(new = %new_eui64, "Wrote device IEEE address");
        Ok(true)
    }

    /// Prefer the probe method and baudrate named by the image metadata,
    /// unless the user overrode the defaults.
    fn apply_metadata_hints(&mut self, app_type: Option<ApplicationType>, baudrate: Option<u32>) {
        let app_type = match app_type {
            Some(app_type) => app_type,
            None => return,
        };

        if self.config.probe_methods == ApplicationType::ALL.to_vec() {
            debug!(app = %app_type, "Probing the image's application type first");
            self.config.probe_methods = put_first(
                &self.config.probe_methods,
                &[ApplicationType::GeckoBootloader, app_type],
            );
        }

        if let Some(baudrate) = baudrate {
            let baudrates = self.config.baudrates_for_mut(app_type);
            if *baudrates == app_type.default_baudrates() {
                debug!(baudrate = baudrate, "Probing the image's baudrate first");
                *baudrates = put_first(baudrates, &[baudrate]);
            }
        }
    }

    fn check_policy(
        &self,
        probe: &ProbeResult,
        image: &GblImage,
        policy: &FlashPolicy,
    ) -> Result<PolicyDecision, Error> {
        if policy.force {
            return Ok(PolicyDecision::Proceed);
        }

        let metadata = image.metadata().ok();
        let image_type = metadata.as_ref().and_then(|m| m.fw_type);
        let image_version = metadata.as_ref().and_then(|m| m.public_version().cloned());

        // The image must be compatible with the running application. The
        // bootloader has no compatible image type, so flashing from it is
        // always a cross-flash.
        if let Some(image_type) = image_type {
            let compatible = probe.app_type.compatible_image_types();

            if !compatible.contains(&image_type) {
                if !policy.allow_cross_flashing {
                    return Err(Error::CrossFlashRefused {
                        running: probe.app_type.to_string(),
                        image: image_type.to_string(),
                    });
                }

                info!(
                    running = %probe.app_type,
                    image = %image_type,
                    "Cross-flashing"
                );
                // Version numbers of different firmware families are not
                // comparable.
                return Ok(PolicyDecision::Proceed);
            }
        }

        if let (Some(image_version), Some(running)) = (&image_version, &probe.app_version) {
            // The already-running match is checked first: a bare image
            // version compares below a build-qualified running one, and
            // must not read as a downgrade.
            if policy.ensure_exact_version && image_version.compatible_with(running) {
                return Ok(PolicyDecision::SkipAlreadyRunning);
            }

            if image_version < running && !policy.allow_downgrades {
                return Err(Error::DowngradeRefused {
                    running: running.to_string(),
                    image: image_version.to_string(),
                });
            }
        }

        Ok(PolicyDecision::Proceed)
    }

    /// Get the device into its bootloader and wait for the menu.
    fn enter_bootloader(&mut self, probe: &ProbeResult) -> Result<(), Error> {
        self.observer.on_event(&FlashEvent::PhaseChanged {
            phase: FlashPhase::EnteringBootloader,
        });

        if probe.app_type != ApplicationType::GeckoBootloader {
            match probe.app_type {
                ApplicationType::Cpc => {
                    CpcSession::new(&mut self.transport).launch_bootloader(PROBE_TIMEOUT)?
                }
                ApplicationType::Spinel => {
                    SpinelSession::new(&mut self.transport).launch_bootloader()?
                }
                ApplicationType::Ezsp => {
                    EzspClient::connect(&mut self.transport, PROBE_TIMEOUT)?
                        .launch_bootloader(PROBE_TIMEOUT)?
                }
                ApplicationType::GeckoBootloader => unreachable!(),
            }

            std::thread::sleep(REBOOT_DELAY);
        }

        self.transport
            .set_baudrate(self.config.bootloader_baudrate())?;
        self.transport.reset_input_buffer()?;

        let mut client = BootloaderClient::new(&mut self.transport);
        for attempt in 1..=BOOTLOADER_ENTRY_ATTEMPTS {
            match client.probe(BOOTLOADER_ENTRY_TIMEOUT) {
                Ok(version) => {
                    debug!(
                        version = %version.map(|v| v.to_string()).unwrap_or_else(|| "unknown".into()),
                        "Bootloader is up"
                    );
                    return Ok(());
                }
                Err(Error::Timeout { .. }) => {
                    warn!(attempt = attempt, "No bootloader menu yet, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::BootloaderEntryFailed(format!(
            "no menu banner after {BOOTLOADER_ENTRY_ATTEMPTS} attempts"
        )))
    }

    /// Run the configured pre-probe reset strategy. Returns whether a
    /// reset happened (the device is then expected in its bootloader).
    fn apply_reset(&mut self) -> Result<bool, Error> {
        let reset = match self.config.bootloader_reset {
            Some(reset) => reset,
            None => return Ok(false),
        };

        info!(strategy = ?reset, "Resetting device into bootloader");

        match reset {
            BootloaderReset::Sonoff => self.sonoff_reset()?,
            BootloaderReset::Yellow | BootloaderReset::IHost => match self.reset_hook.as_mut() {
                Some(hook) => hook()?,
                None => {
                    return Err(Error::Protocol(format!(
                        "{reset:?} reset requires an external GPIO hook"
                    )))
                }
            },
        }

        Ok(true)
    }

    /// Pulse the adapter's DTR/RTS lines to hold the bootloader pin
    /// through a reset (Sonoff ZBDongle-E wiring).
    fn sonoff_reset(&mut self) -> Result<(), Error> {
        self.transport.set_control_lines(false, true)?;
        std::thread::sleep(RESET_TOGGLE_DELAY);
        self.transport.set_control_lines(true, false)?;
        std::thread::sleep(RESET_TOGGLE_DELAY);
        self.transport.set_control_lines(false, false)?;
        Ok(())
    }
}
