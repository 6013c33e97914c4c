use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use flasher_core::flasher::{BootloaderReset, Flasher, FlasherConfig, FlashPolicy};
use flasher_core::{
    ApplicationType, Error, Eui64, FlashEvent, FlashObserver, GblImage, SerialTransport,
};
use tracing::{error, info};

/// Exit codes for the `flash` subcommand.
const EXIT_POLICY_REFUSED: u8 = 2;
const EXIT_IO_FAILURE: u8 = 3;
const EXIT_IMAGE_INVALID: u8 = 4;

#[derive(Parser, Debug)]
#[command(
    name = "silabs-flasher",
    author,
    version,
    about = "Universal Silicon Labs radio firmware flasher",
    long_about = "Probes the application running on a Silicon Labs radio coprocessor \
                  (Gecko bootloader, EmberZNet, CPC or OpenThread RCP), reboots it into \
                  the Gecko bootloader and flashes GBL firmware images over XMODEM-CRC."
)]
struct Args {
    /// Serial port path or URL
    #[arg(long, global = true)]
    device: Option<String>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Baudrate for the Gecko bootloader menu
    #[arg(long, default_value_t = 115_200, global = true)]
    bootloader_baudrate: u32,

    /// Baudrates to probe CPC at, in order
    #[arg(long, value_delimiter = ',', default_values_t = [460_800u32, 115_200, 230_400], global = true)]
    cpc_baudrate: Vec<u32>,

    /// Baudrates to probe EZSP at, in order
    #[arg(long, value_delimiter = ',', default_values_t = [115_200u32], global = true)]
    ezsp_baudrate: Vec<u32>,

    /// Baudrates to probe Spinel at, in order
    #[arg(long, value_delimiter = ',', default_values_t = [460_800u32], global = true)]
    spinel_baudrate: Vec<u32>,

    /// Probe methods to try, in order
    #[arg(long, value_delimiter = ',', default_values_t = [
        ProbeMethod::Bootloader, ProbeMethod::Cpc, ProbeMethod::Ezsp, ProbeMethod::Spinel
    ], global = true)]
    probe_method: Vec<ProbeMethod>,

    /// Reset the board into its bootloader before probing
    #[arg(long, global = true)]
    bootloader_reset: Option<ResetKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeMethod {
    Bootloader,
    Cpc,
    Ezsp,
    Spinel,
}

impl From<ProbeMethod> for ApplicationType {
    fn from(method: ProbeMethod) -> Self {
        match method {
            ProbeMethod::Bootloader => ApplicationType::GeckoBootloader,
            ProbeMethod::Cpc => ApplicationType::Cpc,
            ProbeMethod::Ezsp => ApplicationType::Ezsp,
            ProbeMethod::Spinel => ApplicationType::Spinel,
        }
    }
}

impl std::fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(ApplicationType::from(*self).as_str())
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ResetKind {
    Yellow,
    Ihost,
    Sonoff,
}

impl From<ResetKind> for BootloaderReset {
    fn from(kind: ResetKind) -> Self {
        match kind {
            ResetKind::Yellow => BootloaderReset::Yellow,
            ResetKind::Ihost => BootloaderReset::IHost,
            ResetKind::Sonoff => BootloaderReset::Sonoff,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Identify the running application and its version
    Probe,
    /// Flash a GBL firmware image
    Flash {
        /// Path to the GBL firmware image
        #[arg(long)]
        firmware: PathBuf,

        /// Allow flashing an image of a different firmware type
        #[arg(long)]
        allow_cross_flashing: bool,

        /// Allow flashing an older firmware version
        #[arg(long)]
        allow_downgrades: bool,

        /// Skip flashing when the exact version is already running
        #[arg(long)]
        ensure_exact_version: bool,

        /// Skip all policy checks
        #[arg(long)]
        force: bool,
    },
    /// Write the device's IEEE EUI-64 address (EmberZNet only)
    WriteIeee {
        /// EUI-64 as 16 hex digits, optional colons
        #[arg(long)]
        ieee: Eui64,
    },
    /// Print the metadata embedded in a GBL firmware image
    DumpGblMetadata {
        /// Path to the GBL firmware image
        #[arg(long)]
        firmware: PathBuf,
    },
}

/// Observer that prints progress to stderr.
struct CliObserver {
    verbose: u8,
}

impl FlashObserver for CliObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::ProbeAttempt { app_type, baudrate } => {
                if self.verbose > 0 {
                    eprintln!("→ Probing {app_type} at {baudrate} baud");
                }
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
                eprintln!("✓ Detected {app_type} (version {version}) at {baudrate} baud");
            }
            FlashEvent::PhaseChanged { phase } => {
                if self.verbose > 0 {
                    eprintln!("→ {phase}");
                }
            }
            FlashEvent::Progress {
                block,
                total_blocks,
            } => {
                let pct = (block * 100) / total_blocks;
                eprint!("\r[{pct:>3}%] block {block}/{total_blocks}");
                if block == total_blocks {
                    eprintln!();
                }
            }
            FlashEvent::Complete => {
                eprintln!("✓ Flash complete");
            }
        }
    }
}

fn load_gbl(path: &Path) -> Result<GblImage, ExitCode> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("✗ Cannot read {}: {e}", path.display());
            return Err(ExitCode::from(EXIT_IO_FAILURE));
        }
    };

    GblImage::parse(&data).map_err(|e| {
        eprintln!(
            "✗ {} does not appear to be a valid GBL image: {e}",
            path.display()
        );
        ExitCode::from(EXIT_IMAGE_INVALID)
    })
}

fn open_flasher(args: &Args) -> Result<Flasher<SerialTransport, CliObserver>, ExitCode> {
    let device = match &args.device {
        Some(device) => device,
        None => {
            eprintln!("✗ Missing required option: --device");
            return Err(ExitCode::from(EXIT_IO_FAILURE));
        }
    };

    let transport = SerialTransport::open(device, args.bootloader_baudrate).map_err(|e| {
        eprintln!("✗ {e}");
        ExitCode::from(EXIT_IO_FAILURE)
    })?;

    let config = FlasherConfig {
        probe_methods: args.probe_method.iter().map(|&m| m.into()).collect(),
        bootloader_baudrates: vec![args.bootloader_baudrate],
        cpc_baudrates: args.cpc_baudrate.clone(),
        ezsp_baudrates: args.ezsp_baudrate.clone(),
        spinel_baudrates: args.spinel_baudrate.clone(),
        bootloader_reset: args.bootloader_reset.map(Into::into),
    };

    let observer = CliObserver {
        verbose: args.verbose,
    };

    Ok(Flasher::with_observer(transport, config, observer))
}

fn run(args: Args) -> ExitCode {
    match &args.command {
        Command::DumpGblMetadata { firmware } => {
            let image = match load_gbl(firmware) {
                Ok(image) => image,
                Err(code) => return code,
            };

            match image.metadata() {
                Ok(metadata) => {
                    info!(metadata = ?metadata, "Extracted GBL metadata");
                    println!("{}", metadata.original_json());
                }
                Err(_) => println!("null"),
            }

            ExitCode::SUCCESS
        }

        Command::Probe => {
            let mut flasher = match open_flasher(&args) {
                Ok(flasher) => flasher,
                Err(code) => return code,
            };

            match flasher.probe() {
                Ok(result) => {
                    let version = result
                        .app_version
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "unknown".into());

                    println!(
                        "{}",
                        serde_json::json!({
                            "app_type": result.app_type.as_str(),
                            "app_version": version,
                        })
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Probe failed: {e}");
                    eprintln!("✗ {e}");
                    ExitCode::FAILURE
                }
            }
        }

        Command::Flash {
            firmware,
            allow_cross_flashing,
            allow_downgrades,
            ensure_exact_version,
            force,
        } => {
            let image = match load_gbl(firmware) {
                Ok(image) => image,
                Err(code) => return code,
            };

            let policy = FlashPolicy {
                allow_cross_flashing: *allow_cross_flashing,
                allow_downgrades: *allow_downgrades,
                ensure_exact_version: *ensure_exact_version,
                force: *force,
            };

            let mut flasher = match open_flasher(&args) {
                Ok(flasher) => flasher,
                Err(code) => return code,
            };

            match flasher.flash(&image, &policy) {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("Flash failed: {e}");
                    eprintln!("✗ {e}");
                    match e {
                        Error::CrossFlashRefused { .. } | Error::DowngradeRefused { .. } => {
                            ExitCode::from(EXIT_POLICY_REFUSED)
                        }
                        Error::ImageInvalid(_) => ExitCode::from(EXIT_IMAGE_INVALID),
                        _ => ExitCode::from(EXIT_IO_FAILURE),
                    }
                }
            }
        }

        Command::WriteIeee { ieee } => {
            let mut flasher = match open_flasher(&args) {
                Ok(flasher) => flasher,
                Err(code) => return code,
            };

            match flasher.write_ieee(*ieee) {
                Ok(true) => {
                    eprintln!("✓ Wrote IEEE address {ieee}");
                    ExitCode::SUCCESS
                }
                Ok(false) => {
                    eprintln!("✓ IEEE address already matches {ieee}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Writing IEEE address failed: {e}");
                    eprintln!("✗ {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing subscriber
    let default_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    run(args)
}
