//! ECU Simulator CLI Application
//!
//! Command-line front end for the ecu-sim-core engine. It adds:
//! - Argument parsing and the TOML run profile
//! - Settings precedence (CLI > control.json > profile > defaults)
//! - Logging setup and Ctrl-C handling
//! - The run modes: broadcast, monitor-only, sniff-stats and self-test

use anyhow::{Context, Result};
use clap::Parser;
use ecu_sim_core::control::ControlOverlay;
use ecu_sim_core::listener::SNIFF_FOCUS_ID;
use ecu_sim_core::scenario::{default_custom_values, scenario_values};
use ecu_sim_core::scheduler::period_from_hz;
use ecu_sim_core::telemetry::write_atomic;
use ecu_sim_core::transport::{slcan, validate_bitrate};
use ecu_sim_core::{
    load_database, open_transport, parse_custom_frames, reference_database, sniff, Backend,
    CanTransport, ControlConfig, ControlReader, CustomScheduler, EventLog, FrameBuilder, Listener,
    ListenerConfig, Mode, SessionConfig, SignalCodec, SignalDatabase, StopSignal,
    TelemetryWriter, TransmissionSession, TxLog, VirtualBus,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod selftest;

use config::RunProfile;

/// ECU Simulator - Broadcast MegaSquirt dash frames on a CAN bus
#[derive(Parser, Debug)]
#[command(name = "ecu-sim")]
#[command(about = "Simulate an ECU broadcasting dash telemetry on CAN", long_about = None)]
#[command(version)]
struct Args {
    /// Path to run profile (ecu-sim.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Link backend: native, slcan or virtual
    #[arg(long)]
    backend: Option<Backend>,

    /// Network interface (native) or channel name (virtual)
    #[arg(long)]
    iface: Option<String>,

    /// Adapter channel index
    #[arg(long)]
    channel: Option<u32>,

    /// Serial port of an SLCAN adapter (auto-detected when omitted)
    #[arg(long, value_name = "DEVICE")]
    port: Option<String>,

    /// Serial line speed of an SLCAN adapter
    #[arg(long, value_name = "BAUD")]
    serial_baud: Option<u32>,

    /// Do not program the SLCAN bitrate (adapter is preconfigured)
    #[arg(long)]
    skip_bitrate: bool,

    /// CAN bitrate in bit/s
    #[arg(long)]
    bitrate: Option<u32>,

    /// Broadcast rate in Hz
    #[arg(long)]
    hz: Option<f64>,

    /// Broadcast mode: loop, koeo, idle, pull, custom or silent
    #[arg(long)]
    mode: Option<Mode>,

    /// Control file polled while running
    #[arg(long, value_name = "FILE")]
    control: Option<PathBuf>,

    /// Telemetry snapshot output
    #[arg(long, value_name = "FILE")]
    telemetry: Option<PathBuf>,

    /// JSONL event log
    #[arg(long, value_name = "FILE")]
    event_log: Option<PathBuf>,

    /// Stop flag file; the run ends when it appears
    #[arg(long, value_name = "FILE")]
    stop_file: Option<PathBuf>,

    /// DBC to validate against the dash layout (embedded copy when omitted)
    #[arg(long, value_name = "FILE")]
    dbc: Option<PathBuf>,

    /// Raw frame schedule used in custom mode
    #[arg(long, value_name = "FILE")]
    custom_file: Option<PathBuf>,

    /// CSV log of transmitted frames
    #[arg(long, value_name = "FILE")]
    tx_log: Option<PathBuf>,

    /// CSV log of received frames
    #[arg(long, value_name = "FILE")]
    rx_log: Option<PathBuf>,

    /// Decode received frames into the RX log
    #[arg(long)]
    decode: bool,

    /// Only listen; never transmit
    #[arg(long)]
    monitor_only: bool,

    /// Listen for SECONDS and print per-ID statistics
    #[arg(long, value_name = "SECONDS")]
    sniff_stats: Option<f64>,

    /// Stop after SECONDS
    #[arg(long, value_name = "SECONDS")]
    duration: Option<f64>,

    /// Log per-ID TX counts once per second
    #[arg(long)]
    tx_stats: bool,

    /// Hard-reset the adapter before reopening a stalled link
    #[arg(long)]
    hardkill_on_stall: bool,

    /// Run the offline self-test and exit
    #[arg(long)]
    selftest: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Settings given on the command line, highest precedence
    fn overlay(&self) -> ControlOverlay {
        ControlOverlay {
            backend: self.backend,
            iface: self.iface.clone(),
            channel: self.channel,
            port: self.port.clone(),
            serial_baud: self.serial_baud,
            skip_bitrate: self.skip_bitrate.then_some(true),
            bitrate: self.bitrate,
            hz: self.hz,
            mode: self.mode,
            ..Default::default()
        }
    }
}

/// File locations after merging CLI flags over the profile
struct Paths {
    control: PathBuf,
    telemetry: PathBuf,
    event_log: PathBuf,
    stop_file: PathBuf,
    dbc: Option<PathBuf>,
    custom_file: Option<PathBuf>,
    tx_log: Option<PathBuf>,
    rx_log: Option<PathBuf>,
}

impl Paths {
    fn resolve(args: &Args, profile: &RunProfile) -> Self {
        let p = &profile.paths;
        Self {
            control: args.control.clone().unwrap_or_else(|| p.control.clone()),
            telemetry: args.telemetry.clone().unwrap_or_else(|| p.telemetry.clone()),
            event_log: args.event_log.clone().unwrap_or_else(|| p.event_log.clone()),
            stop_file: args.stop_file.clone().unwrap_or_else(|| p.stop_file.clone()),
            dbc: args.dbc.clone().or_else(|| p.dbc.clone()),
            custom_file: args.custom_file.clone().or_else(|| p.custom_file.clone()),
            tx_log: args.tx_log.clone().or_else(|| p.tx_log.clone()),
            rx_log: args.rx_log.clone().or_else(|| p.rx_log.clone()),
        }
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("ECU Simulator CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using engine library v{}", ecu_sim_core::VERSION);

    if args.selftest {
        return selftest::run().context("Self-test failed");
    }

    let profile = match &args.config {
        Some(path) => {
            log::info!("Loading run profile from: {:?}", path);
            config::load_profile(path)?
        }
        None => RunProfile::default(),
    };
    let paths = Paths::resolve(&args, &profile);
    let settings = resolve_settings(&args, &profile, &paths.control)?;
    log::debug!("Resolved settings: {:?}", settings);

    let stop = StopSignal::with_file(&paths.stop_file);
    stop.clear_stale();
    let handle = stop.handle();
    ctrlc::set_handler(move || {
        log::info!("Interrupt received; stopping");
        handle.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    let bus = VirtualBus::new();
    let transport_config = settings.transport_config();
    let transport = open_transport(&transport_config, &bus)
        .with_context(|| format!("Cannot create transport {}", transport_config.interface_label()))?;

    if let Some(seconds) = args.sniff_stats {
        return sniff_mode(transport, seconds, &stop);
    }

    let database = Arc::new(load_layout(paths.dbc.as_deref(), &profile)?);

    if args.monitor_only {
        return monitor_mode(transport, database, &args, &paths, &stop);
    }

    broadcast_mode(transport, database, &args, &profile, &paths, &settings, stop)
}

/// Defaults, then profile, then control file, then command line
fn resolve_settings(args: &Args, profile: &RunProfile, control: &Path) -> Result<ControlConfig> {
    let mut settings = ControlConfig::default();
    settings.apply(&profile.overlay());
    settings.apply(&ControlOverlay::load(control));
    settings.apply(&args.overlay());

    period_from_hz(settings.hz).context("Invalid broadcast rate")?;
    match settings.backend {
        Backend::Slcan if !settings.skip_bitrate => {
            anyhow::ensure!(
                slcan::bitrate_command(settings.bitrate).is_some(),
                "SLCAN does not support bitrate {} (supported: {:?})",
                settings.bitrate,
                slcan::supported_bitrates()
            );
        }
        Backend::Slcan => {}
        Backend::Native | Backend::Virtual => {
            validate_bitrate(settings.bitrate)?;
        }
    }
    Ok(settings)
}

fn load_layout(dbc: Option<&Path>, profile: &RunProfile) -> Result<SignalDatabase> {
    match dbc {
        Some(path) => load_database(path, profile.session.enforce_dbc_hash)
            .with_context(|| format!("DBC {:?} rejected", path)),
        None => reference_database().context("Embedded reference layout rejected"),
    }
}

fn open_link(transport: &dyn CanTransport) -> Result<()> {
    transport
        .open()
        .with_context(|| format!("Cannot open {}", transport.describe()))?;
    log::info!("Opened {}", transport.describe());
    Ok(())
}

/// Longest run length accepted on the command line or in the profile
const MAX_RUN_SECONDS: f64 = 365.0 * 86_400.0;

/// A positive number of seconds as a `Duration`
fn seconds_arg(name: &str, seconds: f64) -> Result<Duration> {
    anyhow::ensure!(
        seconds.is_finite() && seconds > 0.0 && seconds <= MAX_RUN_SECONDS,
        "{} must be between 0 and {} seconds, got {}",
        name,
        MAX_RUN_SECONDS,
        seconds
    );
    Duration::try_from_secs_f64(seconds).with_context(|| format!("{} out of range", name))
}

fn sniff_mode(transport: Arc<dyn CanTransport>, seconds: f64, stop: &StopSignal) -> Result<()> {
    let window = seconds_arg("--sniff-stats", seconds)?;
    open_link(transport.as_ref())?;
    log::info!("Sniffing for {:.1}s", seconds);
    sniff(transport.as_ref(), window, SNIFF_FOCUS_ID, stop);
    transport.close();
    Ok(())
}

fn monitor_mode(
    transport: Arc<dyn CanTransport>,
    database: Arc<SignalDatabase>,
    args: &Args,
    paths: &Paths,
    stop: &StopSignal,
) -> Result<()> {
    open_link(transport.as_ref())?;
    let listener = Listener::spawn(
        Arc::clone(&transport),
        Some(database),
        ListenerConfig {
            rx_log: paths.rx_log.clone(),
            decode: args.decode,
        },
        stop.clone(),
    )
    .context("Failed to start listener")?;

    log::info!("Monitor-only mode; waiting for stop");
    let clock = ecu_sim_core::SystemClock;
    let limit = args
        .duration
        .map(|d| seconds_arg("--duration", d))
        .transpose()?;
    match limit {
        Some(limit) => {
            stop.sleep(&clock, limit);
        }
        None => while stop.sleep(&clock, Duration::from_secs(1)) {},
    }

    let received = listener.join();
    transport.close();
    log::info!("RX summary rx_frames={}", received);
    Ok(())
}

fn broadcast_mode(
    transport: Arc<dyn CanTransport>,
    database: Arc<SignalDatabase>,
    args: &Args,
    profile: &RunProfile,
    paths: &Paths,
    settings: &ControlConfig,
    stop: StopSignal,
) -> Result<()> {
    let custom_frames = match &paths.custom_file {
        Some(path) => Some(parse_custom_frames(path).context("Custom frame schedule rejected")?),
        None => None,
    };

    seed_control_file(&paths.control, settings);
    log_tx_sample(&database, settings.mode);

    open_link(transport.as_ref())?;

    let listener = Listener::spawn(
        Arc::clone(&transport),
        Some(Arc::clone(&database)),
        ListenerConfig {
            rx_log: paths.rx_log.clone(),
            decode: args.decode,
        },
        stop.clone(),
    )
    .context("Failed to start listener")?;

    let duration = args
        .duration
        .or(profile.session.duration)
        .map(|d| seconds_arg("duration", d))
        .transpose()?;
    let config = SessionConfig {
        session_id: 1,
        hz: settings.hz,
        mode: settings.mode,
        follow_control_mode: args.mode.is_none(),
        duration,
        tx_stats: args.tx_stats || profile.session.tx_stats,
        interface: settings.transport_config().interface_label(),
        channel: settings.channel,
        bitrate: settings.bitrate,
        recovery: profile.recovery_policy(args.hardkill_on_stall),
    };

    let mut session =
        TransmissionSession::new(config, database, Arc::clone(&transport), stop.clone())?
            .with_listener(listener)
            .with_control(ControlReader::new(&paths.control))
            .with_telemetry(TelemetryWriter::new(
                &paths.telemetry,
                profile.session.telemetry_hz,
            ))
            .with_events(EventLog::new(&paths.event_log));

    if let Some(path) = &paths.tx_log {
        let tx_log = TxLog::open(path).with_context(|| format!("Cannot open TX log {:?}", path))?;
        session = session.with_tx_log(tx_log);
    }

    if let Some(frames) = custom_frames {
        if settings.mode == Mode::Custom {
            log::info!("Custom schedule with {} frames replaces the dash broadcast", frames.len());
            let custom = CustomScheduler::spawn(Arc::clone(&transport), frames, stop.clone())
                .context("Failed to start custom scheduler")?;
            session = session.with_custom_scheduler(custom);
        } else {
            log::warn!("Custom frame schedule ignored outside custom mode");
        }
    }

    let summary = session.run().context("Transmission session failed")?;
    log::info!(
        "Run finished: mode={} ticks={} tx_frames={} tx_errors={} rx_frames={} reopens={} elapsed={:.1}s",
        summary.mode,
        summary.ticks,
        summary.tx_frames,
        summary.tx_errors,
        summary.rx_frames,
        summary.reopens,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}

/// Write a starter control file if none exists yet
fn seed_control_file(path: &Path, settings: &ControlConfig) {
    if path.exists() {
        return;
    }
    let seed = ControlConfig {
        custom: default_custom_values(),
        ..settings.clone()
    };
    let result = serde_json::to_vec_pretty(&seed)
        .map_err(std::io::Error::from)
        .and_then(|bytes| write_atomic(path, &bytes));
    match result {
        Ok(()) => log::info!("Created control file {:?}", path),
        Err(e) => log::warn!("Cannot create control file {:?}: {}", path, e),
    }
}

/// Log the payload of every message for the starting values
fn log_tx_sample(database: &SignalDatabase, mode: Mode) {
    let mut codec = SignalCodec::new();
    match FrameBuilder::new(database).build(&mut codec, &scenario_values(mode, 0.0)) {
        Ok(built) => {
            for (id, name, data) in &built.payloads {
                log::info!(
                    "TX_SAMPLE id=0x{:x} name={} data={}",
                    id,
                    name,
                    ecu_sim_core::types::hex_lower(data)
                );
            }
        }
        Err(e) => log::warn!("TX_SAMPLE unavailable: {}", e),
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
