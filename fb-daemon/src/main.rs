//! fluxbard - FluxBar controller daemon
//!
//! Runs the polling engine against the system management controller and
//! offers one-shot diagnostics for fans, sensors and raw keys.

mod cli;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};

use fb_core::display;
use fb_core::{
    AppSettings, ControllerKey, ControllerSession, EngineConfig, EngineEvent, EventReceiver, FanMode,
    PollingEngine, SimulatedDriver, TelemetrySnapshot,
};

use cli::{Cli, Commands, ControllerArgs, SettingsCommands};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const JOURNAL_SOCKET: &str = "/run/systemd/journal/socket";

/// How often the main loop checks for shutdown while idle
const IDLE_POLL: Duration = Duration::from_millis(100);
/// Upper bound on waiting for a preset the engine has accepted
const PRESET_TIMEOUT: Duration = Duration::from_secs(10);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn main() {
    let cli = Cli::parse();

    let is_run = matches!(cli.command, Commands::Run { .. });
    init_logging(is_run);

    if let Err(e) = dispatch(cli) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { json, interval, preset } => {
            cmd_run(&cli.controller, json, interval, preset.as_deref())
        }
        Commands::Snapshot { json } => cmd_snapshot(&cli.controller, json),
        Commands::Preset { name } => cmd_preset(&cli.controller, &name),
        Commands::ReadKey { key } => cmd_read_key(&cli.controller, &key),
        Commands::Settings(sub) => cmd_settings(sub),
    }
}

// ============================================================================
// Logging
// ============================================================================

/// `run` goes to the journal when systemd is present; everything else logs
/// to stderr so stdout stays clean for command output.
fn init_logging(long_running: bool) {
    let default_level = if long_running { "info" } else { "warn" };
    let log_level = std::env::var("FLUXBAR_LOG").unwrap_or_else(|_| default_level.to_string());

    let mut use_journald = long_running && Path::new(JOURNAL_SOCKET).exists();

    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stderr", e);
                use_journald = false;
                init_stderr_logging(&log_level);
            }
        }
    } else {
        init_stderr_logging(&log_level);
    }

    debug!(
        "Logging to {}",
        if use_journald { "systemd journal" } else { "stderr" }
    );
}

fn init_stderr_logging(log_level: &str) {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_env_filter(log_level)
        .init();
}

// ============================================================================
// Controller Setup
// ============================================================================

fn open_session(args: &ControllerArgs) -> Result<ControllerSession> {
    if args.simulate {
        info!("Using simulated controller");
        return Ok(ControllerSession::new(SimulatedDriver::new()));
    }

    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions
        if unsafe { libc::geteuid() } != 0 {
            warn!(
                "Not running as root; {} will probably refuse access",
                args.device.display()
            );
        }
        Ok(ControllerSession::new(fb_core::PortIoDriver::with_device(&args.device)))
    }

    #[cfg(not(unix))]
    {
        bail!("No hardware driver for this platform; use --simulate")
    }
}

fn build_engine(args: &ControllerArgs, config: EngineConfig) -> Result<PollingEngine> {
    let session = open_session(args)?;
    PollingEngine::new(session, config).context("Failed to create polling engine")
}

fn install_signal_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        SHUTDOWN.store(true, Ordering::SeqCst);
    })
    .context("Failed to install signal handler")
}

fn parse_preset(name: &str) -> Result<FanMode> {
    name.parse::<FanMode>()
        .map_err(|e| anyhow!("{} (expected one of: Automatic, Manual, Full Blast)", e))
}

/// Wait for the engine to report the outcome of `preset`
fn wait_for_preset(
    engine: &PollingEngine,
    events: &mut EventReceiver,
    preset: FanMode,
) -> Result<bool> {
    let deadline = Instant::now() + PRESET_TIMEOUT;
    while Instant::now() < deadline {
        match events.try_recv() {
            Ok(EngineEvent::PresetApplied { preset: applied, succeeded }) if applied == preset => {
                return Ok(succeeded);
            }
            Ok(_) => continue,
            Err(_) if !engine.is_running() => bail!("Engine stopped before the preset ran"),
            Err(_) => thread::sleep(IDLE_POLL),
        }
    }
    bail!("Timed out waiting for preset '{}'", preset)
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_run(
    args: &ControllerArgs,
    json: bool,
    interval: Option<f64>,
    preset: Option<&str>,
) -> Result<()> {
    let mut settings = fb_core::get_cached_settings();
    if let Some(seconds) = interval {
        fb_core::engine::validate_refresh(seconds)?;
        settings.refresh_interval_secs = seconds;
    }
    let preset = match preset {
        Some(name) => parse_preset(name)?,
        None => settings.preset,
    };

    info!("fluxbard {} starting", VERSION);
    install_signal_handler()?;

    let config = EngineConfig::from_settings(&settings)?;
    info!(
        "Refresh every {:?}, withdrawing readings after {} failed passes",
        config.refresh_interval, config.stale_after_failures
    );

    let mut engine = build_engine(args, config)?;
    let mut events = engine.subscribe();
    engine.start();

    if preset != FanMode::Automatic {
        engine.set_preset(preset)?;
    }

    while !SHUTDOWN.load(Ordering::SeqCst) {
        match events.try_recv() {
            Ok(EngineEvent::SnapshotPublished { .. }) => {
                if let Some(snapshot) = engine.latest_snapshot() {
                    report_snapshot(&snapshot, json)?;
                }
            }
            Ok(EngineEvent::PresetApplied { preset, succeeded }) => {
                if succeeded {
                    info!("Preset '{}' applied", preset);
                } else {
                    warn!("Preset '{}' applied with failures", preset);
                }
            }
            Err(_) if !engine.is_running() => {
                warn!("Polling engine exited");
                break;
            }
            Err(_) => thread::sleep(IDLE_POLL),
        }
    }

    info!("Shutting down");

    // Hand the fans back to the controller before leaving
    if preset.is_forced() && engine.is_running() {
        engine.set_preset(FanMode::Automatic)?;
        match wait_for_preset(&engine, &mut events, FanMode::Automatic) {
            Ok(true) => info!("Fans returned to automatic control"),
            Ok(false) => warn!("Some fans could not be returned to automatic control"),
            Err(e) => warn!("{}", e),
        }
    }

    engine.shutdown();
    let diag = engine.diagnostics();
    info!(
        "Stopped after {} snapshots, {} failed passes",
        diag.published, diag.failed_passes
    );
    Ok(())
}

fn cmd_snapshot(args: &ControllerArgs, json: bool) -> Result<()> {
    let mut engine = build_engine(args, EngineConfig::default())?;
    engine.start();
    engine.shutdown();

    let state = engine.connection_state();
    if !state.is_connected() {
        let reason = engine
            .last_error()
            .unwrap_or_else(|| "controller unavailable".to_string());
        bail!("{}: {}", display::connection_label(&state), reason);
    }

    let snapshot = engine
        .latest_snapshot()
        .ok_or_else(|| anyhow!("No snapshot was published"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&*snapshot)?);
    } else {
        print_snapshot(&snapshot);
    }
    Ok(())
}

fn cmd_preset(args: &ControllerArgs, name: &str) -> Result<()> {
    let preset = parse_preset(name)?;

    let mut engine = build_engine(args, EngineConfig::default())?;
    let mut events = engine.subscribe();
    engine.start();
    engine.set_preset(preset)?;
    let outcome = wait_for_preset(&engine, &mut events, preset);
    engine.shutdown();
    let succeeded = outcome?;

    let diag = engine.diagnostics();
    let Some(report) = diag.last_preset else {
        bail!(
            "Preset '{}' not applied: {}",
            preset,
            engine.last_error().unwrap_or_else(|| "no report".to_string())
        );
    };

    println!("Preset: {}", report.preset);
    for outcome in &report.outcomes {
        match &outcome.error {
            None => println!("  {:<12} ok", outcome.label),
            Some(e) => println!("  {:<12} FAILED: {}", outcome.label, e),
        }
    }

    if !succeeded {
        bail!("{} fan(s) failed", report.failures().count());
    }
    Ok(())
}

fn cmd_read_key(args: &ControllerArgs, key: &str) -> Result<()> {
    let key: ControllerKey = key.parse()?;
    let mut session = open_session(args)?;
    session.open()?;

    let tx = session.read_key(key)?;
    let hex: Vec<String> = tx.bytes.iter().map(|b| format!("{:02x}", b)).collect();
    println!("Key:   {}", tx.key);
    println!("Type:  {}", tx.data_type);
    println!("Size:  {}", tx.len);
    println!("Bytes: {}", hex.join(" "));
    match tx.decode() {
        Ok(value) => println!("Value: {}", value),
        Err(e) => println!("Value: <{}>", e),
    }

    session.close();
    Ok(())
}

fn cmd_settings(sub: SettingsCommands) -> Result<()> {
    match sub {
        SettingsCommands::Show => {
            let settings = fb_core::load_settings()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            let path = fb_core::get_settings_path()?;
            eprintln!("({})", path.display());
        }
        SettingsCommands::SetPreset { name } => {
            let preset = parse_preset(&name)?;
            let saved = fb_core::update_setting(|s| s.preset = preset)?;
            println!("Preset set to '{}'", saved.preset);
        }
        SettingsCommands::SetInterval { seconds } => {
            fb_core::engine::validate_refresh(seconds)?;
            let saved = fb_core::update_setting(|s: &mut AppSettings| {
                s.refresh_interval_secs = seconds;
            })?;
            println!("Refresh interval set to {}s", saved.refresh_interval_secs);
        }
    }
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn report_snapshot(snapshot: &TelemetrySnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }
    if snapshot.is_empty() {
        warn!("#{}: no readings", snapshot.sequence);
    } else {
        info!(
            "#{}: {} fan(s), {} sensor(s), fan {}, temp {}",
            snapshot.sequence,
            snapshot.fans.len(),
            snapshot.sensors.len(),
            display::primary_fan_rpm(snapshot),
            display::primary_temperature(snapshot)
        );
    }
    Ok(())
}

fn print_snapshot(snapshot: &TelemetrySnapshot) {
    println!("Fans:");
    if snapshot.fans.is_empty() {
        println!("  (none)");
    }
    for fan in &snapshot.fans {
        let target = fan
            .target_rpm
            .map(|t| format!(", target {}", display::format_rpm(t)))
            .unwrap_or_default();
        println!(
            "  {:<12} {:>10}  [{} - {}]  {}{}",
            fan.label,
            display::format_rpm(fan.current_rpm),
            fan.min_rpm,
            fan.max_rpm,
            fan.mode,
            target
        );
    }

    for group in display::SensorGroup::ALL {
        let sensors = display::sensors_in_group(snapshot, group);
        if sensors.is_empty() {
            continue;
        }
        println!("{}:", group.title());
        for sensor in sensors {
            println!(
                "  {:<24} {:>8}  ({})",
                sensor.label,
                display::format_temperature(sensor.temperature_c),
                sensor.key
            );
        }
    }
}
