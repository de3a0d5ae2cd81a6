//! Polling engine
//!
//! # Architecture
//!
//! ```text
//!  consumer (never blocks)                 engine runtime (1 worker thread)
//! ┌──────────────────────────┐  mpsc   ┌──────────────────────────────────┐
//! │ set_preset / reconnect   │ ──────> │ select! { stop, intent, tick }   │
//! │ set_refresh_interval     │         │   spawn_blocking(group)          │
//! └──────────────────────────┘         └───────────────┬──────────────────┘
//!              ^                                       │ Mutex<Hardware>
//!              │ Arc<TelemetrySnapshot> swap           v
//! ┌──────────────────────────┐         ┌──────────────────────────────────┐
//! │ latest_snapshot()        │ <────── │ poll pass | preset | reconnect   │
//! │ subscribe() (broadcast)  │         │ one group at a time              │
//! └──────────────────────────┘         └──────────────────────────────────┘
//! ```
//!
//! Ticks that fire while a group is running are skipped, not queued, so a
//! slow controller cannot build a backlog of passes.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{error, info};

use crate::actuation::PresetReport;
use crate::constants::timing;
use crate::data::{Preset, TelemetrySnapshot};
use crate::engine::worker::{self, EngineShared, EventReceiver, Group, Hardware};
use crate::error::{FluxbarError, Result};
use crate::settings::AppSettings;
use crate::smc::{ConnectionState, ControllerSession, SessionStatus};
use crate::telemetry::TelemetryReader;

/// Engine tuning
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub refresh_interval: Duration,
    /// Consecutive failed passes before the last good snapshot is replaced by
    /// an empty one
    pub stale_after_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval: timing::DEFAULT_REFRESH,
            stale_after_failures: timing::STALE_AFTER_FAILURES,
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &AppSettings) -> Result<Self> {
        Ok(Self {
            refresh_interval: validate_refresh(settings.refresh_interval_secs)?,
            stale_after_failures: settings.stale_after_failures.max(1),
        })
    }
}

/// Accept only the supported refresh periods
pub fn validate_refresh(seconds: f64) -> Result<Duration> {
    if timing::REFRESH_CHOICES_SECS
        .iter()
        .any(|choice| (choice - seconds).abs() < 1e-9)
    {
        Ok(Duration::from_secs_f64(seconds))
    } else {
        Err(FluxbarError::invalid_config(
            "refresh_interval_secs",
            format!("{} is not one of {:?}", seconds, timing::REFRESH_CHOICES_SECS),
        ))
    }
}

/// Consumer-side requests
#[derive(Debug, Clone, Copy)]
enum Intent {
    SetRefresh(Duration),
    ApplyPreset(Preset),
    Reconnect,
}

/// Counters for status displays and tests
#[derive(Debug, Clone)]
pub struct EngineDiagnostics {
    pub running: bool,
    pub refresh_interval: Duration,
    pub published: u64,
    pub failed_passes: u64,
    pub consecutive_failures: u32,
    pub last_snapshot_age: Option<Duration>,
    pub last_preset: Option<PresetReport>,
}

/// Background poller and single owner of the controller session
pub struct PollingEngine {
    runtime: Runtime,
    hardware: Arc<Mutex<Hardware>>,
    shared: Arc<EngineShared>,
    status: Arc<SessionStatus>,
    config: EngineConfig,
    intents: Option<mpsc::Sender<Intent>>,
    shutdown: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollingEngine {
    pub fn new(session: ControllerSession, config: EngineConfig) -> Result<Self> {
        Self::with_reader(session, TelemetryReader::new(), config)
    }

    pub fn with_reader(session: ControllerSession, reader: TelemetryReader, config: EngineConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(2)
            .thread_name("fluxbar-engine")
            .enable_time()
            .build()
            .map_err(|e| FluxbarError::Runtime(format!("failed to build engine runtime: {}", e)))?;

        let status = session.status();
        let hardware = Hardware::new(session, reader, config.stale_after_failures.max(1));

        Ok(Self {
            runtime,
            hardware: Arc::new(Mutex::new(hardware)),
            shared: Arc::new(EngineShared::new(timing::NOTIFY_CAPACITY)),
            status,
            config,
            intents: None,
            shutdown: None,
            task: None,
        })
    }

    /// True while the worker task is alive, including a stopping one
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Begin polling. The first pass runs immediately. No-op when running.
    pub fn start(&mut self) {
        if self.shutdown.is_some() && self.is_running() {
            return;
        }

        let (intent_tx, intent_rx) = mpsc::channel(timing::INTENT_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let hardware = Arc::clone(&self.hardware);
        let shared = Arc::clone(&self.shared);
        let period = self.config.refresh_interval;
        self.task = Some(
            self.runtime
                .spawn(run_worker(hardware, shared, intent_rx, shutdown_rx, period)),
        );
        self.intents = Some(intent_tx);
        self.shutdown = Some(shutdown_tx);
    }

    /// Cancel future ticks. A group already executing finishes and publishes.
    /// Returns immediately.
    pub fn stop(&mut self) {
        self.intents = None;
        if self.shutdown.take().is_some() {
            info!("Polling engine stop requested");
        }
    }

    /// Wait until the worker has exited. Must not be called from async code.
    pub fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = self.runtime.block_on(task) {
                error!("Engine worker ended abnormally: {}", e);
            }
        }
    }

    /// `stop()` then `join()`
    pub fn shutdown(&mut self) {
        self.stop();
        self.join();
    }

    pub fn refresh_interval(&self) -> Duration {
        self.config.refresh_interval
    }

    /// Change the poll period. Takes effect from the next tick.
    pub fn set_refresh_interval(&mut self, seconds: f64) -> Result<()> {
        let period = validate_refresh(seconds)?;
        if self.intents.is_some() {
            self.send(Intent::SetRefresh(period))?;
        }
        self.config.refresh_interval = period;
        Ok(())
    }

    /// Queue a preset for every fan
    pub fn set_preset(&self, preset: Preset) -> Result<()> {
        self.send(Intent::ApplyPreset(preset))
    }

    /// Queue a close-then-open of the controller session
    pub fn reconnect(&self) -> Result<()> {
        self.send(Intent::Reconnect)
    }

    fn send(&self, intent: Intent) -> Result<()> {
        let tx = self.intents.as_ref().ok_or(FluxbarError::EngineStopped)?;
        tx.try_send(intent).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                FluxbarError::Runtime("engine intent queue is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => FluxbarError::EngineStopped,
        })
    }

    /// Most recent snapshot, `None` before the first pass completes
    pub fn latest_snapshot(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.shared.latest()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.shared.subscribe()
    }

    pub fn diagnostics(&self) -> EngineDiagnostics {
        EngineDiagnostics {
            running: self.is_running(),
            refresh_interval: self.config.refresh_interval,
            published: self.shared.published(),
            failed_passes: self.shared.failed_passes(),
            consecutive_failures: self.shared.consecutive_failures(),
            last_snapshot_age: self.shared.latest().map(|s| worker::age(&s)),
            last_preset: self.shared.last_preset(),
        }
    }
}

impl Drop for PollingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn run_group(hardware: &Arc<Mutex<Hardware>>, shared: &Arc<EngineShared>, group: Group) {
    let hardware = Arc::clone(hardware);
    let shared = Arc::clone(shared);
    let result = tokio::task::spawn_blocking(move || hardware.lock().run(group, &shared)).await;
    if let Err(e) = result {
        error!("Hardware task panicked during {:?}: {}", group, e);
    }
}

async fn run_worker(
    hardware: Arc<Mutex<Hardware>>,
    shared: Arc<EngineShared>,
    mut intents: mpsc::Receiver<Intent>,
    mut shutdown: mpsc::Receiver<()>,
    period: Duration,
) {
    info!("Polling engine started, period {:?}", period);
    run_group(&hardware, &shared, Group::Poll).await;

    let mut interval = ticker(period);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            intent = intents.recv() => match intent {
                Some(Intent::SetRefresh(p)) => {
                    info!("Refresh period now {:?}", p);
                    interval = ticker(p);
                }
                Some(Intent::ApplyPreset(preset)) => {
                    run_group(&hardware, &shared, Group::Preset(preset)).await;
                }
                Some(Intent::Reconnect) => {
                    run_group(&hardware, &shared, Group::Reconnect).await;
                }
                None => break,
            },
            _ = interval.tick() => run_group(&hardware, &shared, Group::Poll).await,
        }
    }

    info!("Polling engine stopped");
}
