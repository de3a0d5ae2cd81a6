//! Hardware transaction groups
//!
//! Everything in here runs on the blocking pool while the caller holds the
//! hardware lock, so a poll pass and a preset application never interleave.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::actuation::{ActuationController, PresetReport};
use crate::data::{FanRecord, Preset, SensorRecord, TelemetrySnapshot};
use crate::error::{ReadError, Result};
use crate::smc::ControllerSession;
use crate::telemetry::TelemetryReader;

/// Notification sent to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A new snapshot is available through `latest_snapshot()`
    SnapshotPublished { sequence: u64 },
    /// A preset finished; details in `diagnostics().last_preset`
    PresetApplied { preset: Preset, succeeded: bool },
}

/// Receiving end of [`PollingEngine::subscribe`](super::PollingEngine::subscribe)
pub type EventReceiver = broadcast::Receiver<EngineEvent>;

/// One unit of serialized hardware work
#[derive(Debug, Clone, Copy)]
pub(crate) enum Group {
    Poll,
    Preset(Preset),
    Reconnect,
}

/// State the worker publishes and the consumer reads
pub(crate) struct EngineShared {
    latest: RwLock<Option<Arc<TelemetrySnapshot>>>,
    last_preset: RwLock<Option<PresetReport>>,
    events: broadcast::Sender<EngineEvent>,
    sequence: AtomicU64,
    published: AtomicU64,
    failed_passes: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl EngineShared {
    pub(crate) fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            latest: RwLock::new(None),
            last_preset: RwLock::new(None),
            events,
            sequence: AtomicU64::new(0),
            published: AtomicU64::new(0),
            failed_passes: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub(crate) fn latest(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.latest.read().clone()
    }

    pub(crate) fn last_preset(&self) -> Option<PresetReport> {
        self.last_preset.read().clone()
    }

    pub(crate) fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub(crate) fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub(crate) fn failed_passes(&self) -> u64 {
        self.failed_passes.load(Ordering::Relaxed)
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Swap in a new snapshot. Sequence and capture time only ever increase.
    fn publish(&self, fans: Vec<FanRecord>, sensors: Vec<SensorRecord>) -> Arc<TelemetrySnapshot> {
        let mut latest = self.latest.write();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut snapshot = TelemetrySnapshot::new(fans, sensors, sequence);
        if let Some(prev) = latest.as_ref() {
            if snapshot.captured_at <= prev.captured_at {
                snapshot.captured_at = prev.captured_at + Duration::from_micros(1);
            }
        }
        let snapshot = Arc::new(snapshot);
        *latest = Some(Arc::clone(&snapshot));
        drop(latest);

        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine
        let _ = self.events.send(EngineEvent::SnapshotPublished { sequence });
        snapshot
    }
}

/// Session plus the components that drive it
pub(crate) struct Hardware {
    session: ControllerSession,
    reader: TelemetryReader,
    actuation: ActuationController,
    stale_after_failures: u32,
    open_attempted: bool,
}

impl Hardware {
    pub(crate) fn new(session: ControllerSession, reader: TelemetryReader, stale_after_failures: u32) -> Self {
        Self {
            session,
            reader,
            actuation: ActuationController::new(),
            stale_after_failures,
            open_attempted: false,
        }
    }

    pub(crate) fn run(&mut self, group: Group, shared: &EngineShared) {
        match group {
            Group::Poll => self.poll(shared),
            Group::Preset(preset) => self.apply_preset(preset, shared),
            Group::Reconnect => self.reconnect(shared),
        }
    }

    /// Open once on first use; afterwards reopening is the consumer's call
    fn ensure_open(&mut self) -> Result<()> {
        if self.session.is_connected() {
            return Ok(());
        }
        if self.open_attempted {
            return Err(ReadError::NotConnected.into());
        }
        self.open_attempted = true;
        self.session.open()?;
        Ok(())
    }

    fn read_pass(&mut self) -> Result<(Vec<FanRecord>, Vec<SensorRecord>)> {
        self.ensure_open()?;
        let fans = self.reader.list_fans(&mut self.session, self.actuation.ledger())?;
        let sensors = self.reader.list_sensors(&mut self.session)?;
        Ok((fans, sensors))
    }

    fn poll(&mut self, shared: &EngineShared) {
        match self.read_pass() {
            Ok((fans, sensors)) => {
                shared.consecutive_failures.store(0, Ordering::Relaxed);
                let snapshot = shared.publish(fans, sensors);
                debug!(
                    "Published snapshot #{} ({} fans, {} sensors)",
                    snapshot.sequence,
                    snapshot.fans.len(),
                    snapshot.sensors.len()
                );
            }
            Err(e) => {
                shared.failed_passes.fetch_add(1, Ordering::Relaxed);
                let failures = shared.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if reports_loudly(failures) {
                    error!("Poll pass failed: {}", e);
                } else {
                    debug!("Poll pass failed ({} in a row): {}", failures, e);
                }

                match shared.latest() {
                    None => {
                        shared.publish(Vec::new(), Vec::new());
                    }
                    Some(prev) if !prev.is_empty() && failures >= self.stale_after_failures => {
                        warn!("Telemetry lost for {} passes, withdrawing last snapshot", failures);
                        shared.publish(Vec::new(), Vec::new());
                    }
                    Some(_) => {}
                }
            }
        }
    }

    fn apply_preset(&mut self, preset: Preset, shared: &EngineShared) {
        let fans = match self
            .ensure_open()
            .and_then(|_| Ok(self.reader.list_fans(&mut self.session, self.actuation.ledger())?))
        {
            Ok(fans) => fans,
            Err(e) => {
                warn!("Preset '{}' not applied: {}", preset, e);
                let _ = shared.events.send(EngineEvent::PresetApplied { preset, succeeded: false });
                return;
            }
        };

        let report = self.actuation.apply_preset(&mut self.session, preset, &fans);
        let succeeded = report.all_succeeded();
        info!(
            "Preset '{}' applied to {} fan(s), {} failed",
            preset,
            report.outcomes.len(),
            report.failures().count()
        );
        *shared.last_preset.write() = Some(report);
        let _ = shared.events.send(EngineEvent::PresetApplied { preset, succeeded });
    }

    fn reconnect(&mut self, shared: &EngineShared) {
        self.open_attempted = true;
        match self.session.reconnect() {
            Ok(handle) => {
                info!("Reconnected ({})", handle);
                shared.consecutive_failures.store(0, Ordering::Relaxed);
                self.poll(shared);
            }
            Err(e) => warn!("Reconnect failed: {}", e),
        }
    }
}

/// Only the first failure of a run is worth an error line; the rest repeat it
/// every tick until someone reconnects
fn reports_loudly(consecutive_failures: u32) -> bool {
    consecutive_failures == 1
}

/// Capture-time helper for tests and diagnostics
pub(crate) fn age(snapshot: &TelemetrySnapshot) -> Duration {
    SystemTime::now()
        .duration_since(snapshot.captured_at)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_failure_logged_as_error() {
        assert!(reports_loudly(1));
        assert!(!reports_loudly(2));
        assert!(!reports_loudly(10));
    }

    #[test]
    fn test_publish_sequence_and_time_increase() {
        let shared = EngineShared::new(4);
        let first = shared.publish(Vec::new(), Vec::new());
        let second = shared.publish(Vec::new(), Vec::new());
        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert!(second.captured_at > first.captured_at);
        assert_eq!(shared.published(), 2);
    }
}
