//! Fan actuation
//!
//! Applies presets fan by fan. A fan that fails is recorded in the report and
//! the remaining fans are still attempted; nothing already written is rolled
//! back.
//!
//! The controller does not reliably report back the mode it was given, so the
//! last command per fan is kept in an [`ActuationLedger`] that the telemetry
//! reader uses to seed each new [`FanRecord`].

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::{fan, keys};
use crate::data::{FanMode, FanRecord, Preset};
use crate::error::{FluxbarError, ReadError, Result, WriteError};
use crate::smc::codec;
use crate::smc::{ControllerKey, ControllerSession};

/// Last commanded mode and target per fan id
#[derive(Debug, Clone, Default)]
pub struct ActuationLedger {
    entries: HashMap<u8, LedgerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LedgerEntry {
    mode: FanMode,
    target_rpm: Option<u32>,
}

impl ActuationLedger {
    /// Commanded mode, `Automatic` when nothing was commanded
    pub fn mode(&self, fan_id: u8) -> FanMode {
        self.entries.get(&fan_id).map(|e| e.mode).unwrap_or_default()
    }

    pub fn target(&self, fan_id: u8) -> Option<u32> {
        self.entries.get(&fan_id).and_then(|e| e.target_rpm)
    }

    fn record(&mut self, fan_id: u8, mode: FanMode, target_rpm: Option<u32>) {
        let previous_target = self.target(fan_id);
        self.entries.insert(
            fan_id,
            LedgerEntry {
                mode,
                target_rpm: target_rpm.or(previous_target),
            },
        );
    }

    fn release(&mut self, fan_id: u8) {
        self.entries.remove(&fan_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of one fan during a preset application
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanOutcome {
    pub fan_id: u8,
    pub label: String,
    /// `None` when every write for this fan succeeded
    pub error: Option<String>,
}

impl FanOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-fan results of one preset application
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresetReport {
    pub preset: Preset,
    pub outcomes: Vec<FanOutcome>,
}

impl PresetReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(FanOutcome::is_ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &FanOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }
}

/// Writes fan mode and target registers
#[derive(Debug, Default)]
pub struct ActuationController {
    ledger: ActuationLedger,
}

impl ActuationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> &ActuationLedger {
        &self.ledger
    }

    /// Apply `preset` to every fan in `fans`
    pub fn apply_preset(
        &mut self,
        session: &mut ControllerSession,
        preset: Preset,
        fans: &[FanRecord],
    ) -> PresetReport {
        info!("Applying preset '{}' to {} fan(s)", preset, fans.len());
        let outcomes: Vec<FanOutcome> = fans
            .iter()
            .map(|f| {
                let result = self.apply_to_fan(session, preset, f);
                if let Err(e) = &result {
                    warn!("Preset '{}' failed on fan {} ({}): {}", preset, f.id, f.label, e);
                }
                FanOutcome {
                    fan_id: f.id,
                    label: f.label.clone(),
                    error: result.err().map(|e| e.to_string()),
                }
            })
            .collect();

        PresetReport { preset, outcomes }
    }

    fn apply_to_fan(
        &mut self,
        session: &mut ControllerSession,
        preset: Preset,
        record: &FanRecord,
    ) -> Result<()> {
        match preset {
            FanMode::Automatic => {
                set_mode(session, record.id, false)?;
                self.ledger.release(record.id);
            }
            FanMode::Manual => {
                set_mode(session, record.id, true)?;
                self.ledger.record(record.id, FanMode::Manual, None);
            }
            FanMode::FullBlast => {
                set_mode(session, record.id, true)?;
                // The fan is forced from here on, even if the target write fails
                self.ledger.record(record.id, FanMode::Manual, None);
                let target = ControllerKey::fan(record.id, keys::fan::TARGET)?;
                write_number(session, target, record.max_rpm as f64)?;
                self.ledger.record(record.id, FanMode::FullBlast, Some(record.max_rpm));
            }
        }
        Ok(())
    }
}

/// Encode `value` in the key's declared encoding and write it
fn write_number(session: &mut ControllerSession, key: ControllerKey, value: f64) -> Result<()> {
    let info = session.key_info(key).map_err(WriteError::from)?;
    let payload = codec::encode_value(info.data_type, value)?;
    session.write_key(key, &payload)?;
    debug!("{} <- {}", key, value);
    Ok(())
}

/// Set the per-fan mode flag, falling back to the forced-mode bitmask on
/// controllers without `F{n}Md`
fn set_mode(session: &mut ControllerSession, fan_id: u8, forced: bool) -> Result<()> {
    let key = ControllerKey::fan(fan_id, keys::fan::MODE)?;
    let flag = if forced { fan::MODE_MANUAL } else { fan::MODE_AUTO };
    match write_number(session, key, flag as f64) {
        Err(FluxbarError::Write(WriteError::UnknownKey(_))) => {
            debug!("{} absent, using forced-mode bitmask", key);
            set_forced_bit(session, fan_id, forced)
        }
        other => other,
    }
}

fn set_forced_bit(session: &mut ControllerSession, fan_id: u8, forced: bool) -> Result<()> {
    let key: ControllerKey = keys::FORCED_MODE_MASK.parse()?;
    let tx = session.read_key(key).map_err(|e| match e {
        ReadError::UnknownKey(_) => FluxbarError::Write(WriteError::UnknownKey(format!(
            "F{}{} and {}",
            fan_id,
            keys::fan::MODE,
            key
        ))),
        other => other.into(),
    })?;
    let mask = tx.decode()? as u32;
    let bit = 1u32 << fan_id;
    let mask = if forced { mask | bit } else { mask & !bit };
    let payload = codec::encode_value(tx.data_type, mask as f64)?;
    session.write_key(key, &payload)?;
    debug!("{} <- 0b{:b}", key, mask);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smc::codec::DataType;
    use crate::smc::SimulatedDriver;

    fn record(id: u8, max_rpm: u32) -> FanRecord {
        FanRecord {
            id,
            label: if id == 0 { "Exhaust".into() } else { format!("Fan {}", id) },
            current_rpm: 1200,
            min_rpm: 1000,
            max_rpm,
            target_rpm: None,
            mode: FanMode::Automatic,
        }
    }

    fn two_fan_rig() -> (SimulatedDriver, ControllerSession) {
        let sim = SimulatedDriver::empty()
            .with_fan(1200.0, 1000.0, 6000.0)
            .with_fan(1100.0, 1000.0, 4800.0);
        let mut session = ControllerSession::new(sim.clone());
        session.open().unwrap();
        (sim, session)
    }

    #[test]
    fn test_full_blast_targets_each_fans_own_max() {
        let (sim, mut session) = two_fan_rig();
        let mut ctl = ActuationController::new();
        let report = ctl.apply_preset(
            &mut session,
            FanMode::FullBlast,
            &[record(0, 6000), record(1, 4800)],
        );

        assert!(report.all_succeeded());
        assert_eq!(sim.value("F0Md"), Some(1.0));
        assert_eq!(sim.value("F1Md"), Some(1.0));
        assert_eq!(sim.value("F0Tg"), Some(6000.0));
        assert_eq!(sim.value("F1Tg"), Some(4800.0));
        assert_eq!(ctl.ledger().mode(1), FanMode::FullBlast);
        assert_eq!(ctl.ledger().target(1), Some(4800));
    }

    #[test]
    fn test_manual_leaves_target_untouched() {
        let (sim, mut session) = two_fan_rig();
        let mut ctl = ActuationController::new();
        ctl.apply_preset(&mut session, FanMode::Manual, &[record(0, 6000)]);

        assert_eq!(sim.value("F0Md"), Some(1.0));
        assert_eq!(sim.value("F0Tg"), Some(0.0));
        assert!(sim.writes().iter().all(|(k, _)| k.as_str() != "F0Tg"));
        assert_eq!(ctl.ledger().mode(0), FanMode::Manual);
    }

    #[test]
    fn test_automatic_clears_ledger() {
        let (sim, mut session) = two_fan_rig();
        let mut ctl = ActuationController::new();
        let fans = [record(0, 6000), record(1, 4800)];
        ctl.apply_preset(&mut session, FanMode::FullBlast, &fans);
        ctl.apply_preset(&mut session, FanMode::Automatic, &fans);

        assert_eq!(sim.value("F0Md"), Some(0.0));
        assert_eq!(sim.value("F1Md"), Some(0.0));
        assert!(ctl.ledger().is_empty());
        assert_eq!(ctl.ledger().mode(0), FanMode::Automatic);
    }

    #[test]
    fn test_failure_is_recorded_and_others_continue() {
        let sim = SimulatedDriver::empty()
            .with_fan(1200.0, 1000.0, 6000.0)
            .with_fan(1100.0, 1000.0, 4800.0)
            .without_key("F0Tg");
        let mut session = ControllerSession::new(sim.clone());
        session.open().unwrap();
        let mut ctl = ActuationController::new();

        let report = ctl.apply_preset(
            &mut session,
            FanMode::FullBlast,
            &[record(0, 6000), record(1, 4800)],
        );

        assert!(!report.all_succeeded());
        let failed: Vec<u8> = report.failures().map(|o| o.fan_id).collect();
        assert_eq!(failed, vec![0]);
        // No rollback of the mode flag already written
        assert_eq!(sim.value("F0Md"), Some(1.0));
        assert_eq!(sim.value("F1Tg"), Some(4800.0));
    }

    #[test]
    fn test_partial_full_blast_leaves_fan_marked_forced() {
        let sim = SimulatedDriver::empty()
            .with_fan(1200.0, 1000.0, 6000.0)
            .without_key("F0Tg");
        let mut session = ControllerSession::new(sim.clone());
        session.open().unwrap();
        let mut ctl = ActuationController::new();

        let report = ctl.apply_preset(&mut session, FanMode::FullBlast, &[record(0, 6000)]);
        assert!(!report.all_succeeded());
        assert_eq!(sim.value("F0Md"), Some(1.0));
        assert_eq!(ctl.ledger().mode(0), FanMode::Manual);
        assert_eq!(ctl.ledger().target(0), None);

        let fans = crate::telemetry::TelemetryReader::new()
            .list_fans(&mut session, ctl.ledger())
            .unwrap();
        assert_eq!(fans[0].mode, FanMode::Manual);
    }

    #[test]
    fn test_forced_mode_bitmask_fallback() {
        let sim = SimulatedDriver::empty()
            .with_fan(1200.0, 1000.0, 6000.0)
            .with_fan(1100.0, 1000.0, 4800.0)
            .without_key("F0Md")
            .without_key("F1Md")
            .with_register("FS! ", DataType::Ui16, 0.0);
        let mut session = ControllerSession::new(sim.clone());
        session.open().unwrap();
        let mut ctl = ActuationController::new();

        let fans = [record(0, 6000), record(1, 4800)];
        assert!(ctl.apply_preset(&mut session, FanMode::Manual, &fans).all_succeeded());
        assert_eq!(sim.value("FS! "), Some(3.0));

        assert!(ctl
            .apply_preset(&mut session, FanMode::Automatic, &fans[..1])
            .all_succeeded());
        assert_eq!(sim.value("FS! "), Some(2.0));
    }

    #[test]
    fn test_no_mode_key_at_all_fails_fan() {
        let sim = SimulatedDriver::empty()
            .with_fan(1200.0, 1000.0, 6000.0)
            .without_key("F0Md");
        let mut session = ControllerSession::new(sim.clone());
        session.open().unwrap();
        let mut ctl = ActuationController::new();

        let report = ctl.apply_preset(&mut session, FanMode::Manual, &[record(0, 6000)]);
        assert_eq!(report.failures().count(), 1);
        assert!(ctl.ledger().is_empty());
    }
}
