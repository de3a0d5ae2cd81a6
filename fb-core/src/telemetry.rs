//! Telemetry enumeration
//!
//! Turns raw key reads into [`FanRecord`]s and [`SensorRecord`]s. Keys the
//! controller does not have are skipped quietly; only transport level failures
//! (`NotConnected`, `Transport`) abort enumeration and reach the caller.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::actuation::ActuationLedger;
use crate::constants::{fan, keys, temperature};
use crate::data::{FanRecord, SensorRecord};
use crate::error::ReadError;
use crate::smc::{ControllerKey, ControllerSession};

/// One named sensor key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub key: ControllerKey,
    pub label: String,
}

/// A platform's list of temperature sensors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorRoster {
    pub name: String,
    pub entries: Vec<RosterEntry>,
}

impl SensorRoster {
    /// Build a roster from `(label, key)` pairs. Malformed keys are dropped.
    pub fn new(name: impl Into<String>, pairs: &[(&str, &str)]) -> Self {
        let entries = pairs
            .iter()
            .filter_map(|(label, key)| {
                key.parse().ok().map(|key| RosterEntry {
                    key,
                    label: label.to_string(),
                })
            })
            .collect();
        Self {
            name: name.into(),
            entries,
        }
    }

    /// Apple silicon die sensors
    pub fn apple_silicon() -> Self {
        Self::new(
            "apple-silicon",
            &[
                ("CPU Performance 1", "Tp09"),
                ("CPU Performance 2", "Tp0b"),
                ("CPU Performance 3", "Tp0d"),
                ("CPU Performance 4", "Tp0f"),
                ("CPU Efficiency 1", "Tp01"),
                ("CPU Efficiency 2", "Tp05"),
                ("GPU Cluster 1", "Tg05"),
                ("GPU Cluster 2", "Tg0b"),
                ("Battery Die", "Tb0R"),
                ("Ambient", "TA0p"),
                ("Power Manager Die", "Tp0C"),
                ("Airport Proximity", "TW0P"),
            ],
        )
    }

    /// Intel-era sensors
    pub fn legacy_intel() -> Self {
        Self::new(
            "legacy-intel",
            &[
                ("CPU Core 1", "TC0P"),
                ("CPU Core 2", "TC0H"),
                ("GPU PECI", "TG0E"),
            ],
        )
    }
}

/// Reads fans and sensors through a session
#[derive(Debug, Clone)]
pub struct TelemetryReader {
    rosters: Vec<SensorRoster>,
}

impl Default for TelemetryReader {
    fn default() -> Self {
        Self::with_rosters(vec![SensorRoster::apple_silicon(), SensorRoster::legacy_intel()])
    }
}

impl TelemetryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rosters are tried in order; the first that yields a sensor wins
    pub fn with_rosters(rosters: Vec<SensorRoster>) -> Self {
        Self { rosters }
    }

    pub fn rosters(&self) -> &[SensorRoster] {
        &self.rosters
    }

    /// Number of fans the controller reports
    pub fn fan_count(&self, session: &mut ControllerSession) -> Result<u8, ReadError> {
        for name in keys::FAN_COUNT {
            let Ok(key) = name.parse::<ControllerKey>() else {
                continue;
            };
            if let Some(value) = read_number(session, key)? {
                let count = value.max(0.0).round() as u32;
                let count = count.min(fan::MAX_COUNT as u32) as u8;
                debug!("{} reports {} fan(s)", key, count);
                return Ok(count);
            }
        }
        debug!("No fan count key, assuming {}", fan::DEFAULT_COUNT);
        Ok(fan::DEFAULT_COUNT)
    }

    /// Enumerate fans. A fan whose tachometer cannot be read is left out.
    pub fn list_fans(
        &self,
        session: &mut ControllerSession,
        ledger: &ActuationLedger,
    ) -> Result<Vec<FanRecord>, ReadError> {
        let count = self.fan_count(session)?;
        let mut fans = Vec::with_capacity(count as usize);

        for id in 0..count {
            let Some(current) = read_fan_key(session, id, keys::fan::ACTUAL)? else {
                debug!("Fan {} has no readable tachometer, skipping", id);
                continue;
            };
            let min_rpm = read_fan_key(session, id, keys::fan::MINIMUM)?
                .map(to_rpm)
                .unwrap_or(fan::DEFAULT_MIN_RPM);
            let max_rpm = read_fan_key(session, id, keys::fan::MAXIMUM)?
                .map(to_rpm)
                .unwrap_or(fan::DEFAULT_MAX_RPM)
                .max(min_rpm);
            let mode = ledger.mode(id);
            // Only a forced fan has a commanded target
            let target_rpm = if mode.is_forced() {
                match ledger.target(id) {
                    Some(rpm) => Some(rpm),
                    None => read_fan_key(session, id, keys::fan::TARGET)?.map(to_rpm),
                }
            } else {
                None
            };

            fans.push(FanRecord {
                id,
                label: fan_label(id),
                current_rpm: to_rpm(current),
                min_rpm,
                max_rpm,
                target_rpm,
                mode,
            });
        }

        Ok(fans)
    }

    /// Enumerate temperature sensors from the first roster that yields any
    pub fn list_sensors(&self, session: &mut ControllerSession) -> Result<Vec<SensorRecord>, ReadError> {
        for roster in &self.rosters {
            let mut sensors = self.read_roster(session, roster)?;
            if sensors.is_empty() {
                debug!("Roster '{}' yielded no sensors", roster.name);
                continue;
            }

            let mut seen = HashSet::new();
            sensors.retain(|s| seen.insert(s.key.clone()));
            sensors.sort_by(|a, b| a.label.cmp(&b.label));
            debug!("Roster '{}' yielded {} sensor(s)", roster.name, sensors.len());
            return Ok(sensors);
        }
        Ok(Vec::new())
    }

    fn read_roster(
        &self,
        session: &mut ControllerSession,
        roster: &SensorRoster,
    ) -> Result<Vec<SensorRecord>, ReadError> {
        let mut sensors = Vec::new();
        for entry in &roster.entries {
            let Some(celsius) = read_number(session, entry.key)? else {
                continue;
            };
            if !temperature::is_plausible(celsius) {
                debug!("Sensor filtered (out of range): {} ({}) = {}°C", entry.label, entry.key, celsius);
                continue;
            }
            sensors.push(SensorRecord {
                key: entry.key.to_string(),
                label: entry.label.clone(),
                temperature_c: celsius,
                enabled: true,
            });
        }
        Ok(sensors)
    }
}

/// Label shown for a fan index
pub fn fan_label(id: u8) -> String {
    if id == 0 {
        fan::PRIMARY_LABEL.to_string()
    } else {
        format!("Fan {}", id)
    }
}

fn to_rpm(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.round().min(u32::MAX as f64) as u32
    } else {
        0
    }
}

fn read_fan_key(session: &mut ControllerSession, id: u8, suffix: &str) -> Result<Option<f64>, ReadError> {
    match ControllerKey::fan(id, suffix) {
        Ok(key) => read_number(session, key),
        Err(_) => Ok(None),
    }
}

/// Read and decode a key. `None` for absent keys and undecodable payloads.
fn read_number(session: &mut ControllerSession, key: ControllerKey) -> Result<Option<f64>, ReadError> {
    match session.read_key(key) {
        Ok(tx) => match tx.decode() {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Discarding {}: {}", key, e);
                Ok(None)
            }
        },
        Err(ReadError::UnknownKey(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FanMode;
    use crate::smc::codec::DataType;
    use crate::smc::SimulatedDriver;

    fn open(sim: &SimulatedDriver) -> ControllerSession {
        let mut session = ControllerSession::new(sim.clone());
        session.open().unwrap();
        session
    }

    #[test]
    fn test_fan_count_primary_key() {
        let sim = SimulatedDriver::empty().with_fan(1000.0, 0.0, 5000.0);
        let mut session = open(&sim);
        assert_eq!(TelemetryReader::new().fan_count(&mut session).unwrap(), 1);
    }

    #[test]
    fn test_fan_count_falls_back_to_secondary_key() {
        let sim = SimulatedDriver::empty()
            .with_fan(1000.0, 0.0, 5000.0)
            .with_fan(1000.0, 0.0, 5000.0)
            .with_fan(1000.0, 0.0, 5000.0)
            .without_key("FNum")
            .with_register("Num ", DataType::Ui8, 3.0);
        let mut session = open(&sim);
        assert_eq!(TelemetryReader::new().fan_count(&mut session).unwrap(), 3);

        let sim = SimulatedDriver::empty()
            .with_fan(1000.0, 0.0, 5000.0)
            .without_key("FNum")
            .with_register("#pn ", DataType::Ui8, 1.0);
        let mut session = open(&sim);
        assert_eq!(TelemetryReader::new().fan_count(&mut session).unwrap(), 1);
    }

    #[test]
    fn test_fan_count_defaults_to_two() {
        let sim = SimulatedDriver::empty();
        let mut session = open(&sim);
        assert_eq!(TelemetryReader::new().fan_count(&mut session).unwrap(), 2);
    }

    #[test]
    fn test_list_fans_labels_and_limits() {
        let sim = SimulatedDriver::new();
        let mut session = open(&sim);
        let fans = TelemetryReader::new()
            .list_fans(&mut session, &ActuationLedger::default())
            .unwrap();
        assert_eq!(fans.len(), 1);
        assert_eq!(fans[0].label, "Exhaust");
        assert_eq!(fans[0].current_rpm, 1250);
        assert_eq!(fans[0].min_rpm, 1200);
        assert_eq!(fans[0].max_rpm, 6000);
        assert_eq!(fans[0].mode, FanMode::Automatic);
    }

    #[test]
    fn test_missing_limits_use_defaults() {
        let sim = SimulatedDriver::empty()
            .with_fan(900.0, 1.0, 1.0)
            .without_key("F0Mn")
            .without_key("F0Mx");
        let mut session = open(&sim);
        let fans = TelemetryReader::new()
            .list_fans(&mut session, &ActuationLedger::default())
            .unwrap();
        assert_eq!((fans[0].min_rpm, fans[0].max_rpm), (0, 6000));
    }

    #[test]
    fn test_failed_tachometer_omits_fan() {
        let sim = SimulatedDriver::empty()
            .with_fan(1000.0, 0.0, 6000.0)
            .with_fan(1100.0, 0.0, 6000.0)
            .without_key("F0Ac");
        let mut session = open(&sim);
        let fans = TelemetryReader::new()
            .list_fans(&mut session, &ActuationLedger::default())
            .unwrap();
        assert_eq!(fans.len(), 1);
        assert_eq!(fans[0].id, 1);
        assert_eq!(fans[0].label, "Fan 1");
    }

    #[test]
    fn test_primary_roster_wins_and_sorts_by_label() {
        let sim = SimulatedDriver::new();
        let mut session = open(&sim);
        let sensors = TelemetryReader::new().list_sensors(&mut session).unwrap();
        let labels: Vec<&str> = sensors.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["Airport Proximity", "CPU Performance 1"]);
        assert!(sensors.iter().all(|s| s.enabled));
    }

    #[test]
    fn test_legacy_roster_when_primary_empty() {
        let sim = SimulatedDriver::empty()
            .with_register("TC0P", DataType::Sp78, 45.5)
            .with_register("TG0E", DataType::Sp78, 50.25);
        let mut session = open(&sim);
        let sensors = TelemetryReader::new().list_sensors(&mut session).unwrap();
        let keys: Vec<&str> = sensors.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["TC0P", "TG0E"]);
        assert_eq!(sensors[0].temperature_c, 45.5);
    }

    #[test]
    fn test_implausible_temperatures_discarded() {
        let sim = SimulatedDriver::empty()
            .with_sensor("Tp09", 151.0)
            .with_sensor("Tp0b", 150.0)
            .with_sensor("Tp0d", 0.0)
            .with_sensor("Tp0f", -4.0)
            .with_sensor("Tp01", 149.5);
        let mut session = open(&sim);
        let sensors = TelemetryReader::new().list_sensors(&mut session).unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].key, "Tp01");
    }

    #[test]
    fn test_duplicate_keys_first_wins() {
        let sim = SimulatedDriver::empty().with_sensor("Tp09", 50.0);
        let roster = SensorRoster::new("dup", &[("Zeta", "Tp09"), ("Alpha", "Tp09")]);
        let reader = TelemetryReader::with_rosters(vec![roster]);
        let mut session = open(&sim);
        let sensors = reader.list_sensors(&mut session).unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].label, "Zeta");
    }

    #[test]
    fn test_label_sort_is_case_sensitive() {
        let sim = SimulatedDriver::empty()
            .with_sensor("Tp09", 50.0)
            .with_sensor("Tp0b", 51.0);
        let roster = SensorRoster::new("case", &[("ambient", "Tp09"), ("Zone", "Tp0b")]);
        let reader = TelemetryReader::with_rosters(vec![roster]);
        let mut session = open(&sim);
        let labels: Vec<String> = reader
            .list_sensors(&mut session)
            .unwrap()
            .into_iter()
            .map(|s| s.label)
            .collect();
        assert_eq!(labels, vec!["Zone", "ambient"]);
    }

    #[test]
    fn test_transport_failure_aborts() {
        let sim = SimulatedDriver::new();
        let mut session = open(&sim);
        sim.set_transport_fault(true);
        let err = TelemetryReader::new().list_sensors(&mut session).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fan_mode_seeded_from_ledger() {
        use crate::actuation::ActuationController;

        let sim = SimulatedDriver::new();
        let mut session = open(&sim);
        let reader = TelemetryReader::new();
        let mut ctl = ActuationController::new();
        let fans = reader.list_fans(&mut session, ctl.ledger()).unwrap();
        ctl.apply_preset(&mut session, FanMode::FullBlast, &fans);

        let fans = reader.list_fans(&mut session, ctl.ledger()).unwrap();
        assert_eq!(fans[0].mode, FanMode::FullBlast);
        assert_eq!(fans[0].target_rpm, Some(6000));
    }

    #[test]
    fn test_uncommanded_fan_has_no_target() {
        let sim = SimulatedDriver::new().with_register("F0Tg", DataType::Flt, 2400.0);
        let mut session = open(&sim);
        let fans = TelemetryReader::new()
            .list_fans(&mut session, &ActuationLedger::default())
            .unwrap();
        assert_eq!(fans[0].mode, FanMode::Automatic);
        assert_eq!(fans[0].target_rpm, None);
    }

    #[test]
    fn test_forced_fan_without_ledger_target_reads_register() {
        use crate::actuation::ActuationController;

        let sim = SimulatedDriver::new().with_register("F0Tg", DataType::Flt, 2400.0);
        let mut session = open(&sim);
        let reader = TelemetryReader::new();
        let mut ctl = ActuationController::new();
        let fans = reader.list_fans(&mut session, ctl.ledger()).unwrap();
        ctl.apply_preset(&mut session, FanMode::Manual, &fans);

        let fans = reader.list_fans(&mut session, ctl.ledger()).unwrap();
        assert_eq!(fans[0].mode, FanMode::Manual);
        assert_eq!(fans[0].target_rpm, Some(2400));
    }
}
