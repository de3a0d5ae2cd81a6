//! Display Formatting Helpers
//!
//! Frontend-agnostic strings for menu bars, dashboards and the CLI. Everything
//! here works on a published snapshot and never touches the controller.

use crate::data::{SensorRecord, TelemetrySnapshot};
use crate::smc::ConnectionState;

/// Sensor grouping used by detail views
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorGroup {
    PerformanceCores,
    EfficiencyCores,
    System,
}

impl SensorGroup {
    pub const ALL: [SensorGroup; 3] = [
        SensorGroup::PerformanceCores,
        SensorGroup::EfficiencyCores,
        SensorGroup::System,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            Self::PerformanceCores => "P-Cores",
            Self::EfficiencyCores => "E-Cores",
            Self::System => "System",
        }
    }

    /// Group a sensor falls into, judged by its label
    pub fn of(sensor: &SensorRecord) -> Self {
        let label = sensor.label.as_str();
        if label.contains("P-Core") || label.contains("Performance") {
            Self::PerformanceCores
        } else if label.contains("E-Core") || label.contains("Efficiency") {
            Self::EfficiencyCores
        } else {
            Self::System
        }
    }
}

/// Sensors of one group, in snapshot order
pub fn sensors_in_group(snapshot: &TelemetrySnapshot, group: SensorGroup) -> Vec<&SensorRecord> {
    snapshot
        .sensors
        .iter()
        .filter(|s| SensorGroup::of(s) == group)
        .collect()
}

/// Format like "1250 rpm"
pub fn format_rpm(rpm: u32) -> String {
    format!("{} rpm", rpm)
}

/// Temperature with one decimal place, e.g. "47.4°C"
pub fn format_temperature(celsius: f64) -> String {
    format!("{:.1}°C", celsius)
}

/// Whole-degree temperature, e.g. "47°C"
pub fn format_temperature_short(celsius: f64) -> String {
    format!("{:.0}°C", celsius)
}

/// Speed of the first fan, "0 rpm" when there is none
pub fn primary_fan_rpm(snapshot: &TelemetrySnapshot) -> String {
    format_rpm(snapshot.fans.first().map(|f| f.current_rpm).unwrap_or(0))
}

/// Headline temperature: a performance core if present, then any core, then
/// the first sensor. "0°C" when there are no sensors.
pub fn primary_temperature(snapshot: &TelemetrySnapshot) -> String {
    let sensors = &snapshot.sensors;
    let pick = sensors
        .iter()
        .find(|s| s.label.contains("Performance"))
        .or_else(|| sensors.iter().find(|s| s.label.contains("Core")))
        .or_else(|| sensors.first());
    format_temperature_short(pick.map(|s| s.temperature_c).unwrap_or(0.0))
}

pub fn connection_label(state: &ConnectionState) -> &'static str {
    if state.is_connected() {
        "Hardware Connected"
    } else {
        "Hardware Disconnected"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FanMode, FanRecord};

    fn sensor(key: &str, label: &str, t: f64) -> SensorRecord {
        SensorRecord {
            key: key.into(),
            label: label.into(),
            temperature_c: t,
            enabled: true,
        }
    }

    fn snapshot(sensors: Vec<SensorRecord>) -> TelemetrySnapshot {
        let fan = FanRecord {
            id: 0,
            label: "Exhaust".into(),
            current_rpm: 1250,
            min_rpm: 1200,
            max_rpm: 6000,
            target_rpm: None,
            mode: FanMode::Automatic,
        };
        TelemetrySnapshot::new(vec![fan], sensors, 1)
    }

    #[test]
    fn test_primary_fan_rpm() {
        assert_eq!(primary_fan_rpm(&snapshot(vec![])), "1250 rpm");
        assert_eq!(primary_fan_rpm(&TelemetrySnapshot::empty(1)), "0 rpm");
    }

    #[test]
    fn test_primary_temperature_preference() {
        let snap = snapshot(vec![
            sensor("TW0P", "Airport Proximity", 39.7),
            sensor("TC0P", "CPU Core 1", 45.6),
            sensor("Tp09", "CPU Performance 1", 47.4),
        ]);
        assert_eq!(primary_temperature(&snap), "47°C");

        let snap = snapshot(vec![
            sensor("TW0P", "Airport Proximity", 39.7),
            sensor("TC0P", "CPU Core 1", 45.6),
        ]);
        assert_eq!(primary_temperature(&snap), "46°C");

        let snap = snapshot(vec![sensor("TW0P", "Airport Proximity", 39.7)]);
        assert_eq!(primary_temperature(&snap), "40°C");

        assert_eq!(primary_temperature(&TelemetrySnapshot::empty(1)), "0°C");
    }

    #[test]
    fn test_format_temperature() {
        assert_eq!(format_temperature(47.44), "47.4°C");
    }

    #[test]
    fn test_connection_label() {
        assert_eq!(connection_label(&ConnectionState::Disconnected), "Hardware Disconnected");
        assert_eq!(
            connection_label(&ConnectionState::Failed("timeout".into())),
            "Hardware Disconnected"
        );
    }

    #[test]
    fn test_sensor_groups() {
        let snap = snapshot(vec![
            sensor("Tp09", "CPU Performance 1", 47.0),
            sensor("Tp01", "CPU Efficiency 1", 40.0),
            sensor("Tb0R", "Battery Die", 30.0),
        ]);
        let titles: Vec<Vec<&str>> = SensorGroup::ALL
            .iter()
            .map(|g| sensors_in_group(&snap, *g).iter().map(|s| s.key.as_str()).collect())
            .collect();
        assert_eq!(titles, vec![vec!["Tp09"], vec!["Tp01"], vec!["Tb0R"]]);
    }
}
