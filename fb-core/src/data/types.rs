//! Core data types for FluxBar
//!
//! Records are built fresh on every poll and never mutated after publication.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::FluxbarError;

/// Fan control mode, also the set of presets a user can pick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FanMode {
    #[default]
    Automatic,
    Manual,
    #[serde(rename = "Full Blast")]
    FullBlast,
}

/// Presets are the fan modes applied to every fan at once
pub type Preset = FanMode;

impl FanMode {
    pub const ALL: [FanMode; 3] = [FanMode::Automatic, FanMode::Manual, FanMode::FullBlast];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "Automatic",
            Self::Manual => "Manual",
            Self::FullBlast => "Full Blast",
        }
    }

    /// True when the controller's own fan logic is bypassed
    pub fn is_forced(&self) -> bool {
        !matches!(self, Self::Automatic)
    }
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FanMode {
    type Err = FluxbarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "automatic" | "auto" => Ok(Self::Automatic),
            "manual" => Ok(Self::Manual),
            "fullblast" => Ok(Self::FullBlast),
            _ => Err(FluxbarError::invalid_config(
                "preset",
                format!("'{}' is not one of Automatic, Manual, Full Blast", s),
            )),
        }
    }
}

/// One fan as read during a poll pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanRecord {
    /// Controller fan index
    pub id: u8,
    pub label: String,
    pub current_rpm: u32,
    pub min_rpm: u32,
    /// Never below `min_rpm`
    pub max_rpm: u32,
    pub target_rpm: Option<u32>,
    pub mode: FanMode,
}

/// One temperature sensor as read during a poll pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    /// Controller key, unique within a snapshot
    pub key: String,
    pub label: String,
    pub temperature_c: f64,
    pub enabled: bool,
}

/// Everything one poll pass produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub fans: Vec<FanRecord>,
    pub sensors: Vec<SensorRecord>,
    pub captured_at: SystemTime,
    /// Strictly increasing across publications of one engine
    pub sequence: u64,
}

impl TelemetrySnapshot {
    pub fn new(fans: Vec<FanRecord>, sensors: Vec<SensorRecord>, sequence: u64) -> Self {
        Self {
            fans,
            sensors,
            captured_at: SystemTime::now(),
            sequence,
        }
    }

    /// Snapshot with no readings, published when telemetry is lost
    pub fn empty(sequence: u64) -> Self {
        Self::new(Vec::new(), Vec::new(), sequence)
    }

    pub fn is_empty(&self) -> bool {
        self.fans.is_empty() && self.sensors.is_empty()
    }

    /// Capture time in milliseconds since the Unix epoch
    pub fn timestamp_ms(&self) -> u64 {
        self.captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn fan(&self, id: u8) -> Option<&FanRecord> {
        self.fans.iter().find(|f| f.id == id)
    }

    pub fn sensor(&self, key: &str) -> Option<&SensorRecord> {
        self.sensors.iter().find(|s| s.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_names_roundtrip() {
        for mode in FanMode::ALL {
            assert_eq!(mode.to_string().parse::<FanMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_preset_parse_variants() {
        assert_eq!("full-blast".parse::<Preset>().unwrap(), FanMode::FullBlast);
        assert_eq!("FullBlast".parse::<Preset>().unwrap(), FanMode::FullBlast);
        assert_eq!("auto".parse::<Preset>().unwrap(), FanMode::Automatic);
        assert!("turbo".parse::<Preset>().is_err());
    }

    #[test]
    fn test_preset_serde_uses_display_name() {
        let json = serde_json::to_string(&FanMode::FullBlast).unwrap();
        assert_eq!(json, "\"Full Blast\"");
        let back: FanMode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FanMode::FullBlast);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = TelemetrySnapshot::empty(7);
        assert!(snap.is_empty());
        assert_eq!(snap.sequence, 7);
        assert!(snap.timestamp_ms() > 0);
    }
}
