//! Telemetry records and snapshots
//!
//! Everything the engine publishes to consumers.

mod types;

pub use types::{FanMode, FanRecord, Preset, SensorRecord, TelemetrySnapshot};
