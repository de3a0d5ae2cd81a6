//! FluxBar Core Library
//!
//! Client for a platform's system management controller: reads fan and
//! temperature telemetry, forces fan modes, and publishes snapshots from a
//! background polling engine.
//!
//! # Module Structure
//!
//! - `smc/` - Controller keys, wire codec, drivers and the session
//! - `data/` - Telemetry records and snapshots
//! - `engine/` - Background polling and actuation serialization
//!
//! # Example
//!
//! ```no_run
//! use fb_core::{ControllerSession, EngineConfig, PollingEngine, SimulatedDriver};
//!
//! let session = ControllerSession::new(SimulatedDriver::new());
//! let mut engine = PollingEngine::new(session, EngineConfig::default()).unwrap();
//! engine.start();
//! if let Some(snapshot) = engine.latest_snapshot() {
//!     println!("{}", fb_core::display::primary_fan_rpm(&snapshot));
//! }
//! engine.shutdown();
//! ```

// Grouped modules
pub mod data;
pub mod engine;
pub mod smc;

// Standalone modules
pub mod actuation;
pub mod constants;
pub mod display;
pub mod error;
pub mod settings;
pub mod telemetry;

pub use data::{FanMode, FanRecord, Preset, SensorRecord, TelemetrySnapshot};

pub use error::{FluxbarError, Result};

pub use engine::{EngineConfig, EngineDiagnostics, EngineEvent, EventReceiver, PollingEngine};

pub use smc::{
    ConnectFault, ConnectionState, ControllerKey, ControllerSession, DataType, KeyInfo,
    RawTransaction, SessionHandle, SimulatedDriver, SmcDriver, SmcLink,
};
#[cfg(unix)]
pub use smc::PortIoDriver;

pub use actuation::{ActuationController, ActuationLedger, FanOutcome, PresetReport};
pub use telemetry::{SensorRoster, TelemetryReader};

pub use settings::{
    AppSettings, ViewMode, get_cached_settings, get_settings_path, invalidate_settings_cache,
    load_settings, save_settings, update_setting,
};
