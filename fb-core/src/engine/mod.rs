//! Polling engine
//!
//! Runs every controller transaction on one background worker.

mod polling;
mod worker;

pub use polling::{validate_refresh, EngineConfig, EngineDiagnostics, PollingEngine};
pub use worker::{EngineEvent, EventReceiver};
