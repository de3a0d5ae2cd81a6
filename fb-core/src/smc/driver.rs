//! Driver seam between the session and a physical (or simulated) controller

use crate::error::ConnectError;
use crate::smc::key::{ControllerKey, KeyInfo};

/// Failure inside a single exchange with the controller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Controller did not respond while {0}")]
    Timeout(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// One open channel to a controller
///
/// Implementations must bound every call; a dead controller has to surface as
/// an error, never as a hang.
#[cfg_attr(test, mockall::automock)]
pub trait SmcLink: Send {
    /// Declared width and encoding of `key`, `None` when the controller has no
    /// such key
    fn key_info(&mut self, key: ControllerKey) -> Result<Option<KeyInfo>, LinkError>;

    /// Read exactly `len` bytes from `key`
    fn read(&mut self, key: ControllerKey, len: u8) -> Result<Vec<u8>, LinkError>;

    /// Write `payload` to `key`
    fn write(&mut self, key: ControllerKey, payload: &[u8]) -> Result<(), LinkError>;
}

/// Opens links to a controller
pub trait SmcDriver: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    fn open(&self) -> Result<Box<dyn SmcLink>, ConnectError>;
}
