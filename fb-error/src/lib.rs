//! Unified error handling for FluxBar
//!
//! Every failure the controller client can produce is named here. The per-layer
//! enums (`ConnectError`, `ReadError`, `WriteError`, `DecodeError`) are what the
//! session, codec and reader return; `FluxbarError` wraps all of them for the
//! engine, settings store and binaries.

use std::io;
use std::path::PathBuf;

/// Result type alias using FluxbarError
pub type Result<T> = std::result::Result<T, FluxbarError>;

// ============================================================================
// Controller Errors
// ============================================================================

/// Failure to establish a session with the controller
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("No compatible controller present: {0}")]
    Unavailable(String),

    #[error("Permission denied opening controller: {0}")]
    PermissionDenied(String),
}

/// Failure of a single key read
///
/// `UnknownKey` is the normal answer for a sensor or fan that the machine does not
/// have. Callers treat it as "not present", never as a connectivity problem.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("Controller does not recognize key '{0}'")]
    UnknownKey(String),

    #[error("No open controller session")]
    NotConnected,

    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Failure of a single key write
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("Payload for '{key}' is {actual} bytes, key declares {expected}")]
    LengthMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("Controller does not recognize key '{0}'")]
    UnknownKey(String),

    #[error("No open controller session")]
    NotConnected,

    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Failure to interpret a payload
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Payload width mismatch: expected {expected} bytes, got {actual}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("Unsupported encoding '{0}'")]
    UnsupportedType(String),

    #[error("Value {value} does not fit encoding '{encoding}'")]
    OutOfRange { value: f64, encoding: String },
}

impl ReadError {
    /// True for failures that mean the link itself is unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Transport(_))
    }
}

impl From<ReadError> for WriteError {
    /// A write first resolves the key's metadata; failures there carry over
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::UnknownKey(k) => Self::UnknownKey(k),
            ReadError::NotConnected => Self::NotConnected,
            ReadError::Transport(r) => Self::Transport(r),
        }
    }
}

impl WriteError {
    /// True for failures that mean the link itself is unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Transport(_))
    }
}

// ============================================================================
// Unified Error
// ============================================================================

/// Unified error type for all FluxBar operations
#[derive(thiserror::Error, Debug)]
pub enum FluxbarError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead { path: PathBuf, source: io::Error },

    #[error("Failed to write file {path}: {source}")]
    FileWrite { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Invalid controller key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Polling engine is not running")]
    EngineStopped,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("{0}")]
    Generic(String),
}

impl FluxbarError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config error for a named field
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<String> for FluxbarError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

impl From<&str> for FluxbarError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
