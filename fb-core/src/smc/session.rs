//! Controller session
//!
//! Owns the single link to the controller and is the only place connection
//! state changes. Everything above this layer reads state through
//! [`SessionStatus`], which is safe to share with consumers that must never
//! touch the hardware themselves.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectError, DecodeError, ReadError, WriteError};
use crate::smc::codec::{self, DataType};
use crate::smc::driver::{SmcDriver, SmcLink};
use crate::smc::key::{ControllerKey, KeyInfo};

/// Identifies one successful `open()`; a reconnect yields a new handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connected(SessionHandle),
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// One completed read: key, payload and the metadata the controller declared
#[derive(Clone, Debug, PartialEq)]
pub struct RawTransaction {
    pub key: ControllerKey,
    pub bytes: Vec<u8>,
    pub data_type: DataType,
    pub len: u8,
}

impl RawTransaction {
    /// Decode the payload according to its encoding tag
    pub fn decode(&self) -> Result<f64, DecodeError> {
        codec::decode_value(self.data_type, &self.bytes)
    }
}

/// Connection state and last error, readable without the session lock
#[derive(Debug, Default)]
pub struct SessionStatus {
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<String>>,
}

impl SessionStatus {
    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected()
    }

    fn set(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn record_error(&self, reason: String) {
        *self.last_error.write() = Some(reason);
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }
}

/// Session with one controller
pub struct ControllerSession {
    driver: Box<dyn SmcDriver>,
    link: Option<Box<dyn SmcLink>>,
    handle: Option<SessionHandle>,
    next_handle: u64,
    /// Key metadata for the current link; `None` marks a known-absent key
    key_cache: HashMap<ControllerKey, Option<KeyInfo>>,
    status: Arc<SessionStatus>,
}

impl ControllerSession {
    pub fn new(driver: impl SmcDriver + 'static) -> Self {
        Self::with_driver(Box::new(driver))
    }

    pub fn with_driver(driver: Box<dyn SmcDriver>) -> Self {
        Self {
            driver,
            link: None,
            handle: None,
            next_handle: 1,
            key_cache: HashMap::new(),
            status: Arc::new(SessionStatus::default()),
        }
    }

    /// Shared view of connection state for consumers
    pub fn status(&self) -> Arc<SessionStatus> {
        Arc::clone(&self.status)
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    /// Open the session. Returns the existing handle when already connected.
    pub fn open(&mut self) -> Result<SessionHandle, ConnectError> {
        if let (Some(_), Some(handle)) = (&self.link, self.handle) {
            return Ok(handle);
        }

        match self.driver.open() {
            Ok(link) => {
                let handle = SessionHandle(self.next_handle);
                self.next_handle += 1;
                self.link = Some(link);
                self.handle = Some(handle);
                self.key_cache.clear();
                self.status.set(ConnectionState::Connected(handle));
                self.status.clear_error();
                info!("Controller session opened via {} ({})", self.driver.name(), handle);
                Ok(handle)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Failed to open controller via {}: {}", self.driver.name(), reason);
                self.status.set(ConnectionState::Failed(reason.clone()));
                self.status.record_error(reason);
                Err(e)
            }
        }
    }

    /// Release the session. Safe to call when already closed.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!("Controller session closed ({})", handle);
        }
        self.link = None;
        self.key_cache.clear();
        self.status.set(ConnectionState::Disconnected);
    }

    /// Close then open. Never called implicitly.
    pub fn reconnect(&mut self) -> Result<SessionHandle, ConnectError> {
        self.close();
        self.open()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    /// Drop the link after a transport failure and record why
    fn fail(&mut self, reason: String) {
        error!("Controller transport failure: {}", reason);
        self.link = None;
        self.handle = None;
        self.key_cache.clear();
        self.status.set(ConnectionState::Failed(reason.clone()));
        self.status.record_error(reason);
    }

    /// Declared width and encoding of `key`
    pub fn key_info(&mut self, key: ControllerKey) -> Result<KeyInfo, ReadError> {
        if let Some(cached) = self.key_cache.get(&key).copied() {
            return cached.ok_or_else(|| ReadError::UnknownKey(key.to_string()));
        }

        let link = self.link.as_mut().ok_or(ReadError::NotConnected)?;
        match link.key_info(key) {
            Ok(info) => {
                self.key_cache.insert(key, info);
                info.ok_or_else(|| ReadError::UnknownKey(key.to_string()))
            }
            Err(e) => {
                let reason = format!("key info for '{}': {}", key, e);
                self.fail(reason.clone());
                Err(ReadError::Transport(reason))
            }
        }
    }

    /// Read the current value of `key`
    pub fn read_key(&mut self, key: ControllerKey) -> Result<RawTransaction, ReadError> {
        let info = self.key_info(key)?;
        let link = self.link.as_mut().ok_or(ReadError::NotConnected)?;

        let bytes = match link.read(key, info.len) {
            Ok(bytes) => bytes,
            Err(e) => {
                let reason = format!("read '{}': {}", key, e);
                self.fail(reason.clone());
                return Err(ReadError::Transport(reason));
            }
        };

        if bytes.len() != info.len as usize {
            let reason = format!(
                "read '{}': controller returned {} bytes, key declares {}",
                key,
                bytes.len(),
                info.len
            );
            self.fail(reason.clone());
            return Err(ReadError::Transport(reason));
        }

        debug!("read {} [{}] = {:02X?}", key, info.data_type, bytes);
        Ok(RawTransaction {
            key,
            bytes,
            data_type: info.data_type,
            len: info.len,
        })
    }

    /// Write `payload` to `key`. The payload width must equal the declared width.
    pub fn write_key(&mut self, key: ControllerKey, payload: &[u8]) -> Result<(), WriteError> {
        if self.link.is_none() {
            return Err(WriteError::NotConnected);
        }

        let info = self.key_info(key).map_err(WriteError::from)?;

        if payload.len() != info.len as usize {
            return Err(WriteError::LengthMismatch {
                key: key.to_string(),
                expected: info.len as usize,
                actual: payload.len(),
            });
        }

        let link = self.link.as_mut().ok_or(WriteError::NotConnected)?;
        if let Err(e) = link.write(key, payload) {
            let reason = format!("write '{}': {}", key, e);
            self.fail(reason.clone());
            return Err(WriteError::Transport(reason));
        }

        debug!("wrote {} [{}] = {:02X?}", key, info.data_type, payload);
        Ok(())
    }
}
