//! In-memory controller for development and tests
//!
//! Holds a register file behind a shared lock. Clones of a [`SimulatedDriver`]
//! see the same machine, so a test can keep one clone for inspection while the
//! session owns another.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::constants::keys;
use crate::error::{ConnectError, Result};
use crate::smc::codec::{self, DataType};
use crate::smc::driver::{LinkError, SmcDriver, SmcLink};
use crate::smc::key::{ControllerKey, KeyInfo};

/// How `open()` should fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectFault {
    Absent,
    Denied,
}

#[derive(Clone, Debug)]
struct Register {
    info: KeyInfo,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct Machine {
    registers: BTreeMap<ControllerKey, Register>,
    connect_fault: Option<ConnectFault>,
    transport_fault: bool,
    latency: Duration,
    writes: Vec<(ControllerKey, Vec<u8>)>,
    opens: u32,
    in_flight: usize,
    max_in_flight: usize,
    calls: u64,
}

/// Driver backed by a simulated register file
#[derive(Clone, Default)]
pub struct SimulatedDriver {
    machine: Arc<Mutex<Machine>>,
}

impl SimulatedDriver {
    /// Development machine: one exhaust fan and a handful of sensors
    pub fn new() -> Self {
        Self::empty()
            .with_fan(1250.0, 1200.0, 6000.0)
            .with_sensor("TW0P", 39.7)
            .with_sensor("TC0P", 45.6)
            .with_sensor("Tp09", 47.4)
            .with_sensor("TG0P", 43.9)
            .with_sensor("Ts0P", 37.0)
    }

    /// A controller with no keys at all
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a fan at the next free index and bump the fan count key
    pub fn with_fan(self, rpm: f64, min_rpm: f64, max_rpm: f64) -> Self {
        let index = self.fan_count();
        let fan = |suffix| ControllerKey::fan(index, suffix);
        {
            let mut m = self.machine.lock();
            for (key, dt, value) in [
                (fan("Ac"), DataType::Flt, rpm),
                (fan("Mn"), DataType::Flt, min_rpm),
                (fan("Mx"), DataType::Flt, max_rpm),
                (fan("Md"), DataType::Ui8, 0.0),
                (fan("Tg"), DataType::Flt, 0.0),
            ] {
                if let Ok(key) = key {
                    insert(&mut m, key, dt, value);
                }
            }
            if let Ok(count_key) = keys::FAN_COUNT[0].parse() {
                insert(&mut m, count_key, DataType::Ui8, (index + 1) as f64);
            }
        }
        self
    }

    /// Add a temperature sensor stored as a little-endian float
    pub fn with_sensor(self, key: &str, celsius: f64) -> Self {
        self.with_register(key, DataType::Flt, celsius)
    }

    /// Add or replace an arbitrary register. Keys that do not parse or values
    /// that do not fit the encoding are ignored.
    pub fn with_register(self, key: &str, data_type: DataType, value: f64) -> Self {
        if let Ok(key) = key.parse() {
            insert(&mut self.machine.lock(), key, data_type, value);
        }
        self
    }

    /// Remove a register so the controller reports it unknown
    pub fn without_key(self, key: &str) -> Self {
        if let Ok(key) = key.parse::<ControllerKey>() {
            self.machine.lock().registers.remove(&key);
        }
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.machine.lock().latency = latency;
        self
    }

    pub fn with_connect_fault(self, fault: ConnectFault) -> Self {
        self.set_connect_fault(Some(fault));
        self
    }

    pub fn set_connect_fault(&self, fault: Option<ConnectFault>) {
        self.machine.lock().connect_fault = fault;
    }

    /// Make every subsequent link call fail as a transport error
    pub fn set_transport_fault(&self, failing: bool) {
        self.machine.lock().transport_fault = failing;
    }

    /// Overwrite a register value in place
    pub fn set_value(&self, key: &str, value: f64) -> Result<()> {
        let key: ControllerKey = key.parse()?;
        let mut m = self.machine.lock();
        let data_type = m
            .registers
            .get(&key)
            .map(|r| r.info.data_type)
            .ok_or_else(|| crate::error::ReadError::UnknownKey(key.to_string()))?;
        let bytes = codec::encode_value(data_type, value)?;
        if let Some(reg) = m.registers.get_mut(&key) {
            reg.bytes = bytes;
        }
        Ok(())
    }

    /// Decoded current value of a register
    pub fn value(&self, key: &str) -> Option<f64> {
        let key: ControllerKey = key.parse().ok()?;
        let m = self.machine.lock();
        let reg = m.registers.get(&key)?;
        codec::decode_value(reg.info.data_type, &reg.bytes).ok()
    }

    /// Every accepted write, in order
    pub fn writes(&self) -> Vec<(ControllerKey, Vec<u8>)> {
        self.machine.lock().writes.clone()
    }

    pub fn open_count(&self) -> u32 {
        self.machine.lock().opens
    }

    /// Highest number of link calls observed executing at once
    pub fn max_in_flight(&self) -> usize {
        self.machine.lock().max_in_flight
    }

    /// Total link calls made
    pub fn call_count(&self) -> u64 {
        self.machine.lock().calls
    }

    fn fan_count(&self) -> u8 {
        let m = self.machine.lock();
        (0..10u8)
            .take_while(|i| {
                ControllerKey::fan(*i, "Ac")
                    .map(|k| m.registers.contains_key(&k))
                    .unwrap_or(false)
            })
            .count() as u8
    }
}

fn insert(m: &mut Machine, key: ControllerKey, data_type: DataType, value: f64) {
    match codec::encode_value(data_type, value) {
        Ok(bytes) => {
            let info = KeyInfo::new(bytes.len() as u8, data_type);
            m.registers.insert(key, Register { info, bytes });
        }
        Err(e) => debug!("simulated register {} not set: {}", key, e),
    }
}

impl SmcDriver for SimulatedDriver {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open(&self) -> std::result::Result<Box<dyn SmcLink>, ConnectError> {
        let mut m = self.machine.lock();
        match m.connect_fault {
            Some(ConnectFault::Absent) => {
                Err(ConnectError::Unavailable("simulated controller absent".into()))
            }
            Some(ConnectFault::Denied) => {
                Err(ConnectError::PermissionDenied("simulated access denied".into()))
            }
            None => {
                m.opens += 1;
                Ok(Box::new(SimulatedLink {
                    machine: Arc::clone(&self.machine),
                }))
            }
        }
    }
}

struct SimulatedLink {
    machine: Arc<Mutex<Machine>>,
}

/// Marks one link call as executing until dropped
struct InFlight<'a>(&'a Mutex<Machine>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().in_flight -= 1;
    }
}

impl SimulatedLink {
    fn enter(&self) -> std::result::Result<InFlight<'_>, LinkError> {
        let latency = {
            let mut m = self.machine.lock();
            m.calls += 1;
            m.in_flight += 1;
            m.max_in_flight = m.max_in_flight.max(m.in_flight);
            m.latency
        };
        let guard = InFlight(&self.machine);
        // Sleep unlocked so overlapping callers would be visible
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        if self.machine.lock().transport_fault {
            return Err(LinkError::Timeout("simulated transport fault".into()));
        }
        Ok(guard)
    }
}

impl SmcLink for SimulatedLink {
    fn key_info(&mut self, key: ControllerKey) -> std::result::Result<Option<KeyInfo>, LinkError> {
        let _call = self.enter()?;
        let info = self.machine.lock().registers.get(&key).map(|r| r.info);
        Ok(info)
    }

    fn read(&mut self, key: ControllerKey, len: u8) -> std::result::Result<Vec<u8>, LinkError> {
        let _call = self.enter()?;
        let m = self.machine.lock();
        let reg = m
            .registers
            .get(&key)
            .ok_or_else(|| LinkError::Protocol(format!("read of absent key {}", key)))?;
        Ok(reg.bytes.iter().copied().take(len as usize).collect())
    }

    fn write(&mut self, key: ControllerKey, payload: &[u8]) -> std::result::Result<(), LinkError> {
        let _call = self.enter()?;
        let mut m = self.machine.lock();
        let reg = m
            .registers
            .get_mut(&key)
            .ok_or_else(|| LinkError::Protocol(format!("write to absent key {}", key)))?;
        reg.bytes = payload.to_vec();
        m.writes.push((key, payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smc::session::ControllerSession;

    fn key(s: &str) -> ControllerKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_development_machine() {
        let sim = SimulatedDriver::new();
        assert_eq!(sim.value("FNum"), Some(1.0));
        assert_eq!(sim.value("F0Ac"), Some(1250.0));
        assert_eq!(sim.value("F0Mn"), Some(1200.0));
        assert_eq!(sim.value("F0Mx"), Some(6000.0));
        let t = sim.value("Tp09").unwrap();
        assert!((t - 47.4).abs() < 1e-4);
    }

    #[test]
    fn test_fans_are_indexed_in_order() {
        let sim = SimulatedDriver::empty()
            .with_fan(1000.0, 0.0, 6000.0)
            .with_fan(900.0, 0.0, 4800.0);
        assert_eq!(sim.value("FNum"), Some(2.0));
        assert_eq!(sim.value("F1Mx"), Some(4800.0));
    }

    #[test]
    fn test_connect_faults() {
        let sim = SimulatedDriver::new().with_connect_fault(ConnectFault::Denied);
        assert!(matches!(sim.open(), Err(ConnectError::PermissionDenied(_))));
        sim.set_connect_fault(Some(ConnectFault::Absent));
        assert!(matches!(sim.open(), Err(ConnectError::Unavailable(_))));
        sim.set_connect_fault(None);
        assert!(sim.open().is_ok());
        assert_eq!(sim.open_count(), 1);
    }

    #[test]
    fn test_session_roundtrip_through_simulator() {
        let sim = SimulatedDriver::new();
        let mut session = ControllerSession::new(sim.clone());
        session.open().unwrap();

        let tx = session.read_key(key("F0Ac")).unwrap();
        assert_eq!(tx.data_type, DataType::Flt);
        assert_eq!(tx.decode().unwrap(), 1250.0);

        session.write_key(key("F0Md"), &[1]).unwrap();
        assert_eq!(sim.value("F0Md"), Some(1.0));
        assert_eq!(sim.writes(), vec![(key("F0Md"), vec![1])]);
    }

    #[test]
    fn test_transport_fault_fails_session() {
        let sim = SimulatedDriver::new();
        let mut session = ControllerSession::new(sim.clone());
        session.open().unwrap();
        sim.set_transport_fault(true);
        assert!(session.read_key(key("TC0P")).is_err());
        assert!(!session.is_connected());
    }

    #[test]
    fn test_set_value_requires_existing_key() {
        let sim = SimulatedDriver::new();
        sim.set_value("F0Ac", 2000.0).unwrap();
        assert_eq!(sim.value("F0Ac"), Some(2000.0));
        assert!(sim.set_value("F9Ac", 1.0).is_err());
    }
}
