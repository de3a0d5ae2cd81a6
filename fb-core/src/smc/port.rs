//! Legacy SMC port driver
//!
//! Talks to the controller through the data/command I/O port pair exposed by
//! `/dev/port` (root only). The exchange is a strict handshake on the status
//! register:
//!
//! ```text
//! command ──> CMD port      wait: input buffer open
//! key[4]  ──> DATA port     wait: input open + busy, per byte
//! len     ──> DATA port
//! data    <── DATA port     wait: awaiting-data + busy, per byte   (read)
//! data    ──> DATA port     same as argument bytes                 (write)
//!                           wait: not busy
//! ```
//!
//! Every wait is a bounded poll, so an absent or wedged controller turns into
//! `LinkError::Timeout` instead of a hang.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::thread;

use tracing::{debug, info, warn};

use crate::constants::{keys, paths, port};
use crate::error::ConnectError;
use crate::smc::codec::DataType;
use crate::smc::driver::{LinkError, SmcDriver, SmcLink};
use crate::smc::key::{ControllerKey, KeyInfo};

/// Byte-wide access to an I/O port space
pub trait PortBus: Send {
    fn inb(&mut self, port: u64) -> io::Result<u8>;
    fn outb(&mut self, port: u64, value: u8) -> io::Result<()>;
}

/// `/dev/port`: file offset is the port number
struct DevPort {
    file: File,
}

impl PortBus for DevPort {
    fn inb(&mut self, port: u64) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.file.read_exact_at(&mut buf, port)?;
        Ok(buf[0])
    }

    fn outb(&mut self, port: u64, value: u8) -> io::Result<()> {
        self.file.write_all_at(&[value], port)
    }
}

/// Driver for controllers reachable through the legacy port pair
pub struct PortIoDriver {
    device: PathBuf,
}

impl PortIoDriver {
    pub fn new() -> Self {
        Self::with_device(paths::DEV_PORT)
    }

    pub fn with_device(device: impl Into<PathBuf>) -> Self {
        Self { device: device.into() }
    }
}

impl Default for PortIoDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_denied(device: &std::path::Path, e: &io::Error) -> String {
    // SAFETY: geteuid has no preconditions and only returns the effective uid.
    let euid = unsafe { libc::geteuid() };
    format!("{}: {} (euid={}, raw port access needs root)", device.display(), e, euid)
}

impl SmcDriver for PortIoDriver {
    fn name(&self) -> &str {
        "port-io"
    }

    fn open(&self) -> Result<Box<dyn SmcLink>, ConnectError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => {
                    ConnectError::PermissionDenied(describe_denied(&self.device, &e))
                }
                _ => ConnectError::Unavailable(format!("{}: {}", self.device.display(), e)),
            })?;

        let link = PortLink::probe(DevPort { file })
            .map_err(|e| ConnectError::Unavailable(format!("controller not responding: {}", e)))?;
        info!("SMC reachable on {} ({} keys)", self.device.display(), link.key_count);
        Ok(Box::new(link))
    }
}

/// Open link speaking the port protocol over any [`PortBus`]
pub struct PortLink<B: PortBus> {
    bus: B,
    key_count: u32,
    /// Index position -> key, filled while binary-searching the key table
    index_cache: HashMap<u32, ControllerKey>,
}

impl<B: PortBus> PortLink<B> {
    /// Verify the controller answers and read the size of its key table
    pub fn probe(bus: B) -> Result<Self, LinkError> {
        let mut link = Self {
            bus,
            key_count: 0,
            index_cache: HashMap::new(),
        };
        let count_key: ControllerKey = keys::KEY_COUNT
            .parse()
            .map_err(|e| LinkError::Protocol(format!("{}", e)))?;
        let bytes = link.transact_read(port::CMD_READ, *count_key.as_bytes(), 4)?;
        link.key_count = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if link.key_count == 0 {
            return Err(LinkError::Protocol("controller reports an empty key table".into()));
        }
        Ok(link)
    }

    pub fn key_count(&self) -> u32 {
        self.key_count
    }

    fn wait_status(&mut self, val: u8, mask: u8, what: &str) -> Result<(), LinkError> {
        let mut step = port::WAIT_STEP;
        for attempt in 0..port::WAIT_ATTEMPTS {
            let status = self.bus.inb(port::CMD_PORT)?;
            if status & mask == val {
                return Ok(());
            }
            thread::sleep(step);
            if attempt > 9 {
                step *= 2;
            }
        }
        Err(LinkError::Timeout(what.to_string()))
    }

    fn send_command(&mut self, cmd: u8) -> Result<(), LinkError> {
        self.wait_status(0, port::STATUS_IB_CLOSED, "accepting a command")?;
        self.bus.outb(port::CMD_PORT, cmd)?;
        Ok(())
    }

    fn send_byte(&mut self, value: u8) -> Result<(), LinkError> {
        self.wait_status(0, port::STATUS_IB_CLOSED, "accepting data")?;
        // Separate read: bit 0x04 can lag behind 0x02 falling
        self.wait_status(port::STATUS_BUSY, port::STATUS_BUSY, "starting the command")?;
        self.bus.outb(port::DATA_PORT, value)?;
        Ok(())
    }

    /// Bring the controller to idle before a new command
    fn ensure_idle(&mut self) -> Result<(), LinkError> {
        if self.wait_status(0, port::STATUS_BUSY, "settling").is_ok() {
            return Ok(());
        }
        self.send_command(port::CMD_READ)?;
        self.wait_status(0, port::STATUS_BUSY, "settling after reset")
    }

    fn transact_read(&mut self, cmd: u8, argument: [u8; 4], len: u8) -> Result<Vec<u8>, LinkError> {
        if len == 0 || len > port::MAX_DATA_LEN {
            return Err(LinkError::Protocol(format!("invalid read length {}", len)));
        }
        self.ensure_idle()?;
        self.send_command(cmd)?;
        for b in argument {
            self.send_byte(b)?;
        }
        self.send_byte(len)?;

        let mut data = Vec::with_capacity(len as usize);
        let ready = port::STATUS_AWAITING_DATA | port::STATUS_BUSY;
        for _ in 0..len {
            self.wait_status(ready, ready, "producing data")?;
            data.push(self.bus.inb(port::DATA_PORT)?);
        }

        // Drain anything the controller still offers
        let mut flushed = 0;
        for _ in 0..16 {
            thread::sleep(port::WAIT_STEP);
            let status = self.bus.inb(port::CMD_PORT)?;
            if status & port::STATUS_AWAITING_DATA == 0 {
                break;
            }
            self.bus.inb(port::DATA_PORT)?;
            flushed += 1;
        }
        if flushed > 0 {
            warn!("Flushed {} trailing bytes after command 0x{:02X}", flushed, cmd);
        }

        self.wait_status(0, port::STATUS_BUSY, "finishing the read")?;
        Ok(data)
    }

    fn transact_write(&mut self, key: ControllerKey, payload: &[u8]) -> Result<(), LinkError> {
        if payload.is_empty() || payload.len() > port::MAX_DATA_LEN as usize {
            return Err(LinkError::Protocol(format!("invalid write length {}", payload.len())));
        }
        self.ensure_idle()?;
        self.send_command(port::CMD_WRITE)?;
        for b in *key.as_bytes() {
            self.send_byte(b)?;
        }
        self.send_byte(payload.len() as u8)?;
        for b in payload {
            self.send_byte(*b)?;
        }
        self.wait_status(0, port::STATUS_BUSY, "finishing the write")
    }

    fn key_at(&mut self, index: u32) -> Result<ControllerKey, LinkError> {
        if let Some(key) = self.index_cache.get(&index) {
            return Ok(*key);
        }
        let bytes = self.transact_read(port::CMD_KEY_BY_INDEX, index.to_be_bytes(), 4)?;
        let key = ControllerKey::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            .map_err(|e| LinkError::Protocol(e.to_string()))?;
        self.index_cache.insert(index, key);
        Ok(key)
    }

    /// Binary search of the controller's sorted key table
    fn contains(&mut self, key: ControllerKey) -> Result<bool, LinkError> {
        let target = key.as_u32();
        let (mut lo, mut hi) = (0u32, self.key_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key_at(mid)?.as_u32().cmp(&target) {
                std::cmp::Ordering::Equal => return Ok(true),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(false)
    }
}

impl<B: PortBus> SmcLink for PortLink<B> {
    fn key_info(&mut self, key: ControllerKey) -> Result<Option<KeyInfo>, LinkError> {
        if !self.contains(key)? {
            debug!("{} not in controller key table", key);
            return Ok(None);
        }
        let info = self.transact_read(port::CMD_KEY_INFO, *key.as_bytes(), port::KEY_INFO_LEN)?;
        let len = info[0];
        if len == 0 || len > port::MAX_DATA_LEN {
            return Err(LinkError::Protocol(format!("{} declares length {}", key, len)));
        }
        Ok(Some(KeyInfo {
            len,
            data_type: DataType::from_tag([info[1], info[2], info[3], info[4]]),
            flags: info[5],
        }))
    }

    fn read(&mut self, key: ControllerKey, len: u8) -> Result<Vec<u8>, LinkError> {
        self.transact_read(port::CMD_READ, *key.as_bytes(), len)
    }

    fn write(&mut self, key: ControllerKey, payload: &[u8]) -> Result<(), LinkError> {
        self.transact_write(key, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Register-level model of the controller handshake
    #[derive(Default)]
    struct FakeSmc {
        table: Vec<(ControllerKey, KeyInfo, Vec<u8>)>,
        cmd: Option<u8>,
        args: Vec<u8>,
        out: VecDeque<u8>,
        busy: bool,
        writes: Vec<(ControllerKey, Vec<u8>)>,
        dead: bool,
    }

    impl FakeSmc {
        fn with_keys(mut entries: Vec<(&str, KeyInfo, Vec<u8>)>) -> Self {
            entries.sort_by_key(|(k, _, _)| k.parse::<ControllerKey>().unwrap());
            Self {
                table: entries
                    .into_iter()
                    .map(|(k, i, v)| (k.parse().unwrap(), i, v))
                    .collect(),
                ..Default::default()
            }
        }

        fn find(&self, key: &[u8]) -> Option<&(ControllerKey, KeyInfo, Vec<u8>)> {
            self.table.iter().find(|(k, _, _)| k.as_bytes() == key)
        }

        fn on_data(&mut self) {
            let Some(cmd) = self.cmd else { return };
            if cmd == port::CMD_WRITE {
                if self.args.len() >= 5 && self.args.len() == 5 + self.args[4] as usize {
                    let key = ControllerKey::from_bytes(self.args[..4].try_into().unwrap()).unwrap();
                    self.writes.push((key, self.args[5..].to_vec()));
                    self.busy = false;
                }
                return;
            }
            if self.args.len() != 5 {
                return;
            }
            let len = self.args[4] as usize;
            let reply: Option<Vec<u8>> = match cmd {
                port::CMD_READ if &self.args[..4] == b"#KEY" => {
                    Some((self.table.len() as u32).to_be_bytes().to_vec())
                }
                port::CMD_READ => self.find(&self.args[..4]).map(|(_, _, v)| v.clone()),
                port::CMD_KEY_BY_INDEX => {
                    let idx = u32::from_be_bytes(self.args[..4].try_into().unwrap()) as usize;
                    self.table.get(idx).map(|(k, _, _)| k.as_bytes().to_vec())
                }
                port::CMD_KEY_INFO => self.find(&self.args[..4]).map(|(_, i, _)| {
                    let mut v = vec![i.len];
                    v.extend_from_slice(&i.data_type.tag());
                    v.push(i.flags);
                    v
                }),
                _ => None,
            };
            match reply {
                Some(mut bytes) => {
                    bytes.truncate(len);
                    self.out = bytes.into();
                }
                None => self.busy = false,
            }
        }
    }

    #[derive(Clone)]
    struct FakeBus(Arc<Mutex<FakeSmc>>);

    impl PortBus for FakeBus {
        fn inb(&mut self, p: u64) -> io::Result<u8> {
            let mut smc = self.0.lock().unwrap();
            if smc.dead {
                return Ok(0xFF);
            }
            if p == port::CMD_PORT {
                let mut status = 0;
                if smc.busy {
                    status |= port::STATUS_BUSY;
                }
                if !smc.out.is_empty() {
                    status |= port::STATUS_AWAITING_DATA;
                }
                return Ok(status);
            }
            let b = smc.out.pop_front().unwrap_or(0);
            if smc.out.is_empty() {
                smc.busy = false;
            }
            Ok(b)
        }

        fn outb(&mut self, p: u64, value: u8) -> io::Result<()> {
            let mut smc = self.0.lock().unwrap();
            if p == port::CMD_PORT {
                smc.cmd = Some(value);
                smc.args.clear();
                smc.out.clear();
                smc.busy = true;
            } else {
                smc.args.push(value);
                smc.on_data();
            }
            Ok(())
        }
    }

    fn fake_bus() -> FakeBus {
        FakeBus(Arc::new(Mutex::new(FakeSmc::with_keys(vec![
            ("F0Ac", KeyInfo::new(2, DataType::Fpe2), vec![0x13, 0x88]),
            ("F0Md", KeyInfo::new(1, DataType::Ui8), vec![0]),
            ("FNum", KeyInfo::new(1, DataType::Ui8), vec![1]),
            ("TC0P", KeyInfo::new(2, DataType::Sp78), vec![0x2D, 0x80]),
            ("TG0E", KeyInfo::new(2, DataType::Sp78), vec![0x30, 0x00]),
        ]))))
    }

    fn key(s: &str) -> ControllerKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_probe_reads_key_count() {
        let link = PortLink::probe(fake_bus()).unwrap();
        assert_eq!(link.key_count(), 5);
    }

    #[test]
    fn test_key_info_found_by_binary_search() {
        let mut link = PortLink::probe(fake_bus()).unwrap();
        let info = link.key_info(key("TC0P")).unwrap().unwrap();
        assert_eq!(info.len, 2);
        assert_eq!(info.data_type, DataType::Sp78);
        let info = link.key_info(key("F0Ac")).unwrap().unwrap();
        assert_eq!(info.data_type, DataType::Fpe2);
    }

    #[test]
    fn test_absent_key_is_none() {
        let mut link = PortLink::probe(fake_bus()).unwrap();
        assert_eq!(link.key_info(key("Tp09")).unwrap(), None);
        assert_eq!(link.key_info(key("AAAA")).unwrap(), None);
        assert_eq!(link.key_info(key("zzzz")).unwrap(), None);
    }

    #[test]
    fn test_read_value() {
        let mut link = PortLink::probe(fake_bus()).unwrap();
        assert_eq!(link.read(key("TC0P"), 2).unwrap(), vec![0x2D, 0x80]);
        assert_eq!(link.read(key("FNum"), 1).unwrap(), vec![1]);
    }

    #[test]
    fn test_write_value() {
        let bus = fake_bus();
        let mut link = PortLink::probe(bus.clone()).unwrap();
        link.write(key("F0Md"), &[1]).unwrap();
        let smc = bus.0.lock().unwrap();
        assert_eq!(smc.writes, vec![(key("F0Md"), vec![1])]);
    }

    #[test]
    fn test_dead_controller_times_out() {
        let bus = fake_bus();
        bus.0.lock().unwrap().dead = true;
        assert!(matches!(PortLink::probe(bus), Err(LinkError::Timeout(_))));
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let driver = PortIoDriver::with_device("/nonexistent/fluxbar-port");
        assert!(matches!(driver.open(), Err(ConnectError::Unavailable(_))));
    }

    #[test]
    fn test_invalid_lengths_rejected() {
        let mut link = PortLink::probe(fake_bus()).unwrap();
        assert!(matches!(link.read(key("TC0P"), 0), Err(LinkError::Protocol(_))));
        assert!(matches!(link.write(key("F0Md"), &[]), Err(LinkError::Protocol(_))));
    }
}
