//! Controller key addressing

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{FluxbarError, Result};
use crate::smc::codec::DataType;

/// Width of every key in the canonical protocol
pub const KEY_LEN: usize = 4;

/// Four-byte ASCII register name, e.g. `F0Ac` or `TC0P`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerKey([u8; KEY_LEN]);

impl ControllerKey {
    /// Build a key from raw bytes. Every byte must be printable ASCII.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Result<Self> {
        if let Some(bad) = bytes.iter().find(|b| !(0x20..=0x7E).contains(*b)) {
            return Err(FluxbarError::InvalidKey {
                key: String::from_utf8_lossy(&bytes).into_owned(),
                reason: format!("byte 0x{:02X} is not printable ASCII", bad),
            });
        }
        Ok(Self(bytes))
    }

    /// Per-fan key, `F{index}{suffix}`
    pub fn fan(index: u8, suffix: &str) -> Result<Self> {
        if index > 9 {
            return Err(FluxbarError::InvalidKey {
                key: format!("F{}{}", index, suffix),
                reason: "fan index must be a single digit".into(),
            });
        }
        format!("F{}{}", index, suffix).parse()
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // from_bytes admits printable ASCII only
        std::str::from_utf8(&self.0).unwrap_or("????")
    }

    /// Key as a big-endian integer, the order controllers sort their index by
    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl FromStr for ControllerKey {
    type Err = FluxbarError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = s.as_bytes().try_into().map_err(|_| FluxbarError::InvalidKey {
            key: s.to_string(),
            reason: format!("expected {} bytes, got {}", KEY_LEN, s.len()),
        })?;
        Self::from_bytes(bytes)
    }
}

impl TryFrom<&str> for ControllerKey {
    type Error = FluxbarError;

    fn try_from(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ControllerKey({:?})", self.as_str())
    }
}

impl Serialize for ControllerKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ControllerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Metadata the controller declares for a key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyInfo {
    /// Payload width in bytes
    pub len: u8,
    pub data_type: DataType,
    /// Attribute bits as reported by the controller
    pub flags: u8,
}

impl KeyInfo {
    pub fn new(len: u8, data_type: DataType) -> Self {
        Self { len, data_type, flags: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_key() {
        let key: ControllerKey = "TC0P".parse().unwrap();
        assert_eq!(key.as_str(), "TC0P");
        assert_eq!(key.to_string(), "TC0P");
    }

    #[test]
    fn test_key_with_trailing_space() {
        let key: ControllerKey = "Num ".parse().unwrap();
        assert_eq!(key.as_bytes(), b"Num ");
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!("TC0".parse::<ControllerKey>().is_err());
        assert!("TC0PX".parse::<ControllerKey>().is_err());
    }

    #[test]
    fn test_non_printable_rejected() {
        assert!(ControllerKey::from_bytes([b'T', 0x00, b'0', b'P']).is_err());
    }

    #[test]
    fn test_fan_key() {
        assert_eq!(ControllerKey::fan(0, "Ac").unwrap().as_str(), "F0Ac");
        assert_eq!(ControllerKey::fan(3, "Mx").unwrap().as_str(), "F3Mx");
        assert!(ControllerKey::fan(10, "Ac").is_err());
    }

    #[test]
    fn test_key_ordering_matches_numeric() {
        let a: ControllerKey = "F0Ac".parse().unwrap();
        let b: ControllerKey = "TC0P".parse().unwrap();
        assert!(a < b);
        assert!(a.as_u32() < b.as_u32());
    }

    #[test]
    fn test_serde_as_string() {
        let key: ControllerKey = "Tp09".parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"Tp09\"");
        let back: ControllerKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
