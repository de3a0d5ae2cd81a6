//! Wire codec
//!
//! Pure conversions between controller payloads and numbers. The controller tags
//! every key with a four-character encoding; the widths and fixed-point splits
//! below are protocol constants, never discovered at runtime.
//!
//! A payload whose length does not match what the encoding expects is rejected
//! with `DecodeError::WidthMismatch`. Nothing here truncates or zero-pads.

use std::fmt;

use crate::error::DecodeError;

/// Encoding tag attached to every key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Ui8,
    Ui16,
    Ui32,
    Si8,
    Si16,
    Flag,
    /// Unsigned fixed point, 14 integer bits and 2 fraction bits
    Fpe2,
    /// Signed fixed point, 7 integer bits and 8 fraction bits
    Sp78,
    /// IEEE-754 single precision, little-endian
    Flt,
    Other([u8; 4]),
}

impl DataType {
    pub fn from_tag(tag: [u8; 4]) -> Self {
        match &tag {
            b"ui8 " => Self::Ui8,
            b"ui16" => Self::Ui16,
            b"ui32" => Self::Ui32,
            b"si8 " => Self::Si8,
            b"si16" => Self::Si16,
            b"flag" => Self::Flag,
            b"fpe2" => Self::Fpe2,
            b"sp78" => Self::Sp78,
            b"flt " => Self::Flt,
            _ => Self::Other(tag),
        }
    }

    pub fn tag(&self) -> [u8; 4] {
        match self {
            Self::Ui8 => *b"ui8 ",
            Self::Ui16 => *b"ui16",
            Self::Ui32 => *b"ui32",
            Self::Si8 => *b"si8 ",
            Self::Si16 => *b"si16",
            Self::Flag => *b"flag",
            Self::Fpe2 => *b"fpe2",
            Self::Sp78 => *b"sp78",
            Self::Flt => *b"flt ",
            Self::Other(tag) => *tag,
        }
    }

    /// Payload width the encoding requires, `None` for unrecognized tags
    pub fn width(&self) -> Option<usize> {
        match self {
            Self::Ui8 | Self::Si8 | Self::Flag => Some(1),
            Self::Ui16 | Self::Si16 | Self::Fpe2 | Self::Sp78 => Some(2),
            Self::Ui32 | Self::Flt => Some(4),
            Self::Other(_) => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.tag()))
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataType({:?})", self.to_string())
    }
}

/// Binary fixed-point layout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedPoint {
    pub integer_bits: u8,
    pub fraction_bits: u8,
    pub signed: bool,
}

impl FixedPoint {
    pub const FPE2: Self = Self { integer_bits: 14, fraction_bits: 2, signed: false };
    pub const SP78: Self = Self { integer_bits: 7, fraction_bits: 8, signed: true };

    /// Total bits including the sign bit
    pub fn bits(&self) -> u32 {
        self.integer_bits as u32 + self.fraction_bits as u32 + self.signed as u32
    }

    /// Payload width in bytes
    pub fn width(&self) -> usize {
        (self.bits() as usize).div_ceil(8)
    }

    fn scale(&self) -> f64 {
        (1u64 << self.fraction_bits) as f64
    }

    fn label(&self) -> String {
        format!("{}.{}", self.integer_bits, self.fraction_bits)
    }

    /// Layouts wider than 32 bits or without any bits are not representable
    fn check(&self) -> Result<(), DecodeError> {
        if self.bits() == 0 || self.bits() > 32 || self.fraction_bits >= 32 {
            return Err(DecodeError::UnsupportedType(format!("fixed point {}", self.label())));
        }
        Ok(())
    }
}

fn check_width(bytes: &[u8], expected: usize) -> Result<(), DecodeError> {
    if bytes.len() != expected {
        return Err(DecodeError::WidthMismatch { expected, actual: bytes.len() });
    }
    Ok(())
}

fn be_value(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)
}

/// Big-endian unsigned integer of width 1, 2 or 4
pub fn decode_unsigned_int(bytes: &[u8]) -> Result<u32, DecodeError> {
    match bytes.len() {
        1 | 2 | 4 => Ok(be_value(bytes)),
        3 => Err(DecodeError::WidthMismatch { expected: 4, actual: 3 }),
        n if n > 4 => Err(DecodeError::WidthMismatch { expected: 4, actual: n }),
        n => Err(DecodeError::WidthMismatch { expected: 1, actual: n }),
    }
}

/// Big-endian encoding of `value` in exactly `width` bytes
pub fn encode_unsigned_int(value: u32, width: usize) -> Result<Vec<u8>, DecodeError> {
    if !matches!(width, 1 | 2 | 4) {
        return Err(DecodeError::WidthMismatch { expected: 4, actual: width });
    }
    if width < 4 && value >> (width * 8) != 0 {
        return Err(DecodeError::OutOfRange {
            value: value as f64,
            encoding: format!("ui{}", width * 8),
        });
    }
    Ok(value.to_be_bytes()[4 - width..].to_vec())
}

/// Decode a fixed-point payload to `raw / 2^fraction_bits`
pub fn decode_fixed_point(bytes: &[u8], format: FixedPoint) -> Result<f64, DecodeError> {
    format.check()?;
    check_width(bytes, format.width())?;
    let bits = format.bits();
    let raw = be_value(bytes) as i64;
    let raw = if format.signed && raw & (1 << (bits - 1)) != 0 {
        raw - (1i64 << bits)
    } else {
        raw
    };
    Ok(raw as f64 / format.scale())
}

/// Encode `value` to the nearest representable fixed-point payload
pub fn encode_fixed_point(value: f64, format: FixedPoint) -> Result<Vec<u8>, DecodeError> {
    format.check()?;
    let bits = format.bits();
    let (min, max) = if format.signed {
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    } else {
        (0, (1i64 << bits) - 1)
    };
    let scaled = (value * format.scale()).round();
    if !scaled.is_finite() || scaled < min as f64 || scaled > max as f64 {
        return Err(DecodeError::OutOfRange {
            value,
            encoding: format.label(),
        });
    }
    let raw = (scaled as i64 & ((1i64 << bits) - 1)) as u32;
    let width = format.width();
    Ok(raw.to_be_bytes()[4 - width..].to_vec())
}

/// Little-endian IEEE-754 single
pub fn decode_float(bytes: &[u8]) -> Result<f64, DecodeError> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| DecodeError::WidthMismatch { expected: 4, actual: bytes.len() })?;
    Ok(f32::from_le_bytes(arr) as f64)
}

pub fn encode_float(value: f64) -> Vec<u8> {
    (value as f32).to_le_bytes().to_vec()
}

/// Decode any supported encoding to a real number
pub fn decode_value(data_type: DataType, bytes: &[u8]) -> Result<f64, DecodeError> {
    if let Some(width) = data_type.width() {
        check_width(bytes, width)?;
    }
    match data_type {
        DataType::Ui8 | DataType::Ui16 | DataType::Ui32 | DataType::Flag => {
            decode_unsigned_int(bytes).map(f64::from)
        }
        DataType::Si8 => Ok(bytes[0] as i8 as f64),
        DataType::Si16 => Ok(i16::from_be_bytes([bytes[0], bytes[1]]) as f64),
        DataType::Fpe2 => decode_fixed_point(bytes, FixedPoint::FPE2),
        DataType::Sp78 => decode_fixed_point(bytes, FixedPoint::SP78),
        DataType::Flt => decode_float(bytes),
        DataType::Other(_) => Err(DecodeError::UnsupportedType(data_type.to_string())),
    }
}

/// Encode a real number for a key of the given encoding
pub fn encode_value(data_type: DataType, value: f64) -> Result<Vec<u8>, DecodeError> {
    let out_of_range = || DecodeError::OutOfRange { value, encoding: data_type.to_string() };
    match data_type {
        DataType::Ui8 | DataType::Ui16 | DataType::Ui32 | DataType::Flag => {
            let rounded = value.round();
            if !(0.0..=u32::MAX as f64).contains(&rounded) {
                return Err(out_of_range());
            }
            let width = data_type.width().unwrap_or(4);
            encode_unsigned_int(rounded as u32, width).map_err(|_| out_of_range())
        }
        DataType::Si8 => {
            let rounded = value.round();
            if !(i8::MIN as f64..=i8::MAX as f64).contains(&rounded) {
                return Err(out_of_range());
            }
            Ok(vec![rounded as i8 as u8])
        }
        DataType::Si16 => {
            let rounded = value.round();
            if !(i16::MIN as f64..=i16::MAX as f64).contains(&rounded) {
                return Err(out_of_range());
            }
            Ok((rounded as i16).to_be_bytes().to_vec())
        }
        DataType::Fpe2 => encode_fixed_point(value, FixedPoint::FPE2),
        DataType::Sp78 => encode_fixed_point(value, FixedPoint::SP78),
        DataType::Flt => Ok(encode_float(value)),
        DataType::Other(_) => Err(DecodeError::UnsupportedType(data_type.to_string())),
    }
}
