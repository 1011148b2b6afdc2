//! State values held by attributes.
//!
//! A [`StateValue`] is a small closed variant. Reading it as the wrong type
//! fails with [`StateError::StateValueTypeMismatch`]; nothing is coerced.

use crate::error::{Result, StateError};
use std::fmt;
use std::io::{Read, Write};

/// Type tag of a [`StateValue`], also used as its on-disk discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// No value.
    Null = 0,
    /// 32-bit integer.
    Int = 1,
    /// 64-bit integer.
    Long = 2,
    /// 64-bit float.
    Double = 3,
    /// UTF-8 string.
    String = 4,
}

impl ValueType {
    /// Creates a ValueType from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Null),
            1 => Some(Self::Int),
            2 => Some(Self::Long),
            3 => Some(Self::Double),
            4 => Some(Self::String),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::String => "string",
        };
        f.write_str(name)
    }
}

/// The value an attribute holds during an interval.
#[derive(Debug, Clone, Default)]
pub enum StateValue {
    /// No value or unknown.
    #[default]
    Null,
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
}

impl StateValue {
    /// Returns the type tag of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Null => ValueType::Null,
            Self::Int(_) => ValueType::Int,
            Self::Long(_) => ValueType::Long,
            Self::Double(_) => ValueType::Double,
            Self::String(_) => ValueType::String,
        }
    }

    /// Returns true if this is the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn mismatch(&self, expected: ValueType) -> StateError {
        StateError::StateValueTypeMismatch {
            expected,
            actual: self.value_type(),
        }
    }

    /// Reads the value as a 32-bit integer.
    pub fn unbox_int(&self) -> Result<i32> {
        match self {
            Self::Int(v) => Ok(*v),
            other => Err(other.mismatch(ValueType::Int)),
        }
    }

    /// Reads the value as a 64-bit integer.
    pub fn unbox_long(&self) -> Result<i64> {
        match self {
            Self::Long(v) => Ok(*v),
            other => Err(other.mismatch(ValueType::Long)),
        }
    }

    /// Reads the value as a 64-bit float.
    pub fn unbox_double(&self) -> Result<f64> {
        match self {
            Self::Double(v) => Ok(*v),
            other => Err(other.mismatch(ValueType::Double)),
        }
    }

    /// Reads the value as a string slice.
    pub fn unbox_str(&self) -> Result<&str> {
        match self {
            Self::String(v) => Ok(v),
            other => Err(other.mismatch(ValueType::String)),
        }
    }

    /// Number of bytes [`write_to`](Self::write_to) produces.
    pub fn encoded_size(&self) -> usize {
        1 + match self {
            Self::Null => 0,
            Self::Int(_) => 4,
            Self::Long(_) | Self::Double(_) => 8,
            Self::String(s) => 4 + s.len(),
        }
    }

    /// Writes the value as a type tag followed by a little-endian payload.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.value_type() as u8])?;
        match self {
            Self::Null => {}
            Self::Int(v) => writer.write_all(&v.to_le_bytes())?,
            Self::Long(v) => writer.write_all(&v.to_le_bytes())?,
            Self::Double(v) => writer.write_all(&v.to_bits().to_le_bytes())?,
            Self::String(s) => {
                let len = u32::try_from(s.len()).map_err(|_| {
                    StateError::InvalidArgument(format!("string value of {} bytes", s.len()))
                })?;
                writer.write_all(&len.to_le_bytes())?;
                writer.write_all(s.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Reads a value written by [`write_to`](Self::write_to).
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;
        let value_type = ValueType::from_u8(tag[0])
            .ok_or_else(|| StateError::Decode(format!("unknown value type tag {}", tag[0])))?;

        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];
        let value = match value_type {
            ValueType::Null => Self::Null,
            ValueType::Int => {
                reader.read_exact(&mut buf4)?;
                Self::Int(i32::from_le_bytes(buf4))
            }
            ValueType::Long => {
                reader.read_exact(&mut buf8)?;
                Self::Long(i64::from_le_bytes(buf8))
            }
            ValueType::Double => {
                reader.read_exact(&mut buf8)?;
                Self::Double(f64::from_bits(u64::from_le_bytes(buf8)))
            }
            ValueType::String => {
                reader.read_exact(&mut buf4)?;
                let len = u32::from_le_bytes(buf4) as usize;
                let mut bytes = vec![0u8; len];
                reader.read_exact(&mut bytes)?;
                let s = String::from_utf8(bytes)
                    .map_err(|e| StateError::Decode(format!("Invalid UTF-8 in string value: {}", e)))?;
                Self::String(s)
            }
        };
        Ok(value)
    }
}

// Doubles compare by bit pattern so that equality stays reflexive (NaN == NaN)
// and a value read back from disk equals the value written.
impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for StateValue {}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::String(v) => f.write_str(v),
        }
    }
}

impl From<i32> for StateValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
