//! Quarks, timestamps and the persisted interval type.

use crate::error::{Result, StateError};
use crate::value::StateValue;
use std::io::{Read, Write};

/// Timestamp in nanoseconds.
pub type Timestamp = i64;

/// Integer handle of one attribute in the attribute tree.
pub type Quark = i32;

/// Quark of the (unnamed) root of the attribute tree.
pub const ROOT_ATTRIBUTE: Quark = -1;

/// Sentinel returned by non-failing lookups when no attribute matches.
pub const INVALID_ATTRIBUTE: Quark = -2;

/// Fixed part of an encoded interval: start, end, quark.
pub const INTERVAL_HEADER_SIZE: usize = 8 + 8 + 4;

/// A closed time range over which one attribute held one value.
///
/// Both bounds are inclusive: `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInterval {
    start: Timestamp,
    end: Timestamp,
    quark: Quark,
    value: StateValue,
}

impl StateInterval {
    /// Creates a new interval.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidArgument` if `end < start`.
    pub fn new(start: Timestamp, end: Timestamp, quark: Quark, value: StateValue) -> Result<Self> {
        if end < start {
            return Err(StateError::InvalidArgument(format!(
                "interval of quark {} ends at {} before its start {}",
                quark, end, start
            )));
        }
        Ok(Self {
            start,
            end,
            quark,
            value,
        })
    }

    /// Start time (inclusive).
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// End time (inclusive).
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Attribute this interval belongs to.
    pub fn quark(&self) -> Quark {
        self.quark
    }

    /// Value held during the interval.
    pub fn value(&self) -> &StateValue {
        &self.value
    }

    /// Consumes the interval and returns its value.
    pub fn into_value(self) -> StateValue {
        self.value
    }

    /// Returns true if `t` lies within `[start, end]`.
    pub fn intersects(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }

    /// Number of bytes [`write_to`](Self::write_to) produces.
    pub fn encoded_size(&self) -> usize {
        INTERVAL_HEADER_SIZE + self.value.encoded_size()
    }

    /// Writes the interval to a writer.
    ///
    /// Format:
    /// - start: i64
    /// - end: i64
    /// - quark: i32
    /// - value: type tag u8 + payload
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.start.to_le_bytes())?;
        writer.write_all(&self.end.to_le_bytes())?;
        writer.write_all(&self.quark.to_le_bytes())?;
        self.value.write_to(writer)
    }

    /// Reads an interval from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf8 = [0u8; 8];
        reader.read_exact(&mut buf8)?;
        let start = i64::from_le_bytes(buf8);
        reader.read_exact(&mut buf8)?;
        let end = i64::from_le_bytes(buf8);

        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let quark = i32::from_le_bytes(buf4);

        let value = StateValue::read_from(reader)?;
        if end < start || quark < 0 {
            return Err(StateError::Decode(format!(
                "malformed interval [{}, {}] for quark {}",
                start, end, quark
            )));
        }

        Ok(Self {
            start,
            end,
            quark,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_rejects_reversed_bounds() {
        assert!(matches!(
            StateInterval::new(10, 9, 0, StateValue::Null),
            Err(StateError::InvalidArgument(_))
        ));
        assert!(StateInterval::new(10, 10, 0, StateValue::Null).is_ok());
    }

    #[test]
    fn test_intersects_is_inclusive() {
        let interval = StateInterval::new(10, 19, 0, StateValue::Int(2)).unwrap();
        assert!(interval.intersects(10));
        assert!(interval.intersects(19));
        assert!(!interval.intersects(9));
        assert!(!interval.intersects(20));
    }

    #[test]
    fn test_encoding_roundtrip() {
        let interval = StateInterval::new(-5, 1_000, 42, StateValue::from("sda")).unwrap();
        let mut buf = Vec::new();
        interval.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), interval.encoded_size());

        let read = StateInterval::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, interval);
    }

    #[test]
    fn test_decode_rejects_negative_quark() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0i64.to_le_bytes());
        buf.extend_from_slice(&1i64.to_le_bytes());
        buf.extend_from_slice(&(-1i32).to_le_bytes());
        buf.push(0);
        let result = StateInterval::read_from(&mut Cursor::new(buf));
        assert!(matches!(result, Err(StateError::Decode(_))));
    }
}
