//! Interval store: the persisted, append-only history of closed intervals.
//!
//! # Components
//!
//! - [`HistoryBackend`]: storage seam implemented by every backend
//! - [`InMemoryBackend`]: per-quark vectors, for small or short-lived histories
//! - [`HistoryTreeBackend`]: paginated on-disk history tree
//! - [`IntervalStore`]: enforces per-quark contiguity and monotonic insertion
//!   in front of any backend, and latches into a corrupted state on violation

pub mod htree;
pub mod memory;

pub use htree::{HistoryTreeBackend, HistoryTreeConfig};
pub use memory::InMemoryBackend;

use crate::attribute::AttributeTree;
use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, Timestamp, INTERVAL_HEADER_SIZE};
use crate::value::StateValue;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::error;

/// Storage backend for closed intervals.
///
/// Implementations are internally synchronized: one writer calls
/// [`insert_past_state`](Self::insert_past_state) while any number of
/// readers query. A reader must never observe a partially inserted interval.
pub trait HistoryBackend: Send + Sync {
    /// Earliest time covered by the history.
    fn start_time(&self) -> Timestamp;

    /// Latest end time of any interval inserted so far.
    fn end_time(&self) -> Timestamp;

    /// Largest encoded interval the backend accepts, `None` if unbounded.
    fn max_interval_size(&self) -> Option<usize> {
        None
    }

    /// Appends a closed interval.
    fn insert_past_state(&self, interval: StateInterval) -> Result<()>;

    /// Marks the history complete at `end_time` and persists the namespace.
    fn finished_building(&self, end_time: Timestamp, attributes: &AttributeTree) -> Result<()>;

    /// Fills `states[q]` with the interval of quark `q` covering `t`, for every
    /// quark the backend has an interval for. Slots of quarks without a stored
    /// interval at `t` are left untouched.
    fn do_query(&self, t: Timestamp, states: &mut [Option<StateInterval>]) -> Result<()>;

    /// Returns the stored interval of `quark` covering `t`, if any.
    fn do_single_query(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>>;

    /// Releases the backend's resources. Further calls fail.
    fn dispose(&self) -> Result<()>;
}

/// Selects the backend a new state system is created with.
#[derive(Debug, Clone, Default)]
pub enum BackendKind {
    /// Keep every interval in memory.
    #[default]
    InMemory,
    /// Persist intervals in a history tree file.
    HistoryTree {
        /// Location of the history file.
        path: PathBuf,
        /// Tree layout parameters.
        config: HistoryTreeConfig,
    },
}

impl BackendKind {
    /// Creates the backend for a history starting at `start_time`.
    pub fn create(&self, start_time: Timestamp) -> Result<Box<dyn HistoryBackend>> {
        match self {
            Self::InMemory => Ok(Box::new(InMemoryBackend::new(start_time))),
            Self::HistoryTree { path, config } => {
                let config = config.clone().with_tree_start(start_time);
                Ok(Box::new(HistoryTreeBackend::create(path, config)?))
            }
        }
    }
}

#[derive(Debug)]
struct WriteCursor {
    /// Start time the next interval of each quark must have.
    next_start: Vec<Timestamp>,
    /// End time of the last inserted interval.
    last_end: Timestamp,
}

/// Contiguity-checking front of a [`HistoryBackend`].
pub struct IntervalStore {
    backend: Box<dyn HistoryBackend>,
    cursor: Mutex<WriteCursor>,
    corrupted: AtomicBool,
}

impl IntervalStore {
    /// Wraps a backend whose history has not been written yet.
    pub fn new(backend: Box<dyn HistoryBackend>) -> Self {
        let last_end = backend.start_time();
        Self {
            backend,
            cursor: Mutex::new(WriteCursor {
                next_start: Vec::new(),
                last_end,
            }),
            corrupted: AtomicBool::new(false),
        }
    }

    /// Earliest time covered by the store.
    pub fn start_time(&self) -> Timestamp {
        self.backend.start_time()
    }

    /// Latest end time of any stored interval.
    pub fn end_time(&self) -> Timestamp {
        self.backend.end_time()
    }

    /// Returns true once a consistency violation was detected.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    fn check_healthy(&self) -> Result<()> {
        if self.is_corrupted() {
            return Err(StateError::StoreCorrupted);
        }
        Ok(())
    }

    /// Checks that an interval holding `value` can be stored later.
    ///
    /// # Errors
    ///
    /// Returns `StateError::IntervalTooLarge` if the backend has no room for it.
    pub fn check_value_fits(&self, value: &StateValue) -> Result<()> {
        let Some(capacity) = self.backend.max_interval_size() else {
            return Ok(());
        };
        let size = INTERVAL_HEADER_SIZE + value.encoded_size();
        if size > capacity {
            return Err(StateError::IntervalTooLarge { size, capacity });
        }
        Ok(())
    }

    /// Appends the closed interval `[start, end]` of `quark`.
    ///
    /// The interval must start exactly one unit after the previous interval
    /// of the same quark ended (or at the store start for the first one), and
    /// must not end before the last inserted interval.
    ///
    /// # Errors
    ///
    /// - `StateError::ContiguityViolation` if the interval leaves a gap or
    ///   overlaps; the store is then marked corrupted
    /// - `StateError::InvalidArgument` for reversed or out-of-order bounds
    /// - `StateError::StoreCorrupted` if a previous violation was detected
    pub fn insert_past_state(
        &self,
        start: Timestamp,
        end: Timestamp,
        quark: Quark,
        value: StateValue,
    ) -> Result<()> {
        self.check_healthy()?;
        if quark < 0 {
            return Err(StateError::AttributeNotFound(format!("quark {}", quark)));
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());

        let index = quark as usize;
        let expected = cursor
            .next_start
            .get(index)
            .copied()
            .unwrap_or_else(|| self.backend.start_time());
        if start != expected {
            self.corrupted.store(true, Ordering::Release);
            error!(
                "Non-contiguous interval on quark {}: expected start {}, got {}; store marked corrupted",
                quark, expected, start
            );
            return Err(StateError::ContiguityViolation {
                quark,
                expected,
                actual: start,
            });
        }
        if end < cursor.last_end {
            return Err(StateError::InvalidArgument(format!(
                "interval of quark {} ends at {} before the last stored end {}",
                quark, end, cursor.last_end
            )));
        }

        let interval = StateInterval::new(start, end, quark, value)?;
        self.backend.insert_past_state(interval)?;

        if cursor.next_start.len() <= index {
            let fill = self.backend.start_time();
            cursor.next_start.resize(index + 1, fill);
        }
        cursor.next_start[index] = end + 1;
        cursor.last_end = end;
        Ok(())
    }

    fn check_time(&self, t: Timestamp) -> Result<()> {
        let (start, end) = (self.start_time(), self.end_time());
        if t < start || t > end {
            return Err(StateError::TimeRangeInvalid { time: t, start, end });
        }
        Ok(())
    }

    /// Returns the stored interval of `quark` covering `t`.
    ///
    /// `Ok(None)` means the quark's interval covering `t` is still open.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TimeRangeInvalid` if `t` is outside
    /// `[start_time, end_time]`.
    pub fn query(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        self.check_healthy()?;
        self.check_time(t)?;
        self.backend.do_single_query(t, quark)
    }

    /// Fills `states` with every stored interval covering `t` in one pass.
    pub fn query_full(&self, t: Timestamp, states: &mut [Option<StateInterval>]) -> Result<()> {
        self.check_healthy()?;
        self.check_time(t)?;
        self.backend.do_query(t, states)
    }

    /// Marks the history complete; see [`HistoryBackend::finished_building`].
    pub fn finished_building(&self, end_time: Timestamp, attributes: &AttributeTree) -> Result<()> {
        self.check_healthy()?;
        self.backend.finished_building(end_time, attributes)
    }

    /// Releases the backend.
    pub fn dispose(&self) -> Result<()> {
        self.backend.dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IntervalStore {
        IntervalStore::new(Box::new(InMemoryBackend::new(0)))
    }

    #[test]
    fn test_contiguous_inserts_accepted() {
        let store = store();
        store.insert_past_state(0, 9, 0, StateValue::Int(1)).unwrap();
        store.insert_past_state(0, 14, 1, StateValue::Null).unwrap();
        store.insert_past_state(10, 19, 0, StateValue::Int(2)).unwrap();
        assert_eq!(store.end_time(), 19);
        assert_eq!(
            store.query(15, 0).unwrap().unwrap().value(),
            &StateValue::Int(2)
        );
    }

    #[test]
    fn test_gap_marks_store_corrupted() {
        let store = store();
        store.insert_past_state(0, 9, 0, StateValue::Int(1)).unwrap();
        let err = store.insert_past_state(11, 19, 0, StateValue::Int(2)).unwrap_err();
        assert!(matches!(
            err,
            StateError::ContiguityViolation {
                quark: 0,
                expected: 10,
                actual: 11
            }
        ));
        assert!(store.is_corrupted());
        assert!(matches!(store.query(5, 0), Err(StateError::StoreCorrupted)));
        assert!(matches!(
            store.insert_past_state(10, 19, 0, StateValue::Int(2)),
            Err(StateError::StoreCorrupted)
        ));
    }

    #[test]
    fn test_first_interval_must_start_at_store_start() {
        let store = store();
        let err = store.insert_past_state(5, 9, 3, StateValue::Null).unwrap_err();
        assert!(matches!(err, StateError::ContiguityViolation { expected: 0, .. }));
    }

    #[test]
    fn test_out_of_order_end_rejected_without_corruption() {
        let store = store();
        store.insert_past_state(0, 20, 0, StateValue::Int(1)).unwrap();
        let err = store.insert_past_state(0, 10, 1, StateValue::Int(1)).unwrap_err();
        assert!(matches!(err, StateError::InvalidArgument(_)));
        assert!(!store.is_corrupted());
    }

    #[test]
    fn test_query_outside_bounds() {
        let store = store();
        store.insert_past_state(0, 9, 0, StateValue::Int(1)).unwrap();
        assert!(matches!(
            store.query(10, 0),
            Err(StateError::TimeRangeInvalid { time: 10, start: 0, end: 9 })
        ));
        assert!(store.query(-1, 0).is_err());
    }
}
