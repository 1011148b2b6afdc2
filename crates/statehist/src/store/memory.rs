//! In-memory history backend.
//!
//! Each quark's intervals are kept in a contiguous, end-sorted vector, so a
//! point lookup is a binary search over that quark's history only.

use crate::attribute::AttributeTree;
use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, Timestamp};
use crate::store::HistoryBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    /// Intervals per quark, sorted by end time.
    per_quark: Vec<Vec<StateInterval>>,
    end_time: Timestamp,
    interval_count: usize,
}

/// History backend that keeps every interval in memory.
#[derive(Debug)]
pub struct InMemoryBackend {
    start_time: Timestamp,
    inner: RwLock<Inner>,
    disposed: AtomicBool,
}

impl InMemoryBackend {
    /// Creates an empty backend whose history starts at `start_time`.
    pub fn new(start_time: Timestamp) -> Self {
        Self {
            start_time,
            inner: RwLock::new(Inner {
                end_time: start_time,
                ..Inner::default()
            }),
            disposed: AtomicBool::new(false),
        }
    }

    /// Total number of stored intervals.
    pub fn interval_count(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).interval_count
    }

    fn check_alive(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StateError::StoreDisposed);
        }
        Ok(())
    }

    fn lookup(intervals: &[StateInterval], t: Timestamp) -> Option<&StateInterval> {
        let index = intervals.partition_point(|interval| interval.end() < t);
        intervals.get(index).filter(|interval| interval.start() <= t)
    }
}

impl HistoryBackend for InMemoryBackend {
    fn start_time(&self) -> Timestamp {
        self.start_time
    }

    fn end_time(&self) -> Timestamp {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).end_time
    }

    fn insert_past_state(&self, interval: StateInterval) -> Result<()> {
        self.check_alive()?;
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let index = interval.quark() as usize;
        if inner.per_quark.len() <= index {
            inner.per_quark.resize_with(index + 1, Vec::new);
        }
        inner.end_time = inner.end_time.max(interval.end());
        inner.interval_count += 1;
        inner.per_quark[index].push(interval);
        Ok(())
    }

    fn finished_building(&self, end_time: Timestamp, _attributes: &AttributeTree) -> Result<()> {
        self.check_alive()?;
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.end_time = inner.end_time.max(end_time);
        Ok(())
    }

    fn do_query(&self, t: Timestamp, states: &mut [Option<StateInterval>]) -> Result<()> {
        self.check_alive()?;
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        for (slot, intervals) in states.iter_mut().zip(&inner.per_quark) {
            if let Some(interval) = Self::lookup(intervals, t) {
                *slot = Some(interval.clone());
            }
        }
        Ok(())
    }

    fn do_single_query(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        self.check_alive()?;
        if quark < 0 {
            return Ok(None);
        }
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .per_quark
            .get(quark as usize)
            .and_then(|intervals| Self::lookup(intervals, t))
            .cloned())
    }

    fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::Release);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.per_quark.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StateValue;

    fn interval(start: Timestamp, end: Timestamp, quark: Quark, value: i32) -> StateInterval {
        StateInterval::new(start, end, quark, StateValue::Int(value)).unwrap()
    }

    #[test]
    fn test_point_lookup() {
        let backend = InMemoryBackend::new(0);
        backend.insert_past_state(interval(0, 9, 0, 1)).unwrap();
        backend.insert_past_state(interval(10, 19, 0, 2)).unwrap();
        backend.insert_past_state(interval(20, 29, 0, 3)).unwrap();

        let found = backend.do_single_query(15, 0).unwrap().unwrap();
        assert_eq!((found.start(), found.end()), (10, 19));
        assert!(backend.do_single_query(30, 0).unwrap().is_none());
        assert!(backend.do_single_query(5, 1).unwrap().is_none());
        assert_eq!(backend.end_time(), 29);
        assert_eq!(backend.interval_count(), 3);
    }

    #[test]
    fn test_full_query_leaves_missing_slots() {
        let backend = InMemoryBackend::new(0);
        backend.insert_past_state(interval(0, 9, 0, 1)).unwrap();
        backend.insert_past_state(interval(0, 4, 2, 7)).unwrap();

        let mut states = vec![None; 3];
        backend.do_query(3, &mut states).unwrap();
        assert!(states[0].is_some());
        assert!(states[1].is_none());
        assert_eq!(states[2].as_ref().unwrap().value(), &StateValue::Int(7));
    }

    #[test]
    fn test_disposed_backend_rejects_queries() {
        let backend = InMemoryBackend::new(0);
        backend.insert_past_state(interval(0, 9, 0, 1)).unwrap();
        backend.dispose().unwrap();
        assert!(matches!(
            backend.do_single_query(3, 0),
            Err(StateError::StoreDisposed)
        ));
    }
}
