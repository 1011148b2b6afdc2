//! Ongoing (not yet closed) state of every attribute.
//!
//! The writer keeps, per quark, the value the attribute currently holds and
//! the time it started holding it. A change at time `t` closes the previous
//! value into the interval store as `[start, t - 1]`. Ongoing values never
//! reach the store until they are replaced or the history is closed.

use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, Timestamp};
use crate::store::IntervalStore;
use crate::value::StateValue;

#[derive(Debug)]
pub(crate) struct TransientState {
    store_start: Timestamp,
    values: Vec<StateValue>,
    starts: Vec<Timestamp>,
    latest_time: Timestamp,
}

impl TransientState {
    pub(crate) fn new(store_start: Timestamp) -> Self {
        Self {
            store_start,
            values: Vec::new(),
            starts: Vec::new(),
            latest_time: store_start,
        }
    }

    /// State of a history that was closed at `end`: every quark's ongoing
    /// interval starts after the end and is never returned by queries.
    pub(crate) fn closed(store_start: Timestamp, quarks: usize, end: Timestamp) -> Self {
        Self {
            store_start,
            values: vec![StateValue::Null; quarks],
            starts: vec![end.saturating_add(1); quarks],
            latest_time: end,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn latest_time(&self) -> Timestamp {
        self.latest_time
    }

    /// Grows the state to cover `quarks` attributes. New attributes hold a
    /// null value since the store start.
    pub(crate) fn grow_to(&mut self, quarks: usize) {
        if quarks > self.values.len() {
            self.values.resize(quarks, StateValue::Null);
            self.starts.resize(quarks, self.store_start);
        }
    }

    fn index(&self, quark: Quark) -> Result<usize> {
        if quark < 0 || quark as usize >= self.values.len() {
            return Err(StateError::AttributeNotFound(format!("quark {}", quark)));
        }
        Ok(quark as usize)
    }

    pub(crate) fn ongoing_value(&self, quark: Quark) -> Result<&StateValue> {
        Ok(&self.values[self.index(quark)?])
    }

    pub(crate) fn ongoing_start(&self, quark: Quark) -> Result<Timestamp> {
        Ok(self.starts[self.index(quark)?])
    }

    /// The ongoing interval of `quark`, ending at `current_end`.
    pub(crate) fn ongoing_interval(
        &self,
        quark: Quark,
        current_end: Timestamp,
    ) -> Result<StateInterval> {
        let index = self.index(quark)?;
        let start = self.starts[index];
        StateInterval::new(
            start,
            current_end.max(start),
            quark,
            self.values[index].clone(),
        )
    }

    /// Replaces the ongoing value without closing an interval.
    pub(crate) fn set_ongoing(&mut self, quark: Quark, value: StateValue) -> Result<()> {
        let index = self.index(quark)?;
        self.values[index] = value;
        Ok(())
    }

    fn check_time(&self, t: Timestamp) -> Result<()> {
        if t < self.latest_time {
            return Err(StateError::TimeRangeInvalid {
                time: t,
                start: self.latest_time,
                end: Timestamp::MAX,
            });
        }
        Ok(())
    }

    /// Applies a value change of `quark` at time `t`.
    ///
    /// The ongoing state is only updated once the closed interval is stored;
    /// on error it is left as it was.
    ///
    /// # Errors
    ///
    /// - `StateError::TimeRangeInvalid` if `t` is earlier than a change
    ///   already applied
    /// - `StateError::IntervalTooLarge` if the store could never hold `value`
    /// - any error of [`IntervalStore::insert_past_state`]
    pub(crate) fn process_state_change(
        &mut self,
        t: Timestamp,
        value: StateValue,
        quark: Quark,
        store: &IntervalStore,
    ) -> Result<()> {
        let index = self.index(quark)?;
        self.check_time(t)?;

        if self.values[index] == value {
            self.latest_time = t;
            return Ok(());
        }

        let start = self.starts[index];
        if start > t {
            return Err(StateError::TimeRangeInvalid {
                time: t,
                start,
                end: Timestamp::MAX,
            });
        }
        store.check_value_fits(&value)?;
        if start < t {
            store.insert_past_state(start, t - 1, quark, self.values[index].clone())?;
        }
        self.values[index] = value;
        self.starts[index] = t;
        self.latest_time = t;
        Ok(())
    }

    /// Closes every ongoing interval at `end` and writes it to the store.
    pub(crate) fn close(&mut self, end: Timestamp, store: &IntervalStore) -> Result<()> {
        self.check_time(end)?;
        for index in 0..self.values.len() {
            let start = self.starts[index];
            if start > end {
                continue;
            }
            store.insert_past_state(start, end, index as Quark, self.values[index].clone())?;
            self.values[index] = StateValue::Null;
            self.starts[index] = end + 1;
        }
        self.latest_time = end;
        Ok(())
    }
}
