//! Query engine: algorithms layered on a [`StateSystem`].
//!
//! Point and full-state lookups live on [`StateSystem`] itself and fail with
//! `TimeRangeInvalid` outside the store bounds. The range and aggregation
//! helpers here clamp their time arguments to
//! `[start_time, current_end_time]` instead, since they are driven by
//! viewer ranges that routinely overshoot the history.

use crate::cancel::CancellationToken;
use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, Timestamp};
use crate::state_system::StateSystem;
use crate::value::{StateValue, ValueType};

/// Size of a disk sector.
pub const BYTES_PER_SECTOR: f64 = 512.0;

/// Nanoseconds in a second.
pub const NANOS_PER_SECOND: f64 = 1e9;

/// Converts a sector count delta per nanosecond into bytes per second.
pub const DISK_THROUGHPUT_SCALE: f64 = BYTES_PER_SECTOR * NANOS_PER_SECOND;

/// Clamps `t` to `[start_time, current_end_time]`.
pub fn clamp_to_bounds(ss: &StateSystem, t: Timestamp) -> Timestamp {
    let start = ss.start_time();
    t.clamp(start, ss.current_end_time().max(start))
}

/// Returns the first interval of `quark` in `[start, end]` holding a
/// non-null value, scanning forward.
pub fn query_until_non_null_value(
    ss: &StateSystem,
    quark: Quark,
    start: Timestamp,
    end: Timestamp,
) -> Result<Option<StateInterval>> {
    ss.check_usable()?;
    let (start, end) = (clamp_to_bounds(ss, start), clamp_to_bounds(ss, end));
    let mut t = start;
    while t <= end {
        let interval = ss.query_single_state(t, quark)?;
        if !interval.value().is_null() {
            return Ok(Some(interval));
        }
        if interval.end() >= end {
            break;
        }
        t = interval.end() + 1;
    }
    Ok(None)
}

/// Returns every interval of `quark` intersecting `[t1, t2]`, in time order.
///
/// # Errors
///
/// Returns `StateError::InvalidArgument` if `t1 > t2`.
pub fn query_history_range(
    ss: &StateSystem,
    quark: Quark,
    t1: Timestamp,
    t2: Timestamp,
) -> Result<Vec<StateInterval>> {
    ss.check_usable()?;
    if t1 > t2 {
        return Err(StateError::InvalidArgument(format!(
            "reversed range [{}, {}]",
            t1, t2
        )));
    }
    let (start, end) = (clamp_to_bounds(ss, t1), clamp_to_bounds(ss, t2));
    let mut intervals = Vec::new();
    let mut t = start;
    loop {
        let interval = ss.query_single_state(t, quark)?;
        let next = interval.end().saturating_add(1);
        let last = interval.end() >= end;
        intervals.push(interval);
        if last {
            return Ok(intervals);
        }
        t = next;
    }
}

/// Reads a counter value: null counts as zero, integers are widened.
///
/// # Errors
///
/// Returns `StateError::StateValueTypeMismatch` for doubles and strings.
pub fn counter_value(value: &StateValue) -> Result<i64> {
    match value {
        StateValue::Null => Ok(0),
        StateValue::Int(v) => Ok(*v as i64),
        StateValue::Long(v) => Ok(*v),
        other => Err(StateError::StateValueTypeMismatch {
            expected: ValueType::Long,
            actual: other.value_type(),
        }),
    }
}

/// Value of the counter `quark` at `t`, clamped to the history bounds.
pub fn counter_at(ss: &StateSystem, quark: Quark, t: Timestamp) -> Result<i64> {
    let t = clamp_to_bounds(ss, t);
    counter_value(ss.query_single_state(t, quark)?.value())
}

/// Splits `[start, end]` into `nb` buckets and returns how much the counter
/// `quark` grew in each.
///
/// Bucket borders are `start + i * ((end - start) / nb)`; the last bucket is
/// stretched to `end`. Each bucket is the counter difference between its two
/// borders, so the buckets add up to `counter_at(end) - counter_at(start)`.
///
/// # Errors
///
/// - `StateError::InvalidArgument` if `nb` is zero, `start > end`, or the
///   range is too wide to split
/// - `StateError::Cancelled` if `token` fires; no partial result is returned
pub fn histogram_query(
    ss: &StateSystem,
    quark: Quark,
    start: Timestamp,
    end: Timestamp,
    nb: usize,
    token: &CancellationToken,
) -> Result<Vec<i64>> {
    ss.check_usable()?;
    if nb == 0 || start > end {
        return Err(StateError::InvalidArgument(format!(
            "{} buckets over [{}, {}]",
            nb, start, end
        )));
    }
    let span = end.checked_sub(start).ok_or_else(|| {
        StateError::InvalidArgument(format!("range [{}, {}] is too wide", start, end))
    })?;
    let increment = span / nb as i64;

    let mut prev = counter_at(ss, quark, start)?;
    let mut buckets = Vec::with_capacity(nb);
    let mut border = start;
    for _ in 0..nb - 1 {
        token.check()?;
        border += increment;
        let current = counter_at(ss, quark, border)?;
        buckets.push(current - prev);
        prev = current;
    }
    token.check()?;
    buckets.push(counter_at(ss, quark, end)? - prev);
    Ok(buckets)
}

/// Counter growth over `[start, end]`, including changes at `start` itself.
pub fn events_in_range(
    ss: &StateSystem,
    quark: Quark,
    start: Timestamp,
    end: Timestamp,
) -> Result<i64> {
    ss.check_usable()?;
    let start_count = if start <= ss.start_time() {
        0
    } else {
        counter_at(ss, quark, start - 1)?
    };
    Ok(counter_at(ss, quark, end)? - start_count)
}

/// Rate series of one counter attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSeries {
    /// Counter attribute.
    pub quark: Quark,
    /// One rate per requested time; the first is always zero.
    pub values: Vec<f64>,
}

fn counter_in(states: &[StateInterval], quark: Quark) -> Result<i64> {
    match states.get(quark as usize) {
        Some(interval) if quark >= 0 => counter_value(interval.value()),
        _ => Ok(0),
    }
}

/// Samples the rate of every counter in `quarks` at each of `times`.
///
/// The rate at `times[i]` is `(count(times[i]) - count(times[i-1])) *
/// unit_scale / (times[i] - times[i-1])`, a linear interpolation between two
/// consecutive samples. Each sample time costs one full-state query. Samples
/// past the current end of the history stay zero; samples before its start
/// are skipped.
///
/// # Errors
///
/// Returns `StateError::Cancelled` if `token` fires between samples.
pub fn counter_rates(
    ss: &StateSystem,
    quarks: &[Quark],
    times: &[Timestamp],
    unit_scale: f64,
    token: &CancellationToken,
) -> Result<Vec<CounterSeries>> {
    ss.check_usable()?;
    let mut series: Vec<CounterSeries> = quarks
        .iter()
        .map(|&quark| CounterSeries {
            quark,
            values: vec![0.0; times.len()],
        })
        .collect();
    let Some((&first, rest)) = times.split_first() else {
        return Ok(series);
    };

    let (start, current_end) = (ss.start_time(), ss.current_end_time());
    let mut prev_counts = vec![0i64; quarks.len()];
    if first >= start && first <= current_end {
        let states = ss.query_full_state(first)?;
        for (prev, &quark) in prev_counts.iter_mut().zip(quarks) {
            *prev = counter_in(&states, quark)?;
        }
    }

    let mut prev_time = first;
    for (offset, &time) in rest.iter().enumerate() {
        token.check()?;
        if time > current_end {
            break;
        }
        if time >= start {
            let states = ss.query_full_state(time)?;
            let dt = time - prev_time;
            for ((entry, prev), &quark) in series.iter_mut().zip(&mut prev_counts).zip(quarks) {
                let count = counter_in(&states, quark)?;
                if dt > 0 {
                    entry.values[offset + 1] = (count - *prev) as f64 * unit_scale / dt as f64;
                }
                *prev = count;
            }
        }
        prev_time = time;
    }
    Ok(series)
}
