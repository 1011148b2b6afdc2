//! History builder: turns an ordered event stream into intervals.
//!
//! Event payloads are interpreted by an [`EventDecoder`]; the builder only
//! applies the resulting [`StateChange`]s through the state system's single
//! writer. A change that fails for a per-event reason (unknown value type,
//! timestamp going backwards) is logged and skipped. A failure that touches
//! the integrity of the store aborts the build.

use crate::cancel::CancellationToken;
use crate::error::{Result, StateError};
use crate::interval::Timestamp;
use crate::state_system::{BuildStatus, StateSystemWriter};
use crate::value::StateValue;
use tracing::{debug, error, info, warn};

/// Kind of update applied to an attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    /// Set the attribute to a value.
    Set(StateValue),
    /// Add one to a counter attribute.
    Increment,
    /// Push a value on a stack attribute.
    Push(StateValue),
    /// Pop the top of a stack attribute.
    Pop,
    /// Null the attribute and its whole subtree.
    Remove,
}

/// One attribute update produced by a decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// Absolute attribute path, one segment per element.
    pub path: Vec<String>,
    /// Time the change takes effect.
    pub timestamp: Timestamp,
    /// What happens to the attribute.
    pub kind: ChangeKind,
}

impl StateChange {
    fn new(path: &[&str], timestamp: Timestamp, kind: ChangeKind) -> Self {
        Self {
            path: path.iter().map(|segment| segment.to_string()).collect(),
            timestamp,
            kind,
        }
    }

    /// Sets `path` to `value` at `timestamp`.
    pub fn set(path: &[&str], timestamp: Timestamp, value: impl Into<StateValue>) -> Self {
        Self::new(path, timestamp, ChangeKind::Set(value.into()))
    }

    /// Increments the counter at `path`.
    pub fn increment(path: &[&str], timestamp: Timestamp) -> Self {
        Self::new(path, timestamp, ChangeKind::Increment)
    }

    /// Pushes `value` on the stack at `path`.
    pub fn push(path: &[&str], timestamp: Timestamp, value: impl Into<StateValue>) -> Self {
        Self::new(path, timestamp, ChangeKind::Push(value.into()))
    }

    /// Pops the stack at `path`.
    pub fn pop(path: &[&str], timestamp: Timestamp) -> Self {
        Self::new(path, timestamp, ChangeKind::Pop)
    }

    /// Nulls `path` and everything below it.
    pub fn remove(path: &[&str], timestamp: Timestamp) -> Self {
        Self::new(path, timestamp, ChangeKind::Remove)
    }
}

/// Domain-specific translation from raw events to attribute changes.
pub trait EventDecoder: Send {
    /// Raw event type.
    type Event;

    /// Version of the decoding logic. A stored history is only reused if it
    /// was built by the same version.
    fn version(&self) -> u32 {
        0
    }

    /// Returns the attribute changes caused by `event`, in time order.
    ///
    /// # Errors
    ///
    /// An error skips this event only.
    fn decode(&mut self, event: &Self::Event) -> Result<Vec<StateChange>>;
}

/// Counters collected while building.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Events read from the stream.
    pub events: u64,
    /// Changes applied to the state system.
    pub changes: u64,
    /// Events or changes skipped because of a recoverable error.
    pub skipped: u64,
}

/// Result of a build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Final status of the state system.
    pub status: BuildStatus,
    /// End time the history reached.
    pub end_time: Timestamp,
    /// Build counters.
    pub stats: BuildStats,
}

/// Single writer feeding one state system from an event stream.
pub struct HistoryBuilder<D: EventDecoder> {
    decoder: D,
    writer: StateSystemWriter,
    token: CancellationToken,
    stats: BuildStats,
}

impl<D: EventDecoder> HistoryBuilder<D> {
    /// Creates a builder; `token` is polled between events.
    pub fn new(decoder: D, writer: StateSystemWriter, token: CancellationToken) -> Self {
        Self {
            decoder,
            writer,
            token,
            stats: BuildStats::default(),
        }
    }

    fn apply(&mut self, change: StateChange) -> Result<()> {
        let path: Vec<&str> = change.path.iter().map(String::as_str).collect();
        let quark = self.writer.get_quark_absolute_and_add(&path)?;
        let t = change.timestamp;
        match change.kind {
            ChangeKind::Set(value) => self.writer.modify_attribute(t, value, quark),
            ChangeKind::Increment => self.writer.increment_attribute(t, quark),
            ChangeKind::Push(value) => self.writer.push_attribute(t, value, quark),
            ChangeKind::Pop => self.writer.pop_attribute(t, quark).map(|_| ()),
            ChangeKind::Remove => self.writer.remove_attribute(t, quark),
        }
    }

    fn cancelled(self) -> BuildOutcome {
        let end_time = self.writer.latest_time();
        let stats = self.stats;
        info!(
            "Build of {} cancelled after {} events",
            self.writer.state_system().ssid(),
            stats.events
        );
        self.writer.cancel();
        BuildOutcome {
            status: BuildStatus::Cancelled,
            end_time,
            stats,
        }
    }

    /// Consumes `events` and closes the history at the last applied
    /// timestamp (the start time for an empty stream).
    ///
    /// Returns a `Cancelled` outcome if the token fired between two events.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error; the state system is then marked
    /// cancelled and keeps the data written so far.
    pub fn run<I>(mut self, events: I) -> Result<BuildOutcome>
    where
        I: IntoIterator<Item = D::Event>,
    {
        let ssid = self.writer.state_system().ssid().to_string();
        debug!("Build of {} started", ssid);

        for event in events {
            if self.token.is_cancelled() {
                return Ok(self.cancelled());
            }
            self.stats.events += 1;

            let changes = match self.decoder.decode(&event) {
                Ok(changes) => changes,
                Err(e) => {
                    warn!("Skipping undecodable event in {}: {}", ssid, e);
                    self.stats.skipped += 1;
                    continue;
                }
            };

            for change in changes {
                match self.apply(change) {
                    Ok(()) => self.stats.changes += 1,
                    Err(e) if e.is_fatal() => {
                        error!("Build of {} aborted: {}", ssid, e);
                        return Err(e);
                    }
                    Err(e) => {
                        warn!("Skipping state change in {}: {}", ssid, e);
                        self.stats.skipped += 1;
                    }
                }
            }
        }

        if self.token.is_cancelled() {
            return Ok(self.cancelled());
        }

        let end_time = self.writer.latest_time();
        let stats = self.stats;
        self.writer.close_history(end_time)?;
        info!(
            "Build of {} finished at {}: {} events, {} changes, {} skipped",
            ssid, end_time, stats.events, stats.changes, stats.skipped
        );
        Ok(BuildOutcome {
            status: BuildStatus::Completed,
            end_time,
            stats,
        })
    }
}

/// Decoder for streams that already consist of state changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDecoder;

impl EventDecoder for PassthroughDecoder {
    type Event = StateChange;

    fn decode(&mut self, event: &StateChange) -> Result<Vec<StateChange>> {
        if event.path.is_empty() {
            return Err(StateError::Decode("state change without a path".to_string()));
        }
        Ok(vec![event.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_system::StateSystem;
    use crate::store::BackendKind;

    fn build(events: Vec<StateChange>) -> (std::sync::Arc<StateSystem>, Result<BuildOutcome>) {
        let (ss, writer) = StateSystem::new("test", 0, &BackendKind::InMemory).unwrap();
        let builder = HistoryBuilder::new(PassthroughDecoder, writer, CancellationToken::new());
        (ss, builder.run(events))
    }

    #[test]
    fn test_build_closes_history_at_last_timestamp() {
        let (ss, outcome) = build(vec![
            StateChange::set(&["A"], 0, 1),
            StateChange::set(&["A"], 10, 2),
            StateChange::increment(&["count"], 15),
            StateChange::set(&["A"], 20, 3),
        ]);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, BuildStatus::Completed);
        assert_eq!(outcome.end_time, 20);
        assert_eq!(outcome.stats.changes, 4);
        assert!(ss.is_complete());

        let a = ss.get_quark_absolute(&["A"]).unwrap();
        assert_eq!(ss.query_single_state(15, a).unwrap().value(), &StateValue::Int(2));
    }

    #[test]
    fn test_recoverable_errors_are_skipped() {
        let (ss, outcome) = build(vec![
            StateChange::set(&["A"], 10, 1),
            StateChange::set(&["A"], 5, 2),
            StateChange::set(&["name"], 12, "x"),
            StateChange::increment(&["name"], 13),
            StateChange {
                path: Vec::new(),
                timestamp: 14,
                kind: ChangeKind::Pop,
            },
            StateChange::set(&["A"], 20, 3),
        ]);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.stats.events, 6);
        assert_eq!(outcome.stats.changes, 3);
        assert_eq!(outcome.stats.skipped, 3);
        assert!(ss.is_complete());
    }

    #[test]
    fn test_empty_stream_closes_at_start() {
        let (ss, outcome) = build(Vec::new());
        let outcome = outcome.unwrap();
        assert_eq!(outcome.end_time, 0);
        assert!(ss.is_complete());
        assert!(ss.query_full_state(0).unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_before_start() {
        let (ss, writer) = StateSystem::new("test", 0, &BackendKind::InMemory).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = HistoryBuilder::new(PassthroughDecoder, writer, token)
            .run(vec![StateChange::set(&["A"], 1, 1)])
            .unwrap();
        assert_eq!(outcome.status, BuildStatus::Cancelled);
        assert_eq!(outcome.stats.events, 0);
        assert!(ss.is_cancelled());
    }
}
