//! State system: attribute tree, interval store and ongoing state behind one
//! handle.
//!
//! A [`StateSystem`] is shared (`Arc`) between any number of readers. The
//! single writer is a separate, non-cloneable [`StateSystemWriter`] returned
//! alongside it, so only one builder can ever feed a given store.
//!
//! # Lock order
//!
//! Readers take the ongoing-state lock, then the attribute lock, then query
//! the store. The writer takes the ongoing-state lock before the attribute
//! lock and holds it while it inserts into the store, so a reader sees either
//! all or none of a state change.

use crate::attribute::AttributeTree;
use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, Timestamp, INVALID_ATTRIBUTE, ROOT_ATTRIBUTE};
use crate::store::{BackendKind, HistoryTreeBackend, IntervalStore};
use crate::transient::TransientState;
use crate::value::{StateValue, ValueType};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Deepest stack accepted by [`StateSystemWriter::push_attribute`].
pub const MAX_STACK_DEPTH: i32 = 100_000;

/// Construction status of a state system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// The writer is still producing intervals.
    Building,
    /// The history was closed; the state system is immutable.
    Completed,
    /// The build stopped early; data up to the current end stays queryable.
    Cancelled,
}

/// Queryable state history of one analysis.
pub struct StateSystem {
    ssid: String,
    attributes: RwLock<AttributeTree>,
    transient: RwLock<TransientState>,
    store: IntervalStore,
    current_end: AtomicI64,
    disposed: AtomicBool,
    status: Mutex<BuildStatus>,
    status_changed: Condvar,
}

impl std::fmt::Debug for StateSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSystem")
            .field("ssid", &self.ssid)
            .field("start_time", &self.start_time())
            .field("current_end_time", &self.current_end_time())
            .field("status", &self.status())
            .finish()
    }
}

impl StateSystem {
    /// Creates an empty state system starting at `start_time`, with the
    /// backend chosen by `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be created.
    pub fn new(
        ssid: impl Into<String>,
        start_time: Timestamp,
        backend: &BackendKind,
    ) -> Result<(Arc<Self>, StateSystemWriter)> {
        let ssid = ssid.into();
        let store = IntervalStore::new(backend.create(start_time)?);
        let ss = Arc::new(Self {
            attributes: RwLock::new(AttributeTree::new()),
            transient: RwLock::new(TransientState::new(start_time)),
            store,
            current_end: AtomicI64::new(start_time),
            disposed: AtomicBool::new(false),
            status: Mutex::new(BuildStatus::Building),
            status_changed: Condvar::new(),
            ssid,
        });
        debug!("State system {} created at {}", ss.ssid, start_time);
        let writer = StateSystemWriter {
            ss: Arc::clone(&ss),
            done: false,
        };
        Ok((ss, writer))
    }

    /// Opens a completed history file without replaying any event.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnsupportedVersion` if the file was built by
    /// another provider version, or any error reading the file.
    pub fn open(
        ssid: impl Into<String>,
        path: impl AsRef<Path>,
        provider_version: u32,
    ) -> Result<Arc<Self>> {
        let (backend, attributes) = HistoryTreeBackend::open(path, provider_version)?;
        let store = IntervalStore::new(Box::new(backend));
        let start = store.start_time();
        let end = store.end_time();
        let ssid = ssid.into();
        info!("State system {} reopened, range [{}, {}]", ssid, start, end);
        Ok(Arc::new(Self {
            ssid,
            transient: RwLock::new(TransientState::closed(start, attributes.len(), end)),
            attributes: RwLock::new(attributes),
            store,
            current_end: AtomicI64::new(end),
            disposed: AtomicBool::new(false),
            status: Mutex::new(BuildStatus::Completed),
            status_changed: Condvar::new(),
        }))
    }

    /// Identifier of the analysis owning this state system.
    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    /// Earliest time covered by the history.
    pub fn start_time(&self) -> Timestamp {
        self.store.start_time()
    }

    /// Latest time any state change was applied at.
    pub fn current_end_time(&self) -> Timestamp {
        self.current_end.load(Ordering::Acquire)
    }

    /// Current construction status.
    pub fn status(&self) -> BuildStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true if the build was cancelled before completion.
    pub fn is_cancelled(&self) -> bool {
        self.status() == BuildStatus::Cancelled
    }

    /// Returns true once the history was completely built.
    pub fn is_complete(&self) -> bool {
        self.status() == BuildStatus::Completed
    }

    /// Blocks until the build completed or was cancelled.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_until_built(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        while *status == BuildStatus::Building {
            status = match deadline {
                None => self
                    .status_changed
                    .wait(status)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.status_changed
                        .wait_timeout(status, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
        true
    }

    fn set_status(&self, new_status: BuildStatus) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == BuildStatus::Building {
            *status = new_status;
        }
        self.status_changed.notify_all();
    }

    /// Fails if the state system was disposed or its store is corrupted.
    pub fn check_usable(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StateError::StoreDisposed);
        }
        if self.store.is_corrupted() {
            return Err(StateError::StoreCorrupted);
        }
        Ok(())
    }

    fn read_attributes(&self) -> RwLockReadGuard<'_, AttributeTree> {
        self.attributes.read().unwrap_or_else(|e| e.into_inner())
    }

    // ----- attribute lookups -----

    /// Number of attributes created so far.
    pub fn num_attributes(&self) -> usize {
        self.read_attributes().len()
    }

    /// Resolves an absolute path without creating it.
    ///
    /// # Errors
    ///
    /// Returns `StateError::AttributeNotFound` if the path does not exist.
    pub fn get_quark_absolute(&self, path: &[&str]) -> Result<Quark> {
        self.get_quark_relative(ROOT_ATTRIBUTE, path)
    }

    /// Resolves `path` below `base` without creating it.
    pub fn get_quark_relative(&self, base: Quark, path: &[&str]) -> Result<Quark> {
        self.read_attributes()
            .get_quark(base, path)
            .ok_or_else(|| StateError::AttributeNotFound(path.join("/")))
    }

    /// Like [`get_quark_absolute`](Self::get_quark_absolute), returning
    /// `INVALID_ATTRIBUTE` instead of an error.
    pub fn opt_quark_absolute(&self, path: &[&str]) -> Quark {
        self.opt_quark_relative(ROOT_ATTRIBUTE, path)
    }

    /// Like [`get_quark_relative`](Self::get_quark_relative), returning
    /// `INVALID_ATTRIBUTE` instead of an error.
    pub fn opt_quark_relative(&self, base: Quark, path: &[&str]) -> Quark {
        self.read_attributes()
            .get_quark(base, path)
            .unwrap_or(INVALID_ATTRIBUTE)
    }

    /// Returns every quark matching an absolute pattern.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidPattern` for an empty pattern.
    pub fn get_quarks(&self, pattern: &[&str]) -> Result<Vec<Quark>> {
        self.get_quarks_relative(ROOT_ATTRIBUTE, pattern)
    }

    /// Returns every quark matching `pattern` below `base`.
    pub fn get_quarks_relative(&self, base: Quark, pattern: &[&str]) -> Result<Vec<Quark>> {
        self.read_attributes().get_quarks(base, pattern)
    }

    /// Returns the direct (or, if `recursive`, all) children of `quark`.
    pub fn get_sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        self.read_attributes().sub_attributes(quark, recursive)
    }

    /// Returns the last path segment of `quark`.
    pub fn get_attribute_name(&self, quark: Quark) -> Result<String> {
        Ok(self.read_attributes().name(quark)?.to_string())
    }

    /// Returns the full `/`-separated path of `quark`.
    pub fn get_full_attribute_path(&self, quark: Quark) -> Result<String> {
        self.read_attributes().full_path(quark)
    }

    /// Returns the parent of `quark`, `ROOT_ATTRIBUTE` for top-level ones.
    pub fn get_parent_attribute_quark(&self, quark: Quark) -> Result<Quark> {
        self.read_attributes().parent(quark)
    }

    // ----- queries -----

    fn check_time(&self, t: Timestamp) -> Result<()> {
        let (start, end) = (self.start_time(), self.current_end_time());
        if t < start || t > end {
            return Err(StateError::TimeRangeInvalid { time: t, start, end });
        }
        Ok(())
    }

    /// Returns the value `quark` currently holds in the writer's ongoing state.
    pub fn query_ongoing_state(&self, quark: Quark) -> Result<StateValue> {
        self.check_usable()?;
        let transient = self.transient.read().unwrap_or_else(|e| e.into_inner());
        Ok(transient.ongoing_value(quark)?.clone())
    }

    /// Returns the interval of `quark` covering `t`.
    ///
    /// # Errors
    ///
    /// - `StateError::TimeRangeInvalid` if `t` is outside
    ///   `[start_time, current_end_time]`
    /// - `StateError::AttributeNotFound` for an unknown quark
    /// - `StateError::StoreDisposed` after [`dispose`](Self::dispose)
    pub fn query_single_state(&self, t: Timestamp, quark: Quark) -> Result<StateInterval> {
        self.check_usable()?;
        let transient = self.transient.read().unwrap_or_else(|e| e.into_inner());
        self.check_time(t)?;
        let ongoing_start = transient.ongoing_start(quark)?;
        if t >= ongoing_start {
            return transient.ongoing_interval(quark, self.current_end_time());
        }
        self.store.query(t, quark)?.ok_or_else(|| {
            warn!("No stored interval for quark {} at {}", quark, t);
            StateError::StoreCorrupted
        })
    }

    /// Returns the interval of every attribute covering `t`, indexed by quark.
    ///
    /// Attributes created after the query started are not included.
    pub fn query_full_state(&self, t: Timestamp) -> Result<Vec<StateInterval>> {
        self.check_usable()?;
        let transient = self.transient.read().unwrap_or_else(|e| e.into_inner());
        self.check_time(t)?;
        let quarks = self.read_attributes().len().min(transient.len());

        let mut states: Vec<Option<StateInterval>> = vec![None; quarks];
        if t <= self.store.end_time() {
            self.store.query_full(t, &mut states)?;
        }
        let current_end = self.current_end_time();
        for (quark, slot) in states.iter_mut().enumerate() {
            let quark = quark as Quark;
            if t >= transient.ongoing_start(quark)? {
                *slot = Some(transient.ongoing_interval(quark, current_end)?);
            }
        }

        states
            .into_iter()
            .enumerate()
            .map(|(quark, slot)| {
                slot.ok_or_else(|| {
                    warn!("No interval for quark {} at {} in full query", quark, t);
                    StateError::StoreCorrupted
                })
            })
            .collect()
    }

    /// Releases the store. Every later query fails with
    /// `StateError::StoreDisposed`.
    ///
    /// The writer must have stopped before disposal.
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.set_status(BuildStatus::Cancelled);
        let _transient = self.transient.write().unwrap_or_else(|e| e.into_inner());
        info!("State system {} disposed", self.ssid);
        self.store.dispose()
    }
}

/// The single writer of a [`StateSystem`].
///
/// Dropping the writer without calling
/// [`close_history`](Self::close_history) marks the build cancelled.
pub struct StateSystemWriter {
    ss: Arc<StateSystem>,
    done: bool,
}

impl std::fmt::Debug for StateSystemWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSystemWriter")
            .field("ssid", &self.ss.ssid)
            .finish()
    }
}

impl StateSystemWriter {
    /// The state system this writer feeds.
    pub fn state_system(&self) -> &Arc<StateSystem> {
        &self.ss
    }

    /// Resolves an absolute path, creating missing attributes.
    pub fn get_quark_absolute_and_add(&self, path: &[&str]) -> Result<Quark> {
        self.get_quark_relative_and_add(ROOT_ATTRIBUTE, path)
    }

    /// Resolves `path` below `base`, creating missing attributes.
    pub fn get_quark_relative_and_add(&self, base: Quark, path: &[&str]) -> Result<Quark> {
        if let Some(quark) = self.ss.read_attributes().get_quark(base, path) {
            return Ok(quark);
        }
        self.ss.check_usable()?;
        let mut transient = self.ss.transient.write().unwrap_or_else(|e| e.into_inner());
        let mut attributes = self.ss.attributes.write().unwrap_or_else(|e| e.into_inner());
        let quark = attributes.get_or_add(base, path)?;
        transient.grow_to(attributes.len());
        Ok(quark)
    }

    fn publish_end(&self, t: Timestamp) {
        self.ss.current_end.fetch_max(t, Ordering::AcqRel);
    }

    /// Sets `quark` to `value` from time `t` on.
    ///
    /// # Errors
    ///
    /// - `StateError::TimeRangeInvalid` if `t` precedes an earlier change
    /// - `StateError::ContiguityViolation` if the store rejected the closed
    ///   interval; the store is corrupted afterwards
    pub fn modify_attribute(&self, t: Timestamp, value: StateValue, quark: Quark) -> Result<()> {
        self.ss.check_usable()?;
        let mut transient = self.ss.transient.write().unwrap_or_else(|e| e.into_inner());
        transient.process_state_change(t, value, quark, &self.ss.store)?;
        self.publish_end(t);
        Ok(())
    }

    /// Adds one to the counter held by `quark`. A null value counts as zero.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StateValueTypeMismatch` if the attribute holds
    /// something other than an integer or a long.
    pub fn increment_attribute(&self, t: Timestamp, quark: Quark) -> Result<()> {
        let next = match self.ss.query_ongoing_state(quark)? {
            StateValue::Null => StateValue::Int(1),
            StateValue::Int(v) => StateValue::Int(v.wrapping_add(1)),
            StateValue::Long(v) => StateValue::Long(v.wrapping_add(1)),
            other => {
                return Err(StateError::StateValueTypeMismatch {
                    expected: ValueType::Int,
                    actual: other.value_type(),
                })
            }
        };
        self.modify_attribute(t, next, quark)
    }

    fn stack_depth(&self, quark: Quark) -> Result<i32> {
        match self.ss.query_ongoing_state(quark)? {
            StateValue::Null => Ok(0),
            StateValue::Int(depth) => Ok(depth),
            other => Err(StateError::StateValueTypeMismatch {
                expected: ValueType::Int,
                actual: other.value_type(),
            }),
        }
    }

    /// Pushes `value` on the stack held by `quark`.
    ///
    /// The attribute holds the stack depth; the elements are its children
    /// named `1`, `2`, ... from the bottom.
    pub fn push_attribute(&self, t: Timestamp, value: StateValue, quark: Quark) -> Result<()> {
        self.ss.store.check_value_fits(&value)?;
        let depth = self.stack_depth(quark)?;
        if depth >= MAX_STACK_DEPTH {
            return Err(StateError::InvalidArgument(format!(
                "stack on quark {} exceeds {} elements",
                quark, MAX_STACK_DEPTH
            )));
        }
        let depth = depth + 1;
        let name = depth.to_string();
        let element = self.get_quark_relative_and_add(quark, &[name.as_str()])?;
        self.modify_attribute(t, StateValue::Int(depth), quark)?;
        self.modify_attribute(t, value, element)
    }

    /// Pops the top of the stack held by `quark`, returning it.
    ///
    /// Returns `Ok(None)` for an empty stack.
    pub fn pop_attribute(&self, t: Timestamp, quark: Quark) -> Result<Option<StateValue>> {
        let depth = self.stack_depth(quark)?;
        if depth <= 0 {
            return Ok(None);
        }
        let name = depth.to_string();
        let element = self.get_quark_relative_and_add(quark, &[name.as_str()])?;
        let popped = self.ss.query_ongoing_state(element)?;
        let remaining = if depth == 1 {
            StateValue::Null
        } else {
            StateValue::Int(depth - 1)
        };
        self.modify_attribute(t, remaining, quark)?;
        self.remove_attribute(t, element)?;
        Ok(Some(popped))
    }

    /// Nulls `quark` and every attribute below it from time `t` on.
    pub fn remove_attribute(&self, t: Timestamp, quark: Quark) -> Result<()> {
        let children = self.ss.get_sub_attributes(quark, true)?;
        for child in children {
            self.modify_attribute(t, StateValue::Null, child)?;
        }
        self.modify_attribute(t, StateValue::Null, quark)
    }

    /// Replaces the ongoing value of `quark` without closing an interval.
    pub fn update_ongoing_state(&self, value: StateValue, quark: Quark) -> Result<()> {
        self.ss.check_usable()?;
        self.ss.store.check_value_fits(&value)?;
        let mut transient = self.ss.transient.write().unwrap_or_else(|e| e.into_inner());
        transient.set_ongoing(quark, value)
    }

    /// Time of the latest applied change.
    pub fn latest_time(&self) -> Timestamp {
        self.ss
            .transient
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .latest_time()
    }

    /// Closes every ongoing interval at `end_time` and marks the history
    /// complete.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TimeRangeInvalid` if `end_time` precedes the
    /// latest change. The build is marked cancelled on any error.
    pub fn close_history(mut self, end_time: Timestamp) -> Result<()> {
        self.ss.check_usable()?;
        {
            let mut transient = self.ss.transient.write().unwrap_or_else(|e| e.into_inner());
            transient.close(end_time, &self.ss.store)?;
            let attributes = self.ss.read_attributes();
            self.ss.store.finished_building(end_time, &attributes)?;
            self.publish_end(end_time);
        }
        self.done = true;
        self.ss.set_status(BuildStatus::Completed);
        info!(
            "State system {} completed, range [{}, {}]",
            self.ss.ssid,
            self.ss.start_time(),
            end_time
        );
        Ok(())
    }

    /// Stops the build. Data up to the current end time stays queryable.
    pub fn cancel(mut self) {
        self.mark_cancelled();
    }

    fn mark_cancelled(&mut self) {
        if !self.done {
            self.done = true;
            self.ss.set_status(BuildStatus::Cancelled);
            info!("State system {} build cancelled", self.ss.ssid);
        }
    }
}

impl Drop for StateSystemWriter {
    fn drop(&mut self) {
        self.mark_cancelled();
    }
}
