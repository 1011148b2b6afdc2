//! Analysis modules: ownership of one state system and its builder thread.
//!
//! A trace owns a [`TraceAnalyses`] map from analysis id to
//! [`AnalysisModule`]. Each module builds (or reopens) exactly one state
//! system; nothing is registered globally.

use crate::builder::{BuildOutcome, EventDecoder, HistoryBuilder};
use crate::cancel::CancellationToken;
use crate::error::{Result, StateError};
use crate::interval::Timestamp;
use crate::state_system::StateSystem;
use crate::store::BackendKind;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct ModuleState {
    scheduled: bool,
    initialized: bool,
    state_system: Option<Arc<StateSystem>>,
}

/// One analysis: a state system and the builder feeding it.
#[derive(Debug)]
pub struct AnalysisModule {
    id: String,
    backend: BackendKind,
    start_time: Timestamp,
    token: CancellationToken,
    state: Mutex<ModuleState>,
    initialized: Condvar,
    worker: Mutex<Option<JoinHandle<Result<BuildOutcome>>>>,
}

impl AnalysisModule {
    /// Creates an analysis whose history starts at `start_time`.
    pub fn new(id: impl Into<String>, backend: BackendKind, start_time: Timestamp) -> Self {
        Self {
            id: id.into(),
            backend,
            start_time,
            token: CancellationToken::new(),
            state: Mutex::new(ModuleState::default()),
            initialized: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    /// Analysis id.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn set_initialized(&self, state_system: Option<Arc<StateSystem>>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.initialized = true;
        state.state_system = state_system;
        self.initialized.notify_all();
    }

    /// Starts building the state system from `events` on a dedicated thread.
    ///
    /// A finished history file built by the same decoder version is reopened
    /// instead, without reading any event. Scheduling twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the state system or the thread cannot be created.
    pub fn schedule<D, I>(&self, decoder: D, events: I) -> Result<()>
    where
        D: EventDecoder + 'static,
        I: IntoIterator<Item = D::Event> + Send + 'static,
    {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.scheduled {
                return Ok(());
            }
            state.scheduled = true;
        }

        let version = decoder.version();
        let backend = match &self.backend {
            BackendKind::HistoryTree { path, config } => {
                if path.exists() {
                    match StateSystem::open(self.id.as_str(), path, version) {
                        Ok(ss) => {
                            info!("Analysis {} reusing history {}", self.id, path.display());
                            self.set_initialized(Some(ss));
                            return Ok(());
                        }
                        Err(e) => warn!(
                            "Analysis {} rebuilding history {}: {}",
                            self.id,
                            path.display(),
                            e
                        ),
                    }
                }
                BackendKind::HistoryTree {
                    path: path.clone(),
                    config: config.clone().with_provider_version(version),
                }
            }
            BackendKind::InMemory => BackendKind::InMemory,
        };

        let (ss, writer) = match StateSystem::new(self.id.as_str(), self.start_time, &backend) {
            Ok(created) => created,
            Err(e) => {
                self.set_initialized(None);
                return Err(e);
            }
        };
        self.set_initialized(Some(ss));

        let builder = HistoryBuilder::new(decoder, writer, self.token.clone());
        let id = self.id.clone();
        let handle = thread::Builder::new()
            .name(format!("statehist-{}", self.id))
            .spawn(move || {
                let outcome = builder.run(events);
                if let Err(e) = &outcome {
                    error!("Analysis {} failed: {}", id, e);
                }
                outcome
            })?;
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        debug!("Analysis {} scheduled", self.id);
        Ok(())
    }

    /// Blocks until the state system exists, returning false if it could not
    /// be created.
    pub fn wait_for_initialization(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !state.initialized {
            state = self
                .initialized
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.state_system.is_some()
    }

    /// Blocks until the build ended; returns true if it completed.
    pub fn wait_for_completion(&self) -> bool {
        if !self.wait_for_initialization() {
            return false;
        }
        match self.state_system() {
            Some(ss) => ss.wait_until_built(None) && ss.is_complete(),
            None => false,
        }
    }

    /// The state system, once initialized.
    pub fn state_system(&self) -> Option<Arc<StateSystem>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state_system
            .clone()
    }

    /// Asks the builder to stop after the current event.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    fn join_worker(&self) -> Option<Result<BuildOutcome>> {
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        match handle.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                error!("Analysis {} builder thread panicked", self.id);
                Some(Err(StateError::Cancelled))
            }
        }
    }

    /// Waits for the builder thread and returns its outcome, if one ran and
    /// was not joined yet.
    pub fn join(&self) -> Option<Result<BuildOutcome>> {
        self.join_worker()
    }

    /// Cancels the build, waits for the builder and disposes the state system.
    pub fn dispose(&self) -> Result<()> {
        self.cancel();
        self.join_worker();
        let ss = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state_system
            .take();
        match ss {
            Some(ss) => ss.dispose(),
            None => Ok(()),
        }
    }
}

impl Drop for AnalysisModule {
    fn drop(&mut self) {
        self.cancel();
        self.join_worker();
    }
}

/// The analyses of one trace, keyed by id.
#[derive(Debug, Default)]
pub struct TraceAnalyses {
    modules: HashMap<String, AnalysisModule>,
}

impl TraceAnalyses {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidArgument` if the id is already taken.
    pub fn add(&mut self, module: AnalysisModule) -> Result<()> {
        if self.modules.contains_key(module.id()) {
            return Err(StateError::InvalidArgument(format!(
                "analysis {} already exists",
                module.id()
            )));
        }
        self.modules.insert(module.id().to_string(), module);
        Ok(())
    }

    /// Returns the module with `id`.
    pub fn get(&self, id: &str) -> Option<&AnalysisModule> {
        self.modules.get(id)
    }

    /// Removes the module with `id` without disposing it.
    pub fn remove(&mut self, id: &str) -> Option<AnalysisModule> {
        self.modules.remove(id)
    }

    /// Ids of all modules, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns true if there is no module.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Disposes and removes every module, returning the first error.
    pub fn dispose_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for (id, module) in self.modules.drain() {
            if let Err(e) = module.dispose() {
                warn!("Failed to dispose analysis {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{PassthroughDecoder, StateChange};
    use crate::value::StateValue;

    fn events() -> Vec<StateChange> {
        (0..100)
            .map(|i| StateChange::set(&["cpu", "0"], i * 10, i as i32 % 3))
            .collect()
    }

    #[test]
    fn test_schedule_and_complete() {
        let module = AnalysisModule::new("cpu", BackendKind::InMemory, 0);
        module.schedule(PassthroughDecoder, events()).unwrap();
        assert!(module.wait_for_initialization());
        assert!(module.wait_for_completion());

        let ss = module.state_system().unwrap();
        let cpu = ss.get_quark_absolute(&["cpu", "0"]).unwrap();
        assert_eq!(ss.current_end_time(), 990);
        assert_eq!(ss.query_single_state(505, cpu).unwrap().value(), &StateValue::Int(2));
        let outcome = module.join().unwrap().unwrap();
        assert_eq!(outcome.stats.events, 100);
    }

    #[test]
    fn test_schedule_twice_is_noop() {
        let module = AnalysisModule::new("cpu", BackendKind::InMemory, 0);
        module.schedule(PassthroughDecoder, events()).unwrap();
        module.schedule(PassthroughDecoder, Vec::new()).unwrap();
        assert!(module.wait_for_completion());
        assert_eq!(module.state_system().unwrap().current_end_time(), 990);
    }

    #[test]
    fn test_trace_analyses_ownership() {
        let mut analyses = TraceAnalyses::new();
        analyses
            .add(AnalysisModule::new("b", BackendKind::InMemory, 0))
            .unwrap();
        analyses
            .add(AnalysisModule::new("a", BackendKind::InMemory, 0))
            .unwrap();
        assert!(analyses
            .add(AnalysisModule::new("a", BackendKind::InMemory, 0))
            .is_err());
        assert_eq!(analyses.ids(), vec!["a", "b"]);

        analyses
            .get("a")
            .unwrap()
            .schedule(PassthroughDecoder, events())
            .unwrap();
        let ss = {
            let module = analyses.get("a").unwrap();
            module.wait_for_completion();
            module.state_system().unwrap()
        };
        analyses.dispose_all().unwrap();
        assert!(analyses.is_empty());
        assert!(matches!(
            ss.query_full_state(0),
            Err(StateError::StoreDisposed)
        ));
    }
}
