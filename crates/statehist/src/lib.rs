//! Statehist - State History Store
//!
//! Replays an ordered event stream into a queryable history of attribute
//! values: for every attribute and every instant of the history, exactly one
//! closed interval tells which value the attribute held.
//!
//! # Components
//!
//! - [`AttributeTree`]: hierarchical namespace mapping paths to quarks
//! - [`IntervalStore`]: contiguity-checked store over a [`HistoryBackend`]
//!   ([`InMemoryBackend`] or the on-disk [`HistoryTreeBackend`])
//! - [`StateSystem`] / [`StateSystemWriter`]: query façade and single writer
//! - [`HistoryBuilder`]: drives the writer from an [`EventDecoder`]
//! - [`query`]: range scans, histograms and counter rates
//! - [`AnalysisModule`] / [`TraceAnalyses`]: per-trace ownership of state
//!   systems built on background threads
//!
//! # Example
//!
//! ```rust
//! use statehist::{BackendKind, StateSystem, StateValue};
//!
//! let (ss, writer) = StateSystem::new("example", 0, &BackendKind::InMemory)?;
//! let a = writer.get_quark_absolute_and_add(&["A"])?;
//! writer.modify_attribute(0, StateValue::Int(1), a)?;
//! writer.modify_attribute(10, StateValue::Int(2), a)?;
//! writer.close_history(19)?;
//!
//! let interval = ss.query_single_state(15, a)?;
//! assert_eq!(interval.value(), &StateValue::Int(2));
//! assert_eq!((interval.start(), interval.end()), (10, 19));
//! # Ok::<(), statehist::StateError>(())
//! ```

#![deny(missing_docs)]

pub mod analysis;
pub mod attribute;
pub mod builder;
pub mod cancel;
pub mod error;
pub mod interval;
pub mod query;
pub mod state_system;
pub mod store;
pub mod value;

mod transient;

pub use analysis::{AnalysisModule, TraceAnalyses};
pub use attribute::AttributeTree;
pub use builder::{
    BuildOutcome, BuildStats, ChangeKind, EventDecoder, HistoryBuilder, PassthroughDecoder,
    StateChange,
};
pub use cancel::CancellationToken;
pub use error::{Result, StateError};
pub use interval::{Quark, StateInterval, Timestamp, INVALID_ATTRIBUTE, ROOT_ATTRIBUTE};
pub use state_system::{BuildStatus, StateSystem, StateSystemWriter};
pub use store::{
    BackendKind, HistoryBackend, HistoryTreeBackend, HistoryTreeConfig, InMemoryBackend,
    IntervalStore,
};
pub use value::{StateValue, ValueType};
