//! `analytic-core`: trigger orchestration for analytics.
//!
//! Analytics are declared in a [`Registry`]. A [`Reconciler`] polls it, arms
//! the triggers of every active analytic and disarms the ones that went
//! inactive. Trigger fires are handed to a [`Dispatcher`], which runs the
//! analysis through an [`AnalysisRunner`] in the background and records how
//! long it took.
//!
//! # Architecture
//!
//! ```text
//! Registry ──poll──▶ Reconciler ──arm/release──▶ HandleTable
//!                        │                          │
//!                        │              timers · cron jobs · value bindings
//!                        │                          │ fire
//!                        ▼                          ▼
//!                     engine::start            Dispatcher ──▶ AnalysisRunner
//!                     (reconcile + report)          │
//!                                                   ▼
//!                                     DurationLog · broadcast<ExecutionRecord>
//! ```
//!
//! # Triggers
//!
//! - `interval`: fixed period in milliseconds.
//! - `cron`: six-field expression evaluated in UTC.
//! - `cov`: fires per entity whenever the watched input changes.
//! - `cov_threshold`: fires per entity when a numeric input moves more than
//!   `threshold` away from the last value that fired.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handles;
pub mod memory;
pub mod reconciler;
pub mod registry;
pub mod report;
pub mod trigger;
pub mod types;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{parse_period, EngineConfig, OverlapPolicy};
pub use dispatcher::{Dispatcher, DurationLog};
pub use engine::{start, EngineHandle};
pub use error::{EngineError, ErrorKind, Result};
pub use handles::{AnalyticHandles, ArmedAnalytic, HandleTable, TeardownReport};
pub use memory::{MemoryRegistry, MemoryResolver, MemoryValueSource, RecordingRunner};
pub use reconciler::{ArmOutcome, ReconcileSummary, Reconciler};
pub use registry::{
    AnalysisRunner, ChangeCallback, ContextRef, FireCallback, Registry, SubscriptionId,
    ValueSource, ValueSourceResolver,
};
pub use report::{AnalyticStats, DurationReport};
pub use types::{
    AnalysisResult, AnalyticDescriptor, AnalyticId, AnalyticRef, Entity, ExecutionRecord,
    Outcome, TriggerConfig, TriggerSettings, Value,
};

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// Value-source callbacks and runners are user code; a panic in one must not
/// wedge every later fire.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
