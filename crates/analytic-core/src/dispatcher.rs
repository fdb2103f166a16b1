//! Execution dispatcher.
//!
//! Every trigger fire ends up in [`Dispatcher::dispatch`], which spawns the
//! analysis on the runtime and returns immediately. Completion is timed,
//! appended to the rolling duration log and broadcast to observers. Failures
//! and panics in the runner are logged and recorded, never propagated.

use chrono::Utc;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, OverlapPolicy};
use crate::error::{EngineError, Result};
use crate::{lock, panic_message};
use crate::registry::{AnalysisRunner, FireCallback};
use crate::types::{AnalyticId, Entity, ExecutionRecord, Outcome};

const EVENT_CHANNEL_CAPACITY: usize = 256;

type GuardKey = (AnalyticId, Option<String>);

// ---------------------------------------------------------------------------
// DurationLog
// ---------------------------------------------------------------------------

/// Bounded, append-only log of completed executions. Oldest records are
/// evicted once `capacity` is reached.
#[derive(Debug)]
pub struct DurationLog {
    records: Mutex<VecDeque<ExecutionRecord>>,
    capacity: usize,
}

impl DurationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, record: ExecutionRecord) {
        let mut records = lock(&self.records);
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn snapshot(&self) -> Vec<ExecutionRecord> {
        lock(&self.records).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Inner {
    runner: Arc<dyn AnalysisRunner>,
    runtime: tokio::runtime::Handle,
    log: DurationLog,
    overlap: OverlapPolicy,
    guards: Mutex<HashMap<GuardKey, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<ExecutionRecord>,
    /// Records completed since the last `take_window`. `None` until a
    /// window is opened, so nothing accumulates without a reader.
    window: Mutex<Option<Vec<ExecutionRecord>>>,
}

/// Cheap to clone; all clones share the runner, log and guards.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("overlap", &self.inner.overlap)
            .field("logged", &self.inner.log.len())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher bound to the current tokio runtime.
    ///
    /// Fires may come from any thread (value-source callbacks included); they
    /// are always spawned on this runtime.
    pub fn new(runner: Arc<dyn AnalysisRunner>, config: &EngineConfig) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                runner,
                runtime,
                log: DurationLog::new(config.duration_log_capacity),
                overlap: config.overlap,
                guards: Mutex::new(HashMap::new()),
                events,
                window: Mutex::new(None),
            }),
        })
    }

    pub fn overlap(&self) -> OverlapPolicy {
        self.inner.overlap
    }

    /// Start one analysis run in the background.
    ///
    /// The returned handle may be dropped; the run continues either way.
    pub fn dispatch(&self, analytic: AnalyticId, entity: Option<Entity>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        self.inner
            .runtime
            .spawn(async move { inner.execute(analytic, entity).await })
    }

    /// Callback handed to trigger strategies.
    pub fn fire_callback(&self, analytic: AnalyticId, entity: Option<Entity>) -> FireCallback {
        let dispatcher = self.clone();
        Arc::new(move || {
            dispatcher.dispatch(analytic.clone(), entity.clone());
        })
    }

    /// Receive every [`ExecutionRecord`] as it completes.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionRecord> {
        self.inner.events.subscribe()
    }

    /// The rolling duration log, oldest first. Bounded by
    /// `duration_log_capacity`.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.inner.log.snapshot()
    }

    /// Start collecting every completed record for [`Dispatcher::take_window`].
    pub fn open_window(&self) {
        lock(&self.inner.window).get_or_insert_with(Vec::new);
    }

    /// Every record completed since the previous call, independent of the
    /// rolling log's capacity. Empty if no window is open.
    pub fn take_window(&self) -> Vec<ExecutionRecord> {
        lock(&self.inner.window)
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn guard_count(&self) -> usize {
        lock(&self.inner.guards).len()
    }
}

impl Inner {
    fn guard(&self, key: GuardKey) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.guards).entry(key).or_default().clone()
    }

    /// Drop the guard for `key` once no execution holds or waits on it.
    fn prune_guard(&self, key: &GuardKey) {
        let mut guards = lock(&self.guards);
        if guards.get(key).is_some_and(|g| Arc::strong_count(g) == 1) {
            guards.remove(key);
        }
    }

    async fn execute(&self, analytic: AnalyticId, entity: Option<Entity>) {
        let key = (analytic.clone(), entity.as_ref().map(|e| e.id.clone()));
        let permit = match self.overlap {
            OverlapPolicy::Allow => None,
            OverlapPolicy::Skip => match self.guard(key.clone()).try_lock_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!(
                        analytic = %analytic,
                        entity = ?entity.as_ref().map(|e| &e.id),
                        "execution already running, dropping fire"
                    );
                    return;
                }
            },
            OverlapPolicy::Serialize => Some(self.guard(key.clone()).lock_owned().await),
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        let run = AssertUnwindSafe(self.invoke(&analytic, entity.as_ref())).catch_unwind();
        let outcome = match run.await {
            Ok(Ok(results)) => Outcome::Succeeded { results },
            Ok(Err(e)) => {
                warn!(
                    analytic = %analytic,
                    entity = ?entity.as_ref().map(|e| &e.id),
                    kind = %e.kind(),
                    "analysis failed: {e}"
                );
                Outcome::Failed {
                    reason: e.to_string(),
                }
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(analytic = %analytic, "analysis panicked: {reason}");
                Outcome::Failed { reason }
            }
        };

        let elapsed_ms = clock.elapsed().as_millis() as u64;
        if permit.is_some() {
            drop(permit);
            self.prune_guard(&key);
        }

        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            analytic,
            entity: entity.map(|e| e.id),
            started_at,
            finished_at: Utc::now(),
            elapsed_ms,
            outcome,
        };
        debug!(
            analytic = %record.analytic,
            elapsed_ms = record.duration_ms(),
            "analysis finished"
        );
        if let Some(window) = lock(&self.window).as_mut() {
            window.push(record.clone());
        }
        self.log.push(record.clone());
        // No receivers is fine.
        let _ = self.events.send(record);
    }

    async fn invoke(&self, analytic: &AnalyticId, entity: Option<&Entity>) -> Result<usize> {
        match entity {
            Some(entity) => self.runner.run_entity(analytic, entity).await.map(|_| 1),
            None => self.runner.run(analytic).await.map(|results| results.len()),
        }
    }
}
