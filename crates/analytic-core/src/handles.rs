//! Live resources held for each armed analytic.
//!
//! The [`HandleTable`] is owned by the reconciler and is the only record of
//! what is armed. An analytic id is present exactly while its timers, cron
//! jobs and value subscriptions are live.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{lock, panic_message};
use crate::registry::{SubscriptionId, ValueSource};
use crate::trigger::cov::ChangeDetector;
use crate::types::{AnalyticId, Entity};

// ---------------------------------------------------------------------------
// Individual handles
// ---------------------------------------------------------------------------

/// A recurring timer task. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
    period: Duration,
}

impl TimerHandle {
    pub(crate) fn new(task: JoinHandle<()>, period: Duration) -> Self {
        Self { task, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop future ticks. A fire already handed to the dispatcher keeps running.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A cron schedule task. Dropping the handle stops the schedule.
#[derive(Debug)]
pub struct CronHandle {
    task: JoinHandle<()>,
    expression: String,
}

impl CronHandle {
    pub(crate) fn new(task: JoinHandle<()>, expression: impl Into<String>) -> Self {
        Self {
            task,
            expression: expression.into(),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for CronHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A change subscription on one followed entity's input. Dropping a binding
/// that was never released unsubscribes it.
pub struct ValueBinding {
    entity: Entity,
    input_index: usize,
    source: Arc<dyn ValueSource>,
    subscription: SubscriptionId,
    detector: Arc<Mutex<ChangeDetector>>,
    released: AtomicBool,
}

impl std::fmt::Debug for ValueBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueBinding")
            .field("entity", &self.entity.id)
            .field("input_index", &self.input_index)
            .field("subscription", &self.subscription)
            .field("detector", &*lock(&self.detector))
            .finish()
    }
}

impl ValueBinding {
    pub(crate) fn new(
        entity: Entity,
        input_index: usize,
        source: Arc<dyn ValueSource>,
        subscription: SubscriptionId,
        detector: Arc<Mutex<ChangeDetector>>,
    ) -> Self {
        Self {
            entity,
            input_index,
            source,
            subscription,
            detector,
            released: AtomicBool::new(false),
        }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn input_index(&self) -> usize {
        self.input_index
    }

    /// Snapshot of the change detector, including the last observed value.
    pub fn detector(&self) -> ChangeDetector {
        lock(&self.detector).clone()
    }

    /// Unsubscribe from the value source. Marks the binding released even if
    /// the source reports an error, so drop does not retry.
    pub fn release(&self) -> crate::Result<()> {
        self.released.store(true, Ordering::SeqCst);
        self.source.unsubscribe(self.subscription)
    }
}

impl Drop for ValueBinding {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        let source = &self.source;
        let subscription = self.subscription;
        match panic::catch_unwind(AssertUnwindSafe(|| source.unsubscribe(subscription))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                entity = %self.entity.id,
                "failed to unsubscribe dropped value binding: {e}"
            ),
            Err(payload) => warn!(
                entity = %self.entity.id,
                "unsubscribe panicked while dropping value binding: {}",
                panic_message(payload.as_ref())
            ),
        }
    }
}

/// Anything a trigger strategy hands back when it arms.
#[derive(Debug)]
pub enum Handle {
    Timer(TimerHandle),
    Cron(CronHandle),
    Binding(ValueBinding),
}

// ---------------------------------------------------------------------------
// AnalyticHandles
// ---------------------------------------------------------------------------

/// Outcome of releasing one or more analytics' resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub released: usize,
    pub failed: usize,
}

impl TeardownReport {
    /// Total release attempts, successful or not.
    pub fn attempted(&self) -> usize {
        self.released + self.failed
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.released += other.released;
        self.failed += other.failed;
    }
}

#[derive(Debug)]
pub struct AnalyticHandles {
    name: String,
    armed_at: DateTime<Utc>,
    timers: Vec<TimerHandle>,
    cron_jobs: Vec<CronHandle>,
    bindings: Vec<ValueBinding>,
}

impl AnalyticHandles {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            armed_at: Utc::now(),
            timers: Vec::new(),
            cron_jobs: Vec::new(),
            bindings: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn armed_at(&self) -> DateTime<Utc> {
        self.armed_at
    }

    pub fn push(&mut self, handle: Handle) {
        match handle {
            Handle::Timer(t) => self.timers.push(t),
            Handle::Cron(c) => self.cron_jobs.push(c),
            Handle::Binding(b) => self.bindings.push(b),
        }
    }

    pub fn extend(&mut self, handles: impl IntoIterator<Item = Handle>) {
        for handle in handles {
            self.push(handle);
        }
    }

    pub fn timers(&self) -> &[TimerHandle] {
        &self.timers
    }

    pub fn cron_jobs(&self) -> &[CronHandle] {
        &self.cron_jobs
    }

    pub fn bindings(&self) -> &[ValueBinding] {
        &self.bindings
    }

    pub fn resource_count(&self) -> usize {
        self.timers.len() + self.cron_jobs.len() + self.bindings.len()
    }

    /// Release every resource: timers, then cron jobs, then value bindings.
    ///
    /// Each release is attempted on its own. An error or panic from the value
    /// source is logged and counted and never stops the remaining releases.
    pub fn release(self, id: &AnalyticId) -> TeardownReport {
        let mut report = TeardownReport::default();

        for timer in &self.timers {
            timer.cancel();
            report.released += 1;
        }
        for job in &self.cron_jobs {
            job.cancel();
            report.released += 1;
        }
        for binding in &self.bindings {
            match panic::catch_unwind(AssertUnwindSafe(|| binding.release())) {
                Ok(Ok(())) => report.released += 1,
                Ok(Err(e)) => {
                    warn!(
                        analytic = %id,
                        entity = %binding.entity.id,
                        kind = %e.kind(),
                        "failed to unsubscribe value binding: {e}"
                    );
                    report.failed += 1;
                }
                Err(payload) => {
                    warn!(
                        analytic = %id,
                        entity = %binding.entity.id,
                        "unsubscribe panicked: {}",
                        panic_message(payload.as_ref())
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }
}

// ---------------------------------------------------------------------------
// HandleTable
// ---------------------------------------------------------------------------

/// Per-analytic view used for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArmedAnalytic {
    pub id: AnalyticId,
    pub name: String,
    pub armed_at: DateTime<Utc>,
    pub timers: usize,
    pub cron_jobs: usize,
    pub bindings: usize,
}

#[derive(Debug, Default)]
pub struct HandleTable {
    entries: BTreeMap<AnalyticId, AnalyticHandles>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &AnalyticId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &AnalyticId) -> Option<&AnalyticHandles> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, id: AnalyticId, handles: AnalyticHandles) {
        if let Some(previous) = self.entries.insert(id.clone(), handles) {
            previous.release(&id);
        }
    }

    pub fn remove(&mut self, id: &AnalyticId) -> Option<AnalyticHandles> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<AnalyticId> {
        self.entries.keys().cloned().collect()
    }

    pub fn resource_count(&self) -> usize {
        self.entries.values().map(|h| h.resource_count()).sum()
    }

    pub fn snapshot(&self) -> Vec<ArmedAnalytic> {
        self.entries
            .iter()
            .map(|(id, h)| ArmedAnalytic {
                id: id.clone(),
                name: h.name.clone(),
                armed_at: h.armed_at,
                timers: h.timers.len(),
                cron_jobs: h.cron_jobs.len(),
                bindings: h.bindings.len(),
            })
            .collect()
    }

    /// Remove and release every entry.
    pub fn clear(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for (id, handles) in std::mem::take(&mut self.entries) {
            report.merge(handles.release(&id));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryValueSource;
    use crate::registry::{ChangeCallback, ValueSource};
    use crate::types::Value;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn binding(source: Arc<MemoryValueSource>) -> ValueBinding {
        let subscription = source.subscribe(Arc::new(|_| {})).unwrap();
        ValueBinding::new(
            Entity::new("e1", ""),
            0,
            source,
            subscription,
            Arc::new(Mutex::new(ChangeDetector::exact(json!(0)))),
        )
    }

    #[tokio::test]
    async fn release_counts_every_resource() {
        let source = Arc::new(MemoryValueSource::new(json!(0)));
        let mut handles = AnalyticHandles::new("a");
        handles.push(Handle::Timer(TimerHandle::new(
            tokio::spawn(std::future::pending::<()>()),
            Duration::from_secs(1),
        )));
        handles.push(Handle::Cron(CronHandle::new(
            tokio::spawn(std::future::pending::<()>()),
            "* * * * * *",
        )));
        handles.push(Handle::Binding(binding(source.clone())));
        handles.push(Handle::Binding(binding(source.clone())));
        assert_eq!(handles.resource_count(), 4);

        let report = handles.release(&AnalyticId::from("a"));
        assert_eq!(report, TeardownReport { released: 4, failed: 0 });
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn failed_unsubscribe_does_not_stop_siblings() {
        let source = Arc::new(MemoryValueSource::new(json!(0)));
        let first = binding(source.clone());
        // Unsubscribe behind the binding's back so its own release fails.
        first.release().unwrap();

        let mut handles = AnalyticHandles::new("a");
        handles.push(Handle::Binding(first));
        handles.push(Handle::Binding(binding(source.clone())));

        let report = handles.release(&AnalyticId::from("a"));
        assert_eq!(report.failed, 1);
        assert_eq!(report.released, 1);
        assert_eq!(report.attempted(), 2);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn table_clear_releases_everything() {
        let source = Arc::new(MemoryValueSource::new(json!(0)));
        let mut table = HandleTable::new();
        for id in ["a", "b"] {
            let mut handles = AnalyticHandles::new(id);
            handles.push(Handle::Binding(binding(source.clone())));
            table.insert(AnalyticId::from(id), handles);
        }
        assert_eq!(table.len(), 2);
        assert_eq!(table.resource_count(), 2);
        assert_eq!(table.snapshot()[1].bindings, 1);

        let report = table.clear();
        assert_eq!(report.released, 2);
        assert!(table.is_empty());
        assert_eq!(source.subscriber_count(), 0);
    }

    /// Value source whose unsubscribe always panics.
    #[derive(Default)]
    struct PanickingSource {
        unsubscribe_calls: AtomicUsize,
    }

    #[async_trait]
    impl ValueSource for PanickingSource {
        async fn read(&self) -> crate::Result<Value> {
            Ok(json!(0))
        }

        fn subscribe(&self, _on_change: ChangeCallback) -> crate::Result<SubscriptionId> {
            Ok(SubscriptionId(7))
        }

        fn unsubscribe(&self, _id: SubscriptionId) -> crate::Result<()> {
            self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
            panic!("source connection lost");
        }
    }

    fn panicking_binding(source: Arc<PanickingSource>) -> ValueBinding {
        ValueBinding::new(
            Entity::new("e0", ""),
            0,
            source,
            SubscriptionId(7),
            Arc::new(Mutex::new(ChangeDetector::exact(json!(0)))),
        )
    }

    #[tokio::test]
    async fn panicking_unsubscribe_does_not_stop_siblings() {
        let broken = Arc::new(PanickingSource::default());
        let source = Arc::new(MemoryValueSource::new(json!(0)));
        let mut handles = AnalyticHandles::new("a");
        handles.push(Handle::Binding(panicking_binding(broken.clone())));
        handles.push(Handle::Binding(binding(source.clone())));

        let report = handles.release(&AnalyticId::from("a"));
        assert_eq!(report, TeardownReport { released: 1, failed: 1 });
        assert_eq!(source.subscriber_count(), 0);
        // Drop after a failed release does not try again.
        assert_eq!(broken.unsubscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_table_unsubscribes_bindings() {
        let source = Arc::new(MemoryValueSource::new(json!(0)));
        let mut table = HandleTable::new();
        let mut handles = AnalyticHandles::new("a");
        handles.push(Handle::Binding(binding(source.clone())));
        table.insert(AnalyticId::from("a"), handles);
        assert_eq!(source.subscriber_count(), 1);

        drop(table);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_binding_survives_panicking_source() {
        let broken = Arc::new(PanickingSource::default());
        drop(panicking_binding(broken.clone()));
        assert_eq!(broken.unsubscribe_calls.load(Ordering::SeqCst), 1);
    }
}
