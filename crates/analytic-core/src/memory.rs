//! In-process collaborators.
//!
//! These back the CLI's manifest-driven registry and serve as fakes in tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::lock;
use crate::registry::{
    AnalysisRunner, ChangeCallback, ContextRef, Registry, SubscriptionId, ValueSource,
    ValueSourceResolver,
};
use crate::types::{
    AnalysisResult, AnalyticDescriptor, AnalyticId, AnalyticRef, Entity, TriggerSettings, Value,
};

// ---------------------------------------------------------------------------
// MemoryRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ContextEntry {
    name: String,
    analytics: Vec<AnalyticDescriptor>,
}

/// Registry held entirely in memory. Contexts and analytics keep insertion
/// order within a context; contexts are ordered by id.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    contexts: RwLock<BTreeMap<String, ContextEntry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an analytic inside `context_id`, creating the context
    /// if needed.
    pub fn upsert(&self, context_id: &str, descriptor: AnalyticDescriptor) {
        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        let entry = contexts
            .entry(context_id.to_string())
            .or_insert_with(|| ContextEntry {
                name: context_id.to_string(),
                analytics: Vec::new(),
            });
        match entry.analytics.iter_mut().find(|a| a.id == descriptor.id) {
            Some(existing) => *existing = descriptor,
            None => entry.analytics.push(descriptor),
        }
    }

    /// Replace the full catalogue in one step.
    pub fn replace(&self, catalogue: Vec<(ContextRef, Vec<AnalyticDescriptor>)>) {
        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        contexts.clear();
        for (context, analytics) in catalogue {
            contexts.insert(
                context.id,
                ContextEntry {
                    name: context.name,
                    analytics,
                },
            );
        }
    }

    /// Flip the activation flag. Returns false if the analytic is unknown.
    pub fn set_active(&self, id: &AnalyticId, active: bool) -> bool {
        self.update(id, |a| a.active = active)
    }

    pub fn remove(&self, id: &AnalyticId) -> bool {
        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for entry in contexts.values_mut() {
            let before = entry.analytics.len();
            entry.analytics.retain(|a| &a.id != id);
            removed |= entry.analytics.len() != before;
        }
        removed
    }

    pub fn update(&self, id: &AnalyticId, f: impl FnOnce(&mut AnalyticDescriptor)) -> bool {
        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        let found = contexts
            .values_mut()
            .flat_map(|c| c.analytics.iter_mut())
            .find(|a| &a.id == id);
        match found {
            Some(descriptor) => {
                f(descriptor);
                true
            }
            None => false,
        }
    }

    fn find(&self, id: &AnalyticId) -> Result<AnalyticDescriptor> {
        let contexts = self.contexts.read().unwrap_or_else(|e| e.into_inner());
        contexts
            .values()
            .flat_map(|c| c.analytics.iter())
            .find(|a| &a.id == id)
            .cloned()
            .ok_or_else(|| EngineError::Registry(format!("analytic not found: {id}")))
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn list_contexts(&self) -> Result<Vec<ContextRef>> {
        let contexts = self.contexts.read().unwrap_or_else(|e| e.into_inner());
        Ok(contexts
            .iter()
            .map(|(id, entry)| ContextRef {
                id: id.clone(),
                name: entry.name.clone(),
            })
            .collect())
    }

    async fn list_analytics(&self, context_id: &str) -> Result<Vec<AnalyticRef>> {
        let contexts = self.contexts.read().unwrap_or_else(|e| e.into_inner());
        let entry = contexts
            .get(context_id)
            .ok_or_else(|| EngineError::Registry(format!("context not found: {context_id}")))?;
        Ok(entry
            .analytics
            .iter()
            .map(|a| AnalyticRef {
                id: a.id.clone(),
                name: a.name.clone(),
            })
            .collect())
    }

    async fn trigger_config(&self, analytic: &AnalyticId) -> Result<TriggerSettings> {
        let descriptor = self.find(analytic)?;
        Ok(TriggerSettings {
            active: descriptor.active,
            fire_immediately: descriptor.fire_immediately,
            triggers: descriptor.triggers,
        })
    }

    async fn followed_entities(&self, analytic: &AnalyticId) -> Result<Vec<Entity>> {
        Ok(self.find(analytic)?.followed)
    }
}

// ---------------------------------------------------------------------------
// MemoryValueSource
// ---------------------------------------------------------------------------

/// A single observable value cell.
///
/// Every [`set`](Self::set) notifies subscribers, even when the value did not
/// change; deduplication is the trigger's job.
pub struct MemoryValueSource {
    value: Mutex<Value>,
    subscribers: Mutex<BTreeMap<u64, ChangeCallback>>,
    next_id: AtomicU64,
    unsubscribe_calls: AtomicUsize,
}

impl std::fmt::Debug for MemoryValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryValueSource")
            .field("value", &*lock(&self.value))
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl MemoryValueSource {
    pub fn new(initial: Value) -> Self {
        Self {
            value: Mutex::new(initial),
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            unsubscribe_calls: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> Value {
        lock(&self.value).clone()
    }

    /// Store `value` and notify every subscriber.
    pub fn set(&self, value: Value) {
        *lock(&self.value) = value.clone();
        // Callbacks run outside the lock so they may unsubscribe.
        let callbacks: Vec<ChangeCallback> = lock(&self.subscribers).values().cloned().collect();
        for callback in callbacks {
            callback(value.clone());
        }
    }

    /// Store and notify only when `value` differs from the current one.
    pub fn set_if_changed(&self, value: Value) -> bool {
        if *lock(&self.value) == value {
            return false;
        }
        self.set(value);
        true
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ValueSource for MemoryValueSource {
    async fn read(&self) -> Result<Value> {
        Ok(self.get())
    }

    fn subscribe(&self, on_change: ChangeCallback) -> Result<SubscriptionId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscribers).insert(id, on_change);
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.subscribers).remove(&id.0) {
            Some(_) => Ok(()),
            None => Err(EngineError::Teardown(format!(
                "subscription {} is not registered",
                id.0
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryResolver
// ---------------------------------------------------------------------------

/// Value sources keyed by `(entity id, input index)`.
#[derive(Debug, Default)]
pub struct MemoryResolver {
    sources: Mutex<HashMap<(String, usize), Arc<MemoryValueSource>>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(&self, entity_id: &str, input_index: usize) -> Option<Arc<MemoryValueSource>> {
        lock(&self.sources)
            .get(&(entity_id.to_string(), input_index))
            .cloned()
    }

    /// Create the input if missing, otherwise push the value to it.
    ///
    /// Returns true when subscribers were notified.
    pub fn set_value(&self, entity_id: &str, input_index: usize, value: Value) -> bool {
        let existing = {
            let mut sources = lock(&self.sources);
            match sources.get(&(entity_id.to_string(), input_index)) {
                Some(source) => Some(source.clone()),
                None => {
                    sources.insert(
                        (entity_id.to_string(), input_index),
                        Arc::new(MemoryValueSource::new(value.clone())),
                    );
                    None
                }
            }
        };
        match existing {
            Some(source) => source.set_if_changed(value),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.sources).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ValueSourceResolver for MemoryResolver {
    async fn resolve(
        &self,
        _analytic: &AnalyticId,
        entity: &Entity,
        input_index: usize,
    ) -> Result<Option<Arc<dyn ValueSource>>> {
        Ok(self
            .source(&entity.id, input_index)
            .map(|s| s as Arc<dyn ValueSource>))
    }
}

// ---------------------------------------------------------------------------
// RecordingRunner
// ---------------------------------------------------------------------------

/// Runner that records every invocation and returns an empty result.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<(AnalyticId, Option<String>)>>,
    fail: AtomicBool,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every run sleeps for `delay` before returning.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(AnalyticId, Option<String>)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Highest number of runs observed executing at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn invoke(&self, analytic: &AnalyticId, entity: Option<&Entity>) -> Result<()> {
        lock(&self.calls).push((analytic.clone(), entity.map(|e| e.id.clone())));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Execution {
                analytic: analytic.to_string(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AnalysisRunner for RecordingRunner {
    async fn run(&self, analytic: &AnalyticId) -> Result<Vec<AnalysisResult>> {
        self.invoke(analytic, None).await?;
        Ok(Vec::new())
    }

    async fn run_entity(&self, analytic: &AnalyticId, entity: &Entity) -> Result<AnalysisResult> {
        self.invoke(analytic, Some(entity)).await?;
        Ok(AnalysisResult::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TriggerConfig;
    use serde_json::json;

    fn descriptor(id: &str, active: bool) -> AnalyticDescriptor {
        AnalyticDescriptor {
            id: AnalyticId::from(id),
            name: id.to_uppercase(),
            active,
            fire_immediately: false,
            triggers: vec![TriggerConfig::Interval { period_ms: 1000 }],
            followed: vec![Entity::new("room-1", "Room 1")],
        }
    }

    #[tokio::test]
    async fn registry_lists_and_updates() {
        let registry = MemoryRegistry::new();
        registry.upsert("ctx", descriptor("a1", true));
        registry.upsert("ctx", descriptor("a2", false));

        let contexts = registry.list_contexts().await.unwrap();
        assert_eq!(contexts.len(), 1);
        let analytics = registry.list_analytics("ctx").await.unwrap();
        assert_eq!(analytics.len(), 2);
        assert_eq!(analytics[1].name, "A2");

        assert!(registry.set_active(&AnalyticId::from("a2"), true));
        let settings = registry.trigger_config(&AnalyticId::from("a2")).await.unwrap();
        assert!(settings.active);

        assert!(registry.remove(&AnalyticId::from("a1")));
        assert!(registry.trigger_config(&AnalyticId::from("a1")).await.is_err());
    }

    #[tokio::test]
    async fn unknown_context_is_registry_error() {
        let registry = MemoryRegistry::new();
        let err = registry.list_analytics("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::Registry(_)));
    }

    #[test]
    fn value_source_notifies_every_set() {
        let source = MemoryValueSource::new(json!(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = source
            .subscribe(Arc::new(move |v| sink.lock().unwrap().push(v)))
            .unwrap();

        source.set(json!(1));
        source.set(json!(2));
        assert!(!source.set_if_changed(json!(2)));
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);

        source.unsubscribe(id).unwrap();
        source.set(json!(3));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(source.unsubscribe(id).is_err());
        assert_eq!(source.unsubscribe_calls(), 2);
    }

    #[tokio::test]
    async fn resolver_returns_none_for_missing_input() {
        let resolver = MemoryResolver::new();
        assert!(!resolver.set_value("room-1", 0, json!(20)));
        let entity = Entity::new("room-1", "");
        let id = AnalyticId::from("a1");
        assert!(resolver.resolve(&id, &entity, 0).await.unwrap().is_some());
        assert!(resolver.resolve(&id, &entity, 1).await.unwrap().is_none());
        assert!(resolver.set_value("room-1", 0, json!(21)));
        assert_eq!(resolver.source("room-1", 0).unwrap().get(), json!(21));
    }

    #[tokio::test]
    async fn recording_runner_counts_and_fails() {
        let runner = RecordingRunner::new();
        let id = AnalyticId::from("a1");
        runner.run(&id).await.unwrap();
        runner.set_failing(true);
        assert!(runner
            .run_entity(&id, &Entity::new("e1", ""))
            .await
            .is_err());
        assert_eq!(
            runner.calls(),
            vec![(id.clone(), None), (id, Some("e1".to_string()))]
        );
    }
}
