//! Collaborator interfaces the engine consumes.
//!
//! The catalogue comes from a [`Registry`]. Live input values are reached
//! through [`ValueSourceResolver`] / [`ValueSource`], and every fire is handed
//! to an [`AnalysisRunner`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::types::{AnalysisResult, AnalyticId, AnalyticRef, Entity, TriggerSettings, Value};

/// Callback invoked by a value source with the new value after every change.
pub type ChangeCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback invoked by an armed trigger each time it fires.
pub type FireCallback = Arc<dyn Fn() + Send + Sync>;

/// Token returned by [`ValueSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// A grouping of analytics in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRef {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_contexts(&self) -> Result<Vec<ContextRef>>;

    async fn list_analytics(&self, context_id: &str) -> Result<Vec<AnalyticRef>>;

    /// Current trigger configuration and activation flag.
    async fn trigger_config(&self, analytic: &AnalyticId) -> Result<TriggerSettings>;

    async fn followed_entities(&self, analytic: &AnalyticId) -> Result<Vec<Entity>>;
}

#[async_trait]
pub trait ValueSourceResolver: Send + Sync {
    /// Locate the value source backing `input_index` of `entity`.
    ///
    /// `Ok(None)` means the entity has no such input; callers skip it.
    async fn resolve(
        &self,
        analytic: &AnalyticId,
        entity: &Entity,
        input_index: usize,
    ) -> Result<Option<Arc<dyn ValueSource>>>;
}

#[async_trait]
pub trait ValueSource: Send + Sync {
    async fn read(&self) -> Result<Value>;

    /// Register `on_change`. It is not called for the current value, only for
    /// subsequent changes.
    fn subscribe(&self, on_change: ChangeCallback) -> Result<SubscriptionId>;

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

#[async_trait]
pub trait AnalysisRunner: Send + Sync {
    /// Run the analytic over all of its followed entities.
    async fn run(&self, analytic: &AnalyticId) -> Result<Vec<AnalysisResult>>;

    /// Run the analytic for a single entity.
    async fn run_entity(&self, analytic: &AnalyticId, entity: &Entity) -> Result<AnalysisResult>;
}
