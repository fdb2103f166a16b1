//! Change-of-value triggers.
//!
//! Both kinds bind one subscription per followed entity. The plain kind fires
//! whenever the value differs from the last one seen; the threshold kind fires
//! only when the numeric value moves strictly more than `threshold` away from
//! the last value that fired.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::ArmContext;
use crate::error::{EngineError, Result};
use crate::handles::{Handle, ValueBinding};
use crate::lock;
use crate::registry::{ChangeCallback, FireCallback};
use crate::types::{AnalyticId, Entity, Value};

// ---------------------------------------------------------------------------
// ChangeDetector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChangeRule {
    Exact,
    Threshold(f64),
}

impl ChangeRule {
    pub fn validate(&self) -> Result<()> {
        match self {
            ChangeRule::Exact => Ok(()),
            ChangeRule::Threshold(t) if t.is_finite() && *t >= 0.0 => Ok(()),
            ChangeRule::Threshold(t) => Err(EngineError::Config(format!(
                "threshold must be a finite, non-negative number (got {t})"
            ))),
        }
    }
}

/// Result of feeding one notification to a [`ChangeDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Fired,
    Unchanged,
    /// The value could not be compared (non-numeric under a threshold rule).
    Ignored,
}

/// Per-binding comparison state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeDetector {
    Exact { previous: Value },
    Threshold { previous: f64, threshold: f64 },
}

impl ChangeDetector {
    pub fn exact(initial: Value) -> Self {
        ChangeDetector::Exact { previous: initial }
    }

    pub fn threshold(initial: f64, threshold: f64) -> Self {
        ChangeDetector::Threshold {
            previous: initial,
            threshold,
        }
    }

    /// Threshold detector whose first numeric observation always fires.
    ///
    /// `previous` starts at positive infinity, so any finite value is more
    /// than any finite threshold away; the fire then stores the real value.
    pub fn forced_threshold(threshold: f64) -> Self {
        Self::threshold(f64::INFINITY, threshold)
    }

    pub fn observe(&mut self, value: &Value) -> Change {
        match self {
            ChangeDetector::Exact { previous } => {
                if previous == value {
                    return Change::Unchanged;
                }
                *previous = value.clone();
                Change::Fired
            }
            ChangeDetector::Threshold {
                previous,
                threshold,
            } => {
                let Some(current) = value.as_f64() else {
                    return Change::Ignored;
                };
                if (current - *previous).abs() > *threshold {
                    *previous = current;
                    Change::Fired
                } else {
                    Change::Unchanged
                }
            }
        }
    }

    /// The last value that was stored. An unseeded threshold detector
    /// reports `Value::Null` since infinity has no JSON form.
    pub fn previous(&self) -> Value {
        match self {
            ChangeDetector::Exact { previous } => previous.clone(),
            ChangeDetector::Threshold { previous, .. } => Value::from(*previous),
        }
    }
}

// ---------------------------------------------------------------------------
// Arming
// ---------------------------------------------------------------------------

/// Bind every followed entity of the analytic. Entities whose input cannot be
/// resolved are skipped; the rest still bind.
pub async fn arm(ctx: &ArmContext<'_>, input_index: usize, rule: ChangeRule) -> Result<Vec<Handle>> {
    rule.validate()?;
    let analytic = &ctx.analytic.id;
    let mut handles = Vec::new();
    for entity in &ctx.analytic.followed {
        match bind_entity(ctx, entity, input_index, rule).await {
            Ok(binding) => handles.push(Handle::Binding(binding)),
            Err(e) => warn!(
                analytic = %analytic,
                entity = %entity.id,
                input_index,
                kind = %e.kind(),
                "skipping entity binding: {e}"
            ),
        }
    }
    Ok(handles)
}

async fn bind_entity(
    ctx: &ArmContext<'_>,
    entity: &Entity,
    input_index: usize,
    rule: ChangeRule,
) -> Result<ValueBinding> {
    let analytic = &ctx.analytic.id;
    let source = ctx
        .resolver
        .resolve(analytic, entity, input_index)
        .await?
        .ok_or_else(|| EngineError::Resolution {
            entity: entity.id.clone(),
            input_index,
        })?;

    let on_fire = ctx
        .dispatcher
        .fire_callback(analytic.clone(), Some(entity.clone()));
    let fire_immediately = ctx.analytic.fire_immediately;
    let current = source.read().await?;

    let detector = match rule {
        ChangeRule::Exact => {
            if fire_immediately {
                on_fire();
            }
            ChangeDetector::exact(current.clone())
        }
        ChangeRule::Threshold(threshold) if fire_immediately => {
            ChangeDetector::forced_threshold(threshold)
        }
        ChangeRule::Threshold(threshold) => {
            let initial = current.as_f64().ok_or_else(|| {
                EngineError::Config(format!(
                    "threshold trigger needs a numeric input, found {current}"
                ))
            })?;
            ChangeDetector::threshold(initial, threshold)
        }
    };
    let detector = Arc::new(Mutex::new(detector));

    let callback = change_callback(analytic.clone(), entity.id.clone(), detector.clone(), on_fire);
    if matches!(rule, ChangeRule::Threshold(_)) && fire_immediately {
        // The current value is the first observation; against the infinite
        // seed it always fires and then becomes `previous`. It must land
        // before any notification the subscription delivers.
        callback(current);
    }
    let subscription = source.subscribe(callback)?;

    debug!(analytic = %analytic, entity = %entity.id, input_index, "bound value source");
    Ok(ValueBinding::new(
        entity.clone(),
        input_index,
        source,
        subscription,
        detector,
    ))
}

fn change_callback(
    analytic: AnalyticId,
    entity_id: String,
    detector: Arc<Mutex<ChangeDetector>>,
    on_fire: FireCallback,
) -> ChangeCallback {
    Arc::new(move |value: Value| {
        let change = lock(&detector).observe(&value);
        match change {
            Change::Fired => {
                debug!(analytic = %analytic, entity = %entity_id, %value, "value changed, starting analysis");
                on_fire();
            }
            Change::Unchanged => {}
            Change::Ignored => warn!(
                analytic = %analytic,
                entity = %entity_id,
                %value,
                "ignoring non-numeric value for threshold trigger"
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::dispatcher::Dispatcher;
    use crate::memory::{MemoryResolver, RecordingRunner};
    use crate::registry::{SubscriptionId, ValueSource, ValueSourceResolver};
    use crate::types::{AnalyticDescriptor, TriggerConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn feed(detector: &mut ChangeDetector, values: &[Value]) -> usize {
        values
            .iter()
            .filter(|v| detector.observe(v) == Change::Fired)
            .count()
    }

    #[test]
    fn exact_fires_on_each_distinct_change() {
        let mut detector = ChangeDetector::exact(json!(10));
        let fired = feed(
            &mut detector,
            &[json!(10), json!(10), json!(12), json!(12), json!(7)],
        );
        assert_eq!(fired, 2);
        assert_eq!(detector.previous(), json!(7));
    }

    #[test]
    fn exact_uses_structural_equality() {
        let mut detector = ChangeDetector::exact(json!({"state": "on"}));
        assert_eq!(detector.observe(&json!({"state": "on"})), Change::Unchanged);
        assert_eq!(detector.observe(&json!("on")), Change::Fired);
        assert_eq!(detector.observe(&json!("on")), Change::Unchanged);
    }

    #[test]
    fn threshold_is_strict_and_tracks_last_fire() {
        let mut detector = ChangeDetector::threshold(20.0, 5.0);
        let fired = feed(&mut detector, &[json!(20), json!(23), json!(30), json!(31)]);
        assert_eq!(fired, 1);
        assert_eq!(detector.previous(), json!(30.0));

        // Exactly at the threshold is not enough.
        assert_eq!(detector.observe(&json!(35)), Change::Unchanged);
        assert_eq!(detector.observe(&json!(35.5)), Change::Fired);
    }

    #[test]
    fn forced_threshold_fires_once_then_seeds() {
        let mut detector = ChangeDetector::forced_threshold(1000.0);
        assert_eq!(detector.previous(), Value::Null);
        assert_eq!(detector.observe(&json!(5)), Change::Fired);
        assert_eq!(detector.previous(), json!(5.0));
        assert_eq!(detector.observe(&json!(6)), Change::Unchanged);
    }

    #[test]
    fn threshold_ignores_non_numeric() {
        let mut detector = ChangeDetector::threshold(1.0, 0.5);
        assert_eq!(detector.observe(&json!("high")), Change::Ignored);
        assert_eq!(detector.previous(), json!(1.0));
    }

    fn descriptor(trigger: TriggerConfig, fire_immediately: bool) -> AnalyticDescriptor {
        AnalyticDescriptor {
            id: "a1".into(),
            name: "A1".into(),
            active: true,
            fire_immediately,
            triggers: vec![trigger],
            followed: vec![Entity::new("e1", "E1"), Entity::new("e2", "E2")],
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn missing_entity_input_is_skipped() {
        let runner = Arc::new(RecordingRunner::new());
        let dispatcher = Dispatcher::new(runner.clone(), &EngineConfig::default()).unwrap();
        let resolver = MemoryResolver::new();
        resolver.set_value("e1", 0, json!(1));
        let analytic = descriptor(TriggerConfig::ChangeOfValue { input_index: 0 }, false);
        let ctx = ArmContext {
            analytic: &analytic,
            resolver: &resolver,
            dispatcher: &dispatcher,
        };

        let handles = arm(&ctx, 0, ChangeRule::Exact).await.unwrap();
        assert_eq!(handles.len(), 1);

        resolver.set_value("e1", 0, json!(2));
        settle().await;
        assert_eq!(runner.calls(), vec![(AnalyticId::from("a1"), Some("e1".to_string()))]);
    }

    #[tokio::test]
    async fn cov_fire_immediately_runs_each_entity_once() {
        let runner = Arc::new(RecordingRunner::new());
        let dispatcher = Dispatcher::new(runner.clone(), &EngineConfig::default()).unwrap();
        let resolver = MemoryResolver::new();
        resolver.set_value("e1", 0, json!(1));
        resolver.set_value("e2", 0, json!(1));
        let analytic = descriptor(TriggerConfig::ChangeOfValue { input_index: 0 }, true);
        let ctx = ArmContext {
            analytic: &analytic,
            resolver: &resolver,
            dispatcher: &dispatcher,
        };

        let handles = arm(&ctx, 0, ChangeRule::Exact).await.unwrap();
        assert_eq!(handles.len(), 2);
        settle().await;
        assert_eq!(runner.call_count(), 2);

        // Same value again: no new run.
        resolver.source("e1", 0).unwrap().set(json!(1));
        settle().await;
        assert_eq!(runner.call_count(), 2);
    }

    #[tokio::test]
    async fn covt_fire_immediately_seeds_previous_with_first_value() {
        let runner = Arc::new(RecordingRunner::new());
        let dispatcher = Dispatcher::new(runner.clone(), &EngineConfig::default()).unwrap();
        let resolver = MemoryResolver::new();
        resolver.set_value("e1", 0, json!(5));
        let mut analytic = descriptor(
            TriggerConfig::ChangeOfValueWithThreshold {
                input_index: 0,
                threshold: 2.0,
            },
            true,
        );
        analytic.followed.truncate(1);
        let ctx = ArmContext {
            analytic: &analytic,
            resolver: &resolver,
            dispatcher: &dispatcher,
        };

        let handles = arm(&ctx, 0, ChangeRule::Threshold(2.0)).await.unwrap();
        settle().await;
        assert_eq!(runner.call_count(), 1);

        let Handle::Binding(binding) = &handles[0] else {
            panic!("expected a value binding");
        };
        assert_eq!(binding.detector().previous(), json!(5.0));

        resolver.set_value("e1", 0, json!(6));
        settle().await;
        assert_eq!(runner.call_count(), 1);
        resolver.set_value("e1", 0, json!(8));
        settle().await;
        assert_eq!(runner.call_count(), 2);
    }

    #[tokio::test]
    async fn covt_without_numeric_input_skips_entity() {
        let runner = Arc::new(RecordingRunner::new());
        let dispatcher = Dispatcher::new(runner, &EngineConfig::default()).unwrap();
        let resolver = MemoryResolver::new();
        resolver.set_value("e1", 0, json!("offline"));
        resolver.set_value("e2", 0, json!(3.5));
        let analytic = descriptor(
            TriggerConfig::ChangeOfValueWithThreshold {
                input_index: 0,
                threshold: 1.0,
            },
            false,
        );
        let ctx = ArmContext {
            analytic: &analytic,
            resolver: &resolver,
            dispatcher: &dispatcher,
        };
        let handles = arm(&ctx, 0, ChangeRule::Threshold(1.0)).await.unwrap();
        assert_eq!(handles.len(), 1);
    }

    /// Reads `read`, then pushes `pushed` from inside `subscribe`, the way a
    /// source that replays its latest value on registration would.
    struct ReplayingSource {
        read: Value,
        pushed: Value,
    }

    #[async_trait]
    impl ValueSource for ReplayingSource {
        async fn read(&self) -> Result<Value> {
            Ok(self.read.clone())
        }

        fn subscribe(&self, on_change: ChangeCallback) -> Result<SubscriptionId> {
            on_change(self.pushed.clone());
            Ok(SubscriptionId(1))
        }

        fn unsubscribe(&self, _id: SubscriptionId) -> Result<()> {
            Ok(())
        }
    }

    struct ReplayingResolver(Arc<ReplayingSource>);

    #[async_trait]
    impl ValueSourceResolver for ReplayingResolver {
        async fn resolve(
            &self,
            _analytic: &AnalyticId,
            _entity: &Entity,
            _input_index: usize,
        ) -> Result<Option<Arc<dyn ValueSource>>> {
            Ok(Some(self.0.clone() as Arc<dyn ValueSource>))
        }
    }

    #[tokio::test]
    async fn covt_seed_precedes_values_delivered_during_subscribe() {
        let runner = Arc::new(RecordingRunner::new());
        let dispatcher = Dispatcher::new(runner.clone(), &EngineConfig::default()).unwrap();
        let resolver = ReplayingResolver(Arc::new(ReplayingSource {
            read: json!(5),
            pushed: json!(50),
        }));
        let mut analytic = descriptor(
            TriggerConfig::ChangeOfValueWithThreshold {
                input_index: 0,
                threshold: 2.0,
            },
            true,
        );
        analytic.followed.truncate(1);
        let ctx = ArmContext {
            analytic: &analytic,
            resolver: &resolver,
            dispatcher: &dispatcher,
        };

        let handles = arm(&ctx, 0, ChangeRule::Threshold(2.0)).await.unwrap();
        settle().await;
        assert_eq!(runner.call_count(), 2);

        let Handle::Binding(binding) = &handles[0] else {
            panic!("expected a value binding");
        };
        assert_eq!(binding.detector().previous(), json!(50.0));
    }
}
