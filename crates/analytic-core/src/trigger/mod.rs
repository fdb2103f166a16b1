//! Trigger strategies.
//!
//! Each [`TriggerConfig`] variant has exactly one strategy. Arming returns the
//! [`Handle`]s that keep the trigger alive; the reconciler stores them in the
//! handle table and releasing them disarms the trigger.

pub mod cov;
pub mod cron;
pub mod interval;

use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, Result};
use crate::handles::Handle;
use crate::registry::ValueSourceResolver;
use crate::types::{AnalyticDescriptor, TriggerConfig};

pub use cov::{Change, ChangeDetector, ChangeRule};

/// Everything a strategy may need while arming one trigger of one analytic.
pub struct ArmContext<'a> {
    pub analytic: &'a AnalyticDescriptor,
    pub resolver: &'a dyn ValueSourceResolver,
    pub dispatcher: &'a Dispatcher,
}

/// Arm a single trigger. Errors apply to this trigger only.
pub async fn arm(trigger: &TriggerConfig, ctx: &ArmContext<'_>) -> Result<Vec<Handle>> {
    let analytic = ctx.analytic;
    match trigger {
        TriggerConfig::Interval { period_ms } => {
            let on_fire = ctx.dispatcher.fire_callback(analytic.id.clone(), None);
            let timer = interval::arm(
                Duration::from_millis(*period_ms),
                on_fire,
                analytic.fire_immediately,
            )?;
            Ok(vec![Handle::Timer(timer)])
        }
        TriggerConfig::Cron { expression } => {
            let on_fire = ctx.dispatcher.fire_callback(analytic.id.clone(), None);
            let job = cron::arm(expression, on_fire, analytic.fire_immediately)?;
            Ok(vec![Handle::Cron(job)])
        }
        TriggerConfig::ChangeOfValue { input_index } => {
            cov::arm(ctx, *input_index, ChangeRule::Exact).await
        }
        TriggerConfig::ChangeOfValueWithThreshold {
            input_index,
            threshold,
        } => cov::arm(ctx, *input_index, ChangeRule::Threshold(*threshold)).await,
    }
}

/// Check a trigger without arming it.
pub fn validate(trigger: &TriggerConfig) -> Result<()> {
    match trigger {
        TriggerConfig::Interval { period_ms } => {
            if *period_ms == 0 {
                return Err(EngineError::Config(
                    "interval period must be greater than zero".into(),
                ));
            }
            Ok(())
        }
        TriggerConfig::Cron { expression } => cron::parse(expression).map(|_| ()),
        TriggerConfig::ChangeOfValue { .. } => Ok(()),
        TriggerConfig::ChangeOfValueWithThreshold { threshold, .. } => {
            ChangeRule::Threshold(*threshold).validate()
        }
    }
}
