use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::handles::CronHandle;
use crate::registry::FireCallback;

const CRON_FIELDS: usize = 6;

/// Parse a six-field cron expression (`sec min hour dom month dow`).
pub fn parse(expression: &str) -> Result<Schedule> {
    let fields = expression.split_whitespace().count();
    if fields != CRON_FIELDS {
        return Err(EngineError::InvalidCron {
            expression: expression.to_string(),
            reason: format!("expected {CRON_FIELDS} fields, found {fields}"),
        });
    }
    Schedule::from_str(expression).map_err(|e| EngineError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Arm a cron schedule that calls `on_fire` at every matching UTC boundary.
///
/// Invalid expressions are rejected here rather than at the first tick.
pub fn arm(expression: &str, on_fire: FireCallback, fire_immediately: bool) -> Result<CronHandle> {
    let schedule = parse(expression)?;
    if fire_immediately {
        on_fire();
    }
    let task = tokio::spawn(run_schedule(schedule, on_fire, Utc::now()));
    Ok(CronHandle::new(task, expression))
}

async fn run_schedule(schedule: Schedule, on_fire: FireCallback, start: DateTime<Utc>) {
    let mut last = start;
    loop {
        // Occurrences already in the past are skipped, not replayed.
        let from = last.max(Utc::now());
        let Some(next) = schedule.after(&from).next() else {
            debug!("cron schedule has no further occurrences");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;
        on_fire();
        last = next;
    }
}
