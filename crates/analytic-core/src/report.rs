//! Periodic execution-duration summaries.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::types::{AnalyticId, ExecutionRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalyticStats {
    pub executions: usize,
    pub failures: usize,
    pub mean_ms: f64,
    pub max_ms: u64,
}

/// Aggregate over a window of execution records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DurationReport {
    pub executions: usize,
    pub failures: usize,
    pub mean_ms: f64,
    pub p95_ms: u64,
    pub max_ms: u64,
    pub per_analytic: BTreeMap<AnalyticId, AnalyticStats>,
}

impl DurationReport {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ExecutionRecord>) -> Self {
        let mut durations = Vec::new();
        let mut failures = 0;
        let mut per_analytic: BTreeMap<AnalyticId, (Vec<u64>, usize)> = BTreeMap::new();

        for record in records {
            let ms = record.duration_ms();
            let failed = record.outcome.is_failure();
            durations.push(ms);
            if failed {
                failures += 1;
            }
            let entry = per_analytic.entry(record.analytic.clone()).or_default();
            entry.0.push(ms);
            if failed {
                entry.1 += 1;
            }
        }

        if durations.is_empty() {
            return Self::default();
        }

        let per_analytic = per_analytic
            .into_iter()
            .map(|(id, (ms, failures))| {
                let stats = AnalyticStats {
                    executions: ms.len(),
                    failures,
                    mean_ms: mean(&ms),
                    max_ms: ms.iter().copied().max().unwrap_or(0),
                };
                (id, stats)
            })
            .collect();

        durations.sort_unstable();
        Self {
            executions: durations.len(),
            failures,
            mean_ms: mean(&durations),
            p95_ms: percentile(&durations, 95),
            max_ms: durations.last().copied().unwrap_or(0),
            per_analytic,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.executions == 0
    }
}

fn mean(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<u64>() as f64 / values.len() as f64
}

/// Nearest-rank percentile over an already sorted slice.
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}
