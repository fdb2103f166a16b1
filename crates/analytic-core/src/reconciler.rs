//! Reconciliation: bring armed state in line with the registry.
//!
//! One pass enumerates every analytic, compares its activation flag with the
//! handle table, and arms or disarms the difference. An analytic that is
//! already armed is left alone even if its trigger configuration changed;
//! [`Reconciler::force_rearm`] picks up new configuration explicitly.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::handles::{AnalyticHandles, ArmedAnalytic, HandleTable, TeardownReport};
use crate::registry::{Registry, ValueSourceResolver};
use crate::trigger::{self, ArmContext};
use crate::types::{AnalyticDescriptor, AnalyticId, AnalyticRef};

/// Counts for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub armed: usize,
    pub disarmed: usize,
    pub unchanged: usize,
    /// Analytics (or whole contexts) whose registry reads failed this pass.
    pub failed: usize,
    /// Individual triggers skipped while arming.
    pub trigger_errors: usize,
    pub released: usize,
    pub release_failures: usize,
}

impl ReconcileSummary {
    fn record_disarm(&mut self, report: TeardownReport) {
        self.disarmed += 1;
        self.released += report.released;
        self.release_failures += report.failed;
    }

    pub fn changed(&self) -> bool {
        self.armed > 0 || self.disarmed > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArmOutcome {
    pub resources: usize,
    pub trigger_errors: usize,
}

/// Sole owner and writer of the [`HandleTable`].
pub struct Reconciler {
    registry: Arc<dyn Registry>,
    resolver: Arc<dyn ValueSourceResolver>,
    dispatcher: Dispatcher,
    table: HandleTable,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn Registry>,
        resolver: Arc<dyn ValueSourceResolver>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            registry,
            resolver,
            dispatcher,
            table: HandleTable::new(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn table(&self) -> &HandleTable {
        &self.table
    }

    pub fn snapshot(&self) -> Vec<ArmedAnalytic> {
        self.table.snapshot()
    }

    /// Run one full pass over the registry.
    ///
    /// Never fails as a whole: a registry error for one analytic or context is
    /// logged and counted, and the pass moves on. Armed analytics that no
    /// longer appear in the registry are disarmed, but only when every context
    /// was enumerated successfully.
    pub async fn reconcile(&mut self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let contexts = match self.registry.list_contexts().await {
            Ok(contexts) => contexts,
            Err(e) => {
                error!(kind = %e.kind(), "failed to list contexts: {e}");
                summary.failed += 1;
                return summary;
            }
        };

        let mut seen = HashSet::new();
        let mut complete = true;
        for context in contexts {
            let analytics = match self.registry.list_analytics(&context.id).await {
                Ok(analytics) => analytics,
                Err(e) => {
                    warn!(context = %context.id, kind = %e.kind(), "failed to list analytics: {e}");
                    summary.failed += 1;
                    complete = false;
                    continue;
                }
            };
            for analytic in analytics {
                let id = analytic.id.clone();
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Err(e) = self.reconcile_one(analytic, &mut summary).await {
                    warn!(analytic = %id, kind = %e.kind(), "reconciliation failed: {e}");
                    summary.failed += 1;
                }
            }
        }

        if complete {
            for id in self.table.ids() {
                if !seen.contains(&id) {
                    info!(analytic = %id, "analytic left the registry");
                    let report = self.disarm(&id);
                    summary.record_disarm(report);
                }
            }
        }

        debug!(
            armed = summary.armed,
            disarmed = summary.disarmed,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "reconciliation pass complete"
        );
        summary
    }

    async fn reconcile_one(
        &mut self,
        analytic: AnalyticRef,
        summary: &mut ReconcileSummary,
    ) -> Result<()> {
        let settings = self.registry.trigger_config(&analytic.id).await?;
        let handled = self.table.contains(&analytic.id);

        match (settings.active, handled) {
            (true, true) | (false, false) => summary.unchanged += 1,
            (false, true) => {
                let report = self.disarm(&analytic.id);
                summary.record_disarm(report);
            }
            (true, false) => {
                info!(analytic = %analytic.id, name = %analytic.name, "handling analytic");
                let followed = self.registry.followed_entities(&analytic.id).await?;
                let descriptor = AnalyticDescriptor::from_parts(analytic, settings, followed);
                let outcome = self.arm(descriptor).await;
                summary.armed += 1;
                summary.trigger_errors += outcome.trigger_errors;
            }
        }
        Ok(())
    }

    /// Arm every trigger of `descriptor` and record the handles.
    ///
    /// A trigger that fails to arm is skipped; the analytic is still recorded
    /// as armed with whatever the other triggers produced.
    async fn arm(&mut self, descriptor: AnalyticDescriptor) -> ArmOutcome {
        let mut handles = AnalyticHandles::new(descriptor.name.clone());
        let mut trigger_errors = 0;
        {
            let ctx = ArmContext {
                analytic: &descriptor,
                resolver: self.resolver.as_ref(),
                dispatcher: &self.dispatcher,
            };
            for config in &descriptor.triggers {
                match trigger::arm(config, &ctx).await {
                    Ok(armed) => handles.extend(armed),
                    Err(e) => {
                        warn!(
                            analytic = %descriptor.id,
                            trigger = %config,
                            kind = %e.kind(),
                            "skipping trigger: {e}"
                        );
                        trigger_errors += 1;
                    }
                }
            }
        }

        let outcome = ArmOutcome {
            resources: handles.resource_count(),
            trigger_errors,
        };
        info!(
            analytic = %descriptor.id,
            resources = outcome.resources,
            trigger_errors,
            "armed analytic"
        );
        self.table.insert(descriptor.id, handles);
        outcome
    }

    fn disarm(&mut self, id: &AnalyticId) -> TeardownReport {
        let Some(handles) = self.table.remove(id) else {
            return TeardownReport::default();
        };
        let report = handles.release(id);
        info!(
            analytic = %id,
            released = report.released,
            failed = report.failed,
            "disarmed analytic"
        );
        report
    }

    /// Disarm `id` and, if the registry still marks it active, arm it again
    /// with its current configuration.
    ///
    /// Returns `None` when the analytic ended up disarmed.
    pub async fn force_rearm(&mut self, id: &AnalyticId) -> Result<Option<ArmOutcome>> {
        let name = self.table.get(id).map(|h| h.name().to_string());
        self.disarm(id);

        let settings = self.registry.trigger_config(id).await?;
        if !settings.active {
            return Ok(None);
        }
        let followed = self.registry.followed_entities(id).await?;
        let analytic = AnalyticRef {
            id: id.clone(),
            name: name.unwrap_or_else(|| id.to_string()),
        };
        let descriptor = AnalyticDescriptor::from_parts(analytic, settings, followed);
        Ok(Some(self.arm(descriptor).await))
    }

    /// Release every armed analytic.
    pub fn shutdown(&mut self) -> TeardownReport {
        let count = self.table.len();
        let report = self.table.clear();
        info!(
            analytics = count,
            released = report.released,
            failed = report.failed,
            "released all triggers"
        );
        report
    }
}
