//! Background loops driving the [`Reconciler`].
//!
//! [`start`] moves the reconciler onto its own task, which re-runs
//! reconciliation every `reconcile_period` and serves commands from
//! [`EngineHandle`]. A second task logs a [`DurationReport`] every
//! `report_period`. Both stop on [`EngineHandle::stop`], after which every
//! armed trigger has been released.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, Result};
use crate::handles::{ArmedAnalytic, TeardownReport};
use crate::reconciler::{ArmOutcome, ReconcileSummary, Reconciler};
use crate::report::DurationReport;
use crate::types::AnalyticId;

const COMMAND_BUFFER: usize = 32;

enum Command {
    ReconcileNow(oneshot::Sender<ReconcileSummary>),
    ForceRearm(AnalyticId, oneshot::Sender<Result<Option<ArmOutcome>>>),
    Snapshot(oneshot::Sender<Vec<ArmedAnalytic>>),
}

/// Control surface for a running engine.
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    stop: watch::Sender<bool>,
    reconcile_task: JoinHandle<TeardownReport>,
    report_task: JoinHandle<()>,
    dispatcher: Dispatcher,
}

/// Start the reconcile and report loops on the current runtime.
///
/// The first reconciliation runs immediately; later ones follow every
/// `reconcile_period`. A pass that overruns the period delays the next tick
/// instead of bunching ticks up.
pub fn start(reconciler: Reconciler, config: &EngineConfig) -> Result<EngineHandle> {
    config.validate()?;
    tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

    let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (stop, stop_rx) = watch::channel(false);
    let dispatcher = reconciler.dispatcher().clone();
    dispatcher.open_window();

    info!(
        reconcile_period_ms = config.reconcile_period_ms,
        report_period_ms = config.report_period_ms,
        overlap = ?config.overlap,
        "starting engine"
    );

    let reconcile_task = tokio::spawn(reconcile_loop(
        reconciler,
        config.reconcile_period(),
        command_rx,
        stop_rx.clone(),
    ));
    let report_task = tokio::spawn(report_loop(
        dispatcher.clone(),
        config.report_period(),
        stop_rx,
    ));

    Ok(EngineHandle {
        commands,
        stop,
        reconcile_task,
        report_task,
        dispatcher,
    })
}

async fn reconcile_loop(
    mut reconciler: Reconciler,
    period: Duration,
    mut commands: mpsc::Receiver<Command>,
    mut stop: watch::Receiver<bool>,
) -> TeardownReport {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let summary = reconciler.reconcile().await;
                if summary.changed() {
                    info!(
                        armed = summary.armed,
                        disarmed = summary.disarmed,
                        failed = summary.failed,
                        "reconciled"
                    );
                }
            }
            Some(command) = commands.recv() => match command {
                Command::ReconcileNow(reply) => {
                    let _ = reply.send(reconciler.reconcile().await);
                }
                Command::ForceRearm(id, reply) => {
                    let _ = reply.send(reconciler.force_rearm(&id).await);
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(reconciler.snapshot());
                }
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    reconciler.shutdown()
}

async fn report_loop(dispatcher: Dispatcher, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; there is nothing to report yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                log_report(&DurationReport::from_records(&dispatcher.take_window()));
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
        }
    }
}

fn log_report(report: &DurationReport) {
    if report.is_empty() {
        debug!("no executions since last report");
        return;
    }
    info!(
        executions = report.executions,
        failures = report.failures,
        mean_ms = report.mean_ms,
        p95_ms = report.p95_ms,
        max_ms = report.max_ms,
        "execution duration report"
    );
    for (id, stats) in &report.per_analytic {
        debug!(
            analytic = %id,
            executions = stats.executions,
            failures = stats.failures,
            mean_ms = stats.mean_ms,
            max_ms = stats.max_ms,
            "analytic durations"
        );
    }
}

impl EngineHandle {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Run a reconciliation pass now, outside the regular schedule.
    pub async fn reconcile_now(&self) -> Result<ReconcileSummary> {
        self.request(Command::ReconcileNow).await
    }

    /// Disarm and re-arm one analytic with its current configuration.
    pub async fn force_rearm(&self, id: AnalyticId) -> Result<Option<ArmOutcome>> {
        self.request(|reply| Command::ForceRearm(id, reply)).await?
    }

    pub async fn snapshot(&self) -> Result<Vec<ArmedAnalytic>> {
        self.request(Command::Snapshot).await
    }

    /// Stop both loops and release every armed trigger.
    ///
    /// Executions already dispatched keep running to completion.
    pub async fn stop(self) -> Result<TeardownReport> {
        let _ = self.stop.send(true);
        let report = self
            .reconcile_task
            .await
            .map_err(|_| EngineError::Stopped)?;
        if let Err(e) = self.report_task.await {
            warn!("report loop ended abnormally: {e}");
        }
        info!(
            released = report.released,
            failed = report.failed,
            "engine stopped"
        );
        Ok(report)
    }
}
