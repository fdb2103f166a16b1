use crate::cmd::{load_settings, Overrides};
use crate::output::{print_json, print_table};
use analytic_cli::{CommandRunner, FileRegistry, Settings};
use analytic_core::{
    ArmedAnalytic, Dispatcher, MemoryResolver, ReconcileSummary, Reconciler, TeardownReport,
};
use anyhow::Context;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Serialize)]
struct OnceReport {
    summary: ReconcileSummary,
    armed: Vec<ArmedAnalytic>,
    teardown: TeardownReport,
}

pub fn run(config: &Path, overrides: Overrides<'_>, once: bool, json: bool) -> anyhow::Result<()> {
    let settings = load_settings(config, overrides)?;
    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(async move {
        let reconciler = build_reconciler(&settings)?;
        if once {
            run_once(reconciler, json).await
        } else {
            run_daemon(reconciler, &settings, json).await
        }
    })
}

fn build_reconciler(settings: &Settings) -> anyhow::Result<Reconciler> {
    let resolver = Arc::new(MemoryResolver::new());
    let registry = Arc::new(FileRegistry::new(&settings.manifest, resolver.clone()));
    let runner = Arc::new(CommandRunner::new(&settings.runner));
    let dispatcher =
        Dispatcher::new(runner, &settings.engine).context("failed to create dispatcher")?;
    Ok(Reconciler::new(registry, resolver, dispatcher))
}

async fn run_once(mut reconciler: Reconciler, json: bool) -> anyhow::Result<()> {
    let summary = reconciler.reconcile().await;
    let armed = reconciler.snapshot();
    let teardown = reconciler.shutdown();

    if json {
        return print_json(&OnceReport {
            summary,
            armed,
            teardown,
        });
    }

    println!(
        "armed {} analytic(s), {} failed, {} trigger error(s)",
        summary.armed, summary.failed, summary.trigger_errors
    );
    if !armed.is_empty() {
        let rows = armed
            .iter()
            .map(|a| {
                vec![
                    a.id.to_string(),
                    a.name.clone(),
                    a.timers.to_string(),
                    a.cron_jobs.to_string(),
                    a.bindings.to_string(),
                ]
            })
            .collect();
        print_table(&["ID", "NAME", "TIMERS", "CRON", "BINDINGS"], rows);
    }
    Ok(())
}

async fn run_daemon(reconciler: Reconciler, settings: &Settings, json: bool) -> anyhow::Result<()> {
    let engine =
        analytic_core::start(reconciler, &settings.engine).context("failed to start engine")?;
    info!(manifest = %settings.manifest.display(), "orchestrator running, Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");

    let report = engine.stop().await.context("engine did not stop cleanly")?;
    if json {
        print_json(&report)?;
    }
    Ok(())
}
