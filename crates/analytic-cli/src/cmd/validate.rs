use crate::cmd::{load_settings, Overrides};
use crate::output::print_json;
use analytic_cli::{CommandRunner, Manifest, ManifestIssue, Severity};
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct ValidationReport {
    manifest: PathBuf,
    contexts: usize,
    analytics: usize,
    active: usize,
    runner: Option<PathBuf>,
    issues: Vec<ManifestIssue>,
}

impl ValidationReport {
    fn errors(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .count()
    }
}

pub fn run(config: &Path, overrides: Overrides<'_>, json: bool) -> anyhow::Result<()> {
    let settings = load_settings(config, overrides)?;
    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let manifest = rt
        .block_on(Manifest::load(&settings.manifest))
        .with_context(|| format!("failed to load manifest {}", settings.manifest.display()))?;

    let mut issues = manifest.check();
    let runner = match CommandRunner::new(&settings.runner).locate() {
        Ok(path) => Some(path),
        Err(e) => {
            issues.push(ManifestIssue {
                severity: Severity::Error,
                analytic: String::new(),
                message: format!("runner program '{}' not found: {e}", settings.runner.program),
            });
            None
        }
    };

    let report = ValidationReport {
        manifest: settings.manifest.clone(),
        contexts: manifest.catalogue.len(),
        analytics: manifest.analytics().count(),
        active: manifest.analytics().filter(|a| a.active).count(),
        runner,
        issues,
    };

    if json {
        print_json(&report)?;
    } else {
        println!(
            "{}: {} context(s), {} analytic(s), {} active",
            report.manifest.display(),
            report.contexts,
            report.analytics,
            report.active
        );
        for issue in &report.issues {
            let level = match issue.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            };
            if issue.analytic.is_empty() {
                println!("  {level}: {}", issue.message);
            } else {
                println!("  {level} [{}]: {}", issue.analytic, issue.message);
            }
        }
    }

    let errors = report.errors();
    if errors > 0 {
        anyhow::bail!("{errors} error(s) found");
    }
    if !json {
        println!("ok");
    }
    Ok(())
}
