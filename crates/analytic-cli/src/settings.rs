//! `orchestrator.yaml` settings.
//!
//! ```yaml
//! manifest: analytics.yaml
//! engine:
//!   reconcile_period_ms: 10000
//!   report_period_ms: 60000
//!   overlap: skip
//! runner:
//!   program: ./bin/run-analysis
//!   args: ["--format", "json"]
//!   working_dir: /srv/analytics
//! ```

use analytic_core::{parse_period, EngineConfig};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SETTINGS_FILE: &str = "orchestrator.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Analytics manifest. Relative paths resolve against the settings file.
    pub manifest: PathBuf,
    #[serde(default)]
    pub engine: EngineConfig,
    pub runner: RunnerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        let mut settings: Settings = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse settings {}", path.display()))?;

        if settings.manifest.is_relative() {
            if let Some(dir) = path.parent() {
                settings.manifest = dir.join(&settings.manifest);
            }
        }
        if let Some(working_dir) = settings.runner.working_dir.take() {
            settings.runner.working_dir = Some(match path.parent() {
                Some(dir) if working_dir.is_relative() => dir.join(working_dir),
                _ => working_dir,
            });
        }
        Ok(settings)
    }

    /// Apply period overrides from flags or the environment, then validate
    /// the engine section.
    pub fn apply_overrides(
        &mut self,
        reconcile_period: Option<&str>,
        report_period: Option<&str>,
    ) -> anyhow::Result<()> {
        if let Some(raw) = reconcile_period {
            let period = parse_period(raw).context("invalid reconcile period")?;
            self.engine.reconcile_period_ms = period.as_millis() as u64;
        }
        if let Some(raw) = report_period {
            let period = parse_period(raw).context("invalid report period")?;
            self.engine.report_period_ms = period.as_millis() as u64;
        }
        self.engine.validate().context("invalid engine settings")?;
        Ok(())
    }
}
