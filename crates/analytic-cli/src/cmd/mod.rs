pub mod run;
pub mod validate;

use analytic_cli::Settings;
use std::path::Path;

/// Period overrides from flags or the environment.
#[derive(Clone, Copy, Default)]
pub struct Overrides<'a> {
    pub reconcile_period: Option<&'a str>,
    pub report_period: Option<&'a str>,
}

pub fn load_settings(path: &Path, overrides: Overrides<'_>) -> anyhow::Result<Settings> {
    let mut settings = Settings::load(path)?;
    settings.apply_overrides(overrides.reconcile_period, overrides.report_period)?;
    Ok(settings)
}
