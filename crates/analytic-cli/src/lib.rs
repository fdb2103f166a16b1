//! File- and subprocess-backed collaborators for `analytic-orchestrator`.

pub mod manifest;
pub mod runner;
pub mod settings;

pub use manifest::{FileRegistry, Manifest, ManifestIssue, Severity};
pub use runner::CommandRunner;
pub use settings::{RunnerSettings, Settings};
