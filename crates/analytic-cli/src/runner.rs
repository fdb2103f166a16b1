//! Subprocess-backed analysis runner.
//!
//! Each execution spawns the configured program once. The analytic id is
//! passed in `ANALYTIC_ID`, and for entity-scoped runs the entity id in
//! `ANALYTIC_ENTITY`. The program writes its results as JSON on stdout: an
//! array is taken as one result per element, anything else as one result.
//! Stderr is captured, and a failing run carries an excerpt of it in the error.

use analytic_core::{
    AnalysisResult, AnalysisRunner, AnalyticId, EngineError, Entity, Result, Value,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::settings::RunnerSettings;

pub const ENV_ANALYTIC_ID: &str = "ANALYTIC_ID";
pub const ENV_ANALYTIC_ENTITY: &str = "ANALYTIC_ENTITY";

/// Longest stderr excerpt carried into a failure reason.
const STDERR_HINT_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new(settings: &RunnerSettings) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            working_dir: settings.working_dir.clone(),
        }
    }

    /// Resolve the program on `PATH` (or as a path) without running it.
    pub fn locate(&self) -> std::result::Result<PathBuf, which::Error> {
        match &self.working_dir {
            Some(dir) => which::which_in(&self.program, std::env::var_os("PATH"), dir),
            None => which::which(&self.program),
        }
    }

    async fn invoke(&self, analytic: &AnalyticId, entity: Option<&Entity>) -> Result<Value> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(ENV_ANALYTIC_ID, analytic.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(entity) = entity {
            cmd.env(ENV_ANALYTIC_ENTITY, &entity.id);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let failed = |reason: String| EngineError::Execution {
            analytic: analytic.to_string(),
            reason,
        };

        let output = cmd
            .output()
            .await
            .map_err(|e| failed(format!("failed to spawn {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let hint: String = stderr.trim().chars().take(STDERR_HINT_CHARS).collect();
            return Err(failed(format!("{}: {hint}", output.status)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(
            analytic = %analytic,
            bytes = output.stdout.len(),
            "runner finished"
        );
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(stdout.trim())
            .map_err(|e| failed(format!("stdout is not valid JSON: {e}")))
    }
}

#[async_trait]
impl AnalysisRunner for CommandRunner {
    async fn run(&self, analytic: &AnalyticId) -> Result<Vec<AnalysisResult>> {
        Ok(match self.invoke(analytic, None).await? {
            Value::Null => Vec::new(),
            Value::Array(results) => results,
            other => vec![other],
        })
    }

    async fn run_entity(&self, analytic: &AnalyticId, entity: &Entity) -> Result<AnalysisResult> {
        self.invoke(analytic, Some(entity)).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell(script: &str) -> CommandRunner {
        CommandRunner::new(&RunnerSettings {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: None,
        })
    }

    #[tokio::test]
    async fn array_output_is_one_result_per_element() {
        let runner = shell(r#"echo "[1, {\"id\": \"$ANALYTIC_ID\"}]""#);
        let results = runner.run(&AnalyticId::from("a1")).await.unwrap();
        assert_eq!(results, vec![json!(1), json!({ "id": "a1" })]);
    }

    #[tokio::test]
    async fn entity_run_sees_entity_env() {
        let runner = shell(r#"echo "{\"entity\": \"$ANALYTIC_ENTITY\"}""#);
        let result = runner
            .run_entity(&AnalyticId::from("a1"), &Entity::new("e7", "E7"))
            .await
            .unwrap();
        assert_eq!(result, json!({ "entity": "e7" }));
    }

    #[tokio::test]
    async fn empty_output_is_no_results() {
        let runner = shell("true");
        assert!(runner.run(&AnalyticId::from("a1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_execution_error() {
        let runner = shell("echo 'disk on fire' >&2; exit 3");
        let err = runner.run(&AnalyticId::from("a1")).await.unwrap_err();
        assert_eq!(err.kind(), analytic_core::ErrorKind::Execution);
        assert!(err.to_string().contains("disk on fire"));
    }

    #[tokio::test]
    async fn garbage_output_is_an_execution_error() {
        let runner = shell("echo not-json");
        let err = runner.run(&AnalyticId::from("a1")).await.unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn locate_finds_programs_on_path() {
        assert!(shell("true").locate().is_ok());
        let missing = CommandRunner::new(&RunnerSettings {
            program: "definitely-not-an-installed-program".into(),
            args: Vec::new(),
            working_dir: None,
        });
        assert!(missing.locate().is_err());
    }
}
