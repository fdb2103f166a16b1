use thiserror::Error;

/// Coarse classification of an [`EngineError`], used as a structured log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Resolution,
    Execution,
    Teardown,
    Registry,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Resolution => "resolution",
            ErrorKind::Execution => "execution",
            ErrorKind::Teardown => "teardown",
            ErrorKind::Registry => "registry",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid trigger config: {0}")]
    Config(String),

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("invalid period '{raw}': must be a positive integer")]
    InvalidPeriod { raw: String },

    #[error("no value source for entity '{entity}' input {input_index}")]
    Resolution { entity: String, input_index: usize },

    #[error("analysis failed for '{analytic}': {reason}")]
    Execution { analytic: String, reason: String },

    #[error("release failed: {0}")]
    Teardown(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("no tokio runtime available: the engine must be created inside a runtime")]
    NoRuntime,

    #[error("engine loop is not running")]
    Stopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_)
            | EngineError::InvalidCron { .. }
            | EngineError::InvalidPeriod { .. }
            | EngineError::Yaml(_) => ErrorKind::Config,
            EngineError::Resolution { .. } => ErrorKind::Resolution,
            EngineError::Execution { .. } => ErrorKind::Execution,
            EngineError::Teardown(_) => ErrorKind::Teardown,
            EngineError::Registry(_) => ErrorKind::Registry,
            EngineError::NoRuntime
            | EngineError::Stopped
            | EngineError::Io(_)
            | EngineError::Json(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_error_is_config_kind() {
        let err = EngineError::InvalidCron {
            expression: "* *".into(),
            reason: "too few fields".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("'* *'"));
    }

    #[test]
    fn kinds_have_stable_names() {
        assert_eq!(ErrorKind::Teardown.as_str(), "teardown");
        assert_eq!(ErrorKind::Resolution.to_string(), "resolution");
    }
}
