use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Raw value observed on a followed entity input.
///
/// Equality is the JSON value's own structural equality: `10` and `10.0` are
/// different numbers, strings compare byte-wise, objects compare key-by-key.
pub type Value = serde_json::Value;

/// Opaque result payload returned by the analysis runner.
pub type AnalysisResult = serde_json::Value;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalyticId(String);

impl AnalyticId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnalyticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AnalyticId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AnalyticId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A followed entity: the target an analytic is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerConfig
// ---------------------------------------------------------------------------

/// One way an analytic can be triggered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Recurring timer, period in milliseconds.
    Interval { period_ms: u64 },
    /// Six-field cron expression (`sec min hour day-of-month month day-of-week`).
    Cron { expression: String },
    /// Fires when the tracked input changes value.
    #[serde(rename = "cov")]
    ChangeOfValue { input_index: usize },
    /// Fires when the tracked input moves strictly more than `threshold`
    /// away from the last value that fired.
    #[serde(rename = "cov_threshold")]
    ChangeOfValueWithThreshold { input_index: usize, threshold: f64 },
}

impl TriggerConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TriggerConfig::Interval { .. } => "interval",
            TriggerConfig::Cron { .. } => "cron",
            TriggerConfig::ChangeOfValue { .. } => "cov",
            TriggerConfig::ChangeOfValueWithThreshold { .. } => "cov_threshold",
        }
    }
}

impl fmt::Display for TriggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerConfig::Interval { period_ms } => write!(f, "interval({period_ms}ms)"),
            TriggerConfig::Cron { expression } => write!(f, "cron({expression})"),
            TriggerConfig::ChangeOfValue { input_index } => write!(f, "cov(input {input_index})"),
            TriggerConfig::ChangeOfValueWithThreshold {
                input_index,
                threshold,
            } => write!(f, "cov_threshold(input {input_index}, > {threshold})"),
        }
    }
}

/// Trigger configuration and activation flag for one analytic, as read from
/// the registry during a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub fire_immediately: bool,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

// ---------------------------------------------------------------------------
// Analytic descriptors
// ---------------------------------------------------------------------------

/// Registry enumeration entry: enough to identify an analytic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticRef {
    pub id: AnalyticId,
    pub name: String,
}

/// Everything the engine needs to arm one analytic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticDescriptor {
    pub id: AnalyticId,
    pub name: String,
    pub active: bool,
    pub fire_immediately: bool,
    pub triggers: Vec<TriggerConfig>,
    pub followed: Vec<Entity>,
}

impl AnalyticDescriptor {
    pub fn from_parts(analytic: AnalyticRef, settings: TriggerSettings, followed: Vec<Entity>) -> Self {
        Self {
            id: analytic.id,
            name: analytic.name,
            active: settings.active,
            fire_immediately: settings.fire_immediately,
            triggers: settings.triggers,
            followed,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { results: usize },
    Failed { reason: String },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

/// One analysis invocation, produced by the dispatcher when it completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub analytic: AnalyticId,
    pub entity: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Run time on the monotonic clock. The timestamps are wall-clock and
    /// may jump.
    pub elapsed_ms: u64,
    pub outcome: Outcome,
}

impl ExecutionRecord {
    pub fn duration_ms(&self) -> u64 {
        self.elapsed_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_config_yaml_tagged() {
        let yaml = r#"
- type: interval
  period_ms: 5000
- type: cron
  expression: "0 */5 * * * *"
- type: cov
  input_index: 0
- type: cov_threshold
  input_index: 1
  threshold: 2.5
"#;
        let triggers: Vec<TriggerConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(triggers.len(), 4);
        assert_eq!(triggers[0], TriggerConfig::Interval { period_ms: 5000 });
        assert_eq!(triggers[2].kind_name(), "cov");
        assert!(matches!(
            triggers[3],
            TriggerConfig::ChangeOfValueWithThreshold { input_index: 1, threshold } if threshold == 2.5
        ));
    }

    #[test]
    fn unknown_trigger_kind_is_rejected() {
        let yaml = "type: webhook\nurl: http://localhost\n";
        assert!(serde_yaml::from_str::<TriggerConfig>(yaml).is_err());
    }

    #[test]
    fn settings_default_inactive() {
        let settings: TriggerSettings = serde_yaml::from_str("{}").unwrap();
        assert!(!settings.active);
        assert!(!settings.fire_immediately);
        assert!(settings.triggers.is_empty());
    }

    #[test]
    fn execution_record_duration() {
        let started_at = Utc::now();
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            analytic: AnalyticId::from("a1"),
            entity: None,
            started_at,
            // Wall clock stepped backwards mid-run.
            finished_at: started_at - chrono::Duration::seconds(5),
            elapsed_ms: 250,
            outcome: Outcome::Succeeded { results: 1 },
        };
        assert_eq!(record.duration_ms(), 250);
        assert!(!record.outcome.is_failure());
    }

    #[test]
    fn execution_record_serializes_to_json() {
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            analytic: AnalyticId::from("a1"),
            entity: Some("e1".into()),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            elapsed_ms: 12,
            outcome: Outcome::Succeeded { results: 2 },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], record.id.to_string());

        let back: ExecutionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
