use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// OverlapPolicy
// ---------------------------------------------------------------------------

/// What the dispatcher does when a trigger fires while an execution for the
/// same analytic and entity is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Start another execution alongside the running one.
    #[default]
    Allow,
    /// Drop the new fire.
    Skip,
    /// Queue the new fire behind the running one.
    Serialize,
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_reconcile_period_ms")]
    pub reconcile_period_ms: u64,
    #[serde(default = "default_report_period_ms")]
    pub report_period_ms: u64,
    /// Maximum number of execution records kept in the rolling duration log.
    #[serde(default = "default_duration_log_capacity")]
    pub duration_log_capacity: usize,
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

fn default_reconcile_period_ms() -> u64 {
    10_000
}

fn default_report_period_ms() -> u64 {
    60_000
}

fn default_duration_log_capacity() -> usize {
    1_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_period_ms: default_reconcile_period_ms(),
            report_period_ms: default_report_period_ms(),
            duration_log_capacity: default_duration_log_capacity(),
            overlap: OverlapPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn reconcile_period(&self) -> Duration {
        Duration::from_millis(self.reconcile_period_ms)
    }

    pub fn report_period(&self) -> Duration {
        Duration::from_millis(self.report_period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconcile_period_ms == 0 {
            return Err(EngineError::InvalidPeriod {
                raw: self.reconcile_period_ms.to_string(),
            });
        }
        if self.report_period_ms == 0 {
            return Err(EngineError::InvalidPeriod {
                raw: self.report_period_ms.to_string(),
            });
        }
        if self.duration_log_capacity == 0 {
            return Err(EngineError::Config(
                "duration_log_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Parse an externally supplied period in milliseconds.
///
/// Anything that is not a strictly positive integer is a configuration error.
pub fn parse_period(raw: &str) -> Result<Duration> {
    let invalid = || EngineError::InvalidPeriod {
        raw: raw.to_string(),
    };
    let ms: i64 = raw.trim().parse().map_err(|_| invalid())?;
    if ms <= 0 {
        return Err(invalid());
    }
    Ok(Duration::from_millis(ms as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_period_accepts_positive_integers() {
        assert_eq!(parse_period("1500").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_period(" 30000\n").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parse_period_rejects_zero_negative_and_garbage() {
        for raw in ["0", "-10", "ten", "", "1.5"] {
            let err = parse_period(raw).unwrap_err();
            assert!(matches!(err, EngineError::InvalidPeriod { .. }), "{raw}");
        }
    }

    #[test]
    fn defaults_from_empty_yaml() {
        let cfg: EngineConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.overlap, OverlapPolicy::Allow);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn overlap_policy_snake_case() {
        let cfg: EngineConfig = serde_yaml::from_str("overlap: serialize\n").unwrap();
        assert_eq!(cfg.overlap, OverlapPolicy::Serialize);
    }

    #[test]
    fn validate_rejects_zero_periods() {
        let cfg = EngineConfig {
            reconcile_period_ms: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            duration_log_capacity: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
