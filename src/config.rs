//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Dispatch policy configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum time between assignment and a terminal signal.
    pub sla: Duration,
    /// How many times an item may be claimed before a timeout finalizes it as aborted.
    pub max_attempts: u32,
    /// How often the background sweep evaluates SLA timeouts.
    pub sweep_interval: Duration,
    /// Time between routine compliance checks of a worker.
    pub compliance_cadence: Duration,
    /// First retry delay after a failed compliance check.
    pub compliance_base_backoff: Duration,
    /// Upper bound for the compliance retry delay.
    pub compliance_max_backoff: Duration,
    /// How often the compliance task looks for due checks.
    pub compliance_poll_interval: Duration,
    /// Score weights per report kind.
    pub report_weights: ReportWeights,
    /// Number of most recent handled items considered per worker.
    pub score_window: usize,
    /// Aggregate score below which a worker is sent to a compliance check.
    pub score_threshold: i64,
    /// Capacity of the item event broadcast channel.
    pub event_capacity: usize,
    /// Credential for operator routes. Those routes are closed when unset.
    pub operator_key: Option<SecretString>,
}

/// Signed score adjustment for each report kind.
#[derive(Debug, Clone, Copy)]
pub struct ReportWeights {
    pub spam: i64,
    pub offensive: i64,
    pub feedback: i64,
}

impl Default for ReportWeights {
    fn default() -> Self {
        Self {
            spam: -3,
            offensive: -5,
            feedback: -1,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            sla: Duration::from_secs(120),
            max_attempts: 3,
            sweep_interval: Duration::from_secs(10),
            compliance_cadence: Duration::from_secs(6 * 3600), // 6 hours
            compliance_base_backoff: Duration::from_secs(60),
            compliance_max_backoff: Duration::from_secs(3600),
            compliance_poll_interval: Duration::from_secs(30),
            report_weights: ReportWeights::default(),
            score_window: 10,
            score_threshold: -12,
            event_capacity: 256,
            operator_key: None,
        }
    }
}

impl DispatchConfig {
    /// Build a config from `DISPATCH_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_var::<u64>(&lookup, key)?
                .map(Duration::from_secs)
                .unwrap_or(default))
        };

        let config = Self {
            sla: secs("DISPATCH_SLA_SECS", defaults.sla)?,
            max_attempts: parse_var(&lookup, "DISPATCH_MAX_ATTEMPTS")?
                .unwrap_or(defaults.max_attempts),
            sweep_interval: secs("DISPATCH_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            compliance_cadence: secs(
                "DISPATCH_COMPLIANCE_CADENCE_SECS",
                defaults.compliance_cadence,
            )?,
            compliance_base_backoff: secs(
                "DISPATCH_COMPLIANCE_BACKOFF_SECS",
                defaults.compliance_base_backoff,
            )?,
            compliance_max_backoff: secs(
                "DISPATCH_COMPLIANCE_MAX_BACKOFF_SECS",
                defaults.compliance_max_backoff,
            )?,
            compliance_poll_interval: secs(
                "DISPATCH_COMPLIANCE_POLL_SECS",
                defaults.compliance_poll_interval,
            )?,
            report_weights: ReportWeights {
                spam: parse_var(&lookup, "DISPATCH_WEIGHT_SPAM")?
                    .unwrap_or(defaults.report_weights.spam),
                offensive: parse_var(&lookup, "DISPATCH_WEIGHT_OFFENSIVE")?
                    .unwrap_or(defaults.report_weights.offensive),
                feedback: parse_var(&lookup, "DISPATCH_WEIGHT_FEEDBACK")?
                    .unwrap_or(defaults.report_weights.feedback),
            },
            score_window: parse_var(&lookup, "DISPATCH_SCORE_WINDOW")?
                .unwrap_or(defaults.score_window),
            score_threshold: parse_var(&lookup, "DISPATCH_SCORE_THRESHOLD")?
                .unwrap_or(defaults.score_threshold),
            event_capacity: defaults.event_capacity,
            operator_key: lookup("DISPATCH_OPERATOR_KEY")
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .map(SecretString::from),
        };

        if config.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DISPATCH_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if config.score_window == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DISPATCH_SCORE_WINDOW".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_env_gives_defaults() {
        let config = DispatchConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.sla, DispatchConfig::default().sla);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.score_threshold, -12);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = DispatchConfig::from_lookup(lookup_from(&[
            ("DISPATCH_SLA_SECS", "5"),
            ("DISPATCH_MAX_ATTEMPTS", "1"),
            ("DISPATCH_WEIGHT_OFFENSIVE", "-10"),
        ]))
        .unwrap();
        assert_eq!(config.sla, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.report_weights.offensive, -10);
    }

    #[test]
    fn unparsable_value_is_rejected() {
        let err = DispatchConfig::from_lookup(lookup_from(&[("DISPATCH_SLA_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("DISPATCH_SLA_SECS"));
    }

    #[test]
    fn operator_key_is_optional() {
        use secrecy::ExposeSecret;

        assert!(DispatchConfig::from_lookup(|_| None).unwrap().operator_key.is_none());
        let blank = DispatchConfig::from_lookup(lookup_from(&[("DISPATCH_OPERATOR_KEY", "  ")]))
            .unwrap();
        assert!(blank.operator_key.is_none());

        let set = DispatchConfig::from_lookup(lookup_from(&[("DISPATCH_OPERATOR_KEY", "op-secret")]))
            .unwrap();
        assert_eq!(
            set.operator_key.as_ref().map(|k| k.expose_secret()),
            Some("op-secret")
        );
    }

    #[test]
    fn zero_attempts_is_rejected() {
        assert!(DispatchConfig::from_lookup(lookup_from(&[("DISPATCH_MAX_ATTEMPTS", "0")])).is_err());
    }
}
