//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// A fixed-interval retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Seconds to wait before each attempt.
    pub interval_seconds: u64,
    /// Maximum number of failed attempts before giving up.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(interval_seconds: u64, max_attempts: u32) -> Self {
        Self {
            interval_seconds,
            max_attempts,
        }
    }

    /// Operation polling: 10 s between polls, 5 transient failures tolerated.
    #[must_use]
    pub const fn polling() -> Self {
        Self::new(10, 5)
    }

    /// Delete confirmation: up to 500 reads, 5 s apart.
    #[must_use]
    pub const fn delete_confirmation() -> Self {
        Self::new(5, 500)
    }

    /// The wait between attempts as a `Duration`.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::polling()
    }
}

/// Configuration for the converge engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Policy for polling operations to completion.
    #[serde(default = "RetryPolicy::polling")]
    pub poll: RetryPolicy,

    /// Policy for confirming that a deleted resource is gone.
    #[serde(default = "RetryPolicy::delete_confirmation")]
    pub delete_confirmation: RetryPolicy,

    /// Ceiling on a whole resource operation, in seconds.
    #[serde(default = "ControlConfig::default_operation_timeout")]
    pub operation_timeout_seconds: u64,
}

impl ControlConfig {
    const fn default_operation_timeout() -> u64 {
        45 * 60 // 45 minutes
    }

    /// The per-operation ceiling as a `Duration`.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }

    /// Load configuration from `CONVERGE_*` environment variables, falling
    /// back to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` if a variable is set but not a number,
    /// or if the resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`ControlConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "CONVERGE_POLL_INTERVAL_SECONDS")? {
            config.poll.interval_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "CONVERGE_POLL_RETRIES")? {
            config.poll.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "CONVERGE_DELETE_INTERVAL_SECONDS")? {
            config.delete_confirmation.interval_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "CONVERGE_DELETE_RETRIES")? {
            config.delete_confirmation.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "CONVERGE_OPERATION_TIMEOUT_SECONDS")? {
            config.operation_timeout_seconds = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can make progress.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` for zero retry budgets or a zero
    /// operation timeout.
    pub fn validate(&self) -> Result<()> {
        if self.poll.max_attempts == 0 {
            return Err(ControlError::Config(
                "poll retry budget must be at least 1".to_string(),
            ));
        }
        if self.delete_confirmation.max_attempts == 0 {
            return Err(ControlError::Config(
                "delete confirmation budget must be at least 1".to_string(),
            ));
        }
        if self.operation_timeout_seconds == 0 {
            return Err(ControlError::Config(
                "operation timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ControlError::Config(format!("{key} must be a number, got {raw:?}"))),
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll: RetryPolicy::polling(),
            delete_confirmation: RetryPolicy::delete_confirmation(),
            operation_timeout_seconds: Self::default_operation_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn control_config_defaults() {
        let config = ControlConfig::default();
        assert_eq!(config.poll, RetryPolicy::new(10, 5));
        assert_eq!(config.delete_confirmation, RetryPolicy::new(5, 500));
        assert_eq!(config.operation_timeout(), Duration::from_secs(2700));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_fills_defaults() {
        let config: ControlConfig =
            serde_json::from_str(r#"{"poll": {"interval_seconds": 2, "max_attempts": 3}}"#)
                .unwrap();
        assert_eq!(config.poll.interval(), Duration::from_secs(2));
        assert_eq!(config.delete_confirmation, RetryPolicy::delete_confirmation());
        assert_eq!(config.operation_timeout_seconds, 2700);
    }

    #[test]
    fn from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CONVERGE_POLL_INTERVAL_SECONDS", "1"),
            ("CONVERGE_DELETE_RETRIES", "20"),
            ("CONVERGE_OPERATION_TIMEOUT_SECONDS", " 600 "),
        ]
        .into_iter()
        .collect();

        let config =
            ControlConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.poll.interval_seconds, 1);
        assert_eq!(config.poll.max_attempts, 5);
        assert_eq!(config.delete_confirmation.max_attempts, 20);
        assert_eq!(config.operation_timeout_seconds, 600);
    }

    #[test]
    fn from_lookup_rejects_garbage() {
        let err = ControlConfig::from_lookup(|k| {
            (k == "CONVERGE_POLL_RETRIES").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("CONVERGE_POLL_RETRIES"));
    }

    #[test]
    fn zero_budget_is_invalid() {
        let err = ControlConfig::from_lookup(|k| {
            (k == "CONVERGE_POLL_RETRIES").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }
}
