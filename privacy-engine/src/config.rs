//! Engine configuration.
//!
//! Configuration is a plain serde struct. Every field has a default, so an
//! empty JSON object is a valid configuration. Values can be overridden
//! from `PRIVACY_ENGINE_*` environment variables.

use crate::errors::ConfigError;
use crate::observability::LogFormat;
use crate::retry::{PollConfig, RetryConfig};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "PRIVACY_ENGINE_";

fn default_worker_concurrency() -> usize {
    4
}

fn default_task_lease_seconds() -> i64 {
    300
}

fn default_large_payload_threshold_bytes() -> usize {
    1024 * 1024
}

fn default_webhook_timeout_seconds() -> u64 {
    30
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Error-retry policy for tasks.
    #[serde(default)]
    pub task_retry: RetryConfig,
    /// Async polling policy.
    #[serde(default)]
    pub polling: PollConfig,
    /// Maximum tasks executed concurrently by one worker.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Seconds a claim stays valid before another worker may take over.
    #[serde(default = "default_task_lease_seconds")]
    pub task_lease_seconds: i64,
    /// Row payloads larger than this are spilled to the artifact store.
    #[serde(default = "default_large_payload_threshold_bytes")]
    pub large_payload_threshold_bytes: usize,
    /// Timeout applied to each webhook call.
    #[serde(default = "default_webhook_timeout_seconds")]
    pub webhook_timeout_seconds: u64,
    /// Stop the remaining actions of a request once one action fails.
    #[serde(default)]
    pub fail_fast_across_actions: bool,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_retry: RetryConfig::default(),
            polling: PollConfig::default(),
            worker_concurrency: default_worker_concurrency(),
            task_lease_seconds: default_task_lease_seconds(),
            large_payload_threshold_bytes: default_large_payload_threshold_bytes(),
            webhook_timeout_seconds: default_webhook_timeout_seconds(),
            fail_fast_across_actions: false,
            log_format: LogFormat::default(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the task retry policy.
    #[must_use]
    pub fn with_task_retry(mut self, retry: RetryConfig) -> Self {
        self.task_retry = retry;
        self
    }

    /// Sets the polling policy.
    #[must_use]
    pub fn with_polling(mut self, polling: PollConfig) -> Self {
        self.polling = polling;
        self
    }

    /// Sets the worker concurrency.
    #[must_use]
    pub fn with_worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = concurrency;
        self
    }

    /// Sets the task lease duration.
    #[must_use]
    pub fn with_task_lease_seconds(mut self, seconds: i64) -> Self {
        self.task_lease_seconds = seconds;
        self
    }

    /// Sets the payload spill threshold.
    #[must_use]
    pub fn with_large_payload_threshold_bytes(mut self, bytes: usize) -> Self {
        self.large_payload_threshold_bytes = bytes;
        self
    }

    /// Enables or disables failing sibling actions.
    #[must_use]
    pub fn with_fail_fast_across_actions(mut self, enabled: bool) -> Self {
        self.fail_fast_across_actions = enabled;
        self
    }

    /// Parses a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Applies overrides from the process environment.
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides using `lookup` to resolve variable names.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("MAX_RETRIES") {
            self.task_retry.max_retries = parse_value("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("RETRY_BASE_DELAY_MS") {
            self.task_retry.base_delay_ms = parse_value("RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = get("POLL_INTERVAL_MS") {
            self.polling.interval_ms = parse_value("POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("MAX_POLLS") {
            self.polling.max_polls = parse_value("MAX_POLLS", &v)?;
        }
        if let Some(v) = get("WORKER_CONCURRENCY") {
            self.worker_concurrency = parse_value("WORKER_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("TASK_LEASE_SECONDS") {
            self.task_lease_seconds = parse_value("TASK_LEASE_SECONDS", &v)?;
        }
        if let Some(v) = get("LARGE_PAYLOAD_THRESHOLD_BYTES") {
            self.large_payload_threshold_bytes = parse_value("LARGE_PAYLOAD_THRESHOLD_BYTES", &v)?;
        }
        if let Some(v) = get("FAIL_FAST_ACROSS_ACTIONS") {
            self.fail_fast_across_actions = parse_value("FAIL_FAST_ACROSS_ACTIONS", &v)?;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.log_format = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}LOG_FORMAT"),
                value: v.clone(),
            })?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker_concurrency".to_string(),
                value: "0".to_string(),
            });
        }
        if self.task_lease_seconds <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "task_lease_seconds".to_string(),
                value: self.task_lease_seconds.to_string(),
            });
        }
        if self.polling.max_polls == 0 {
            return Err(ConfigError::InvalidValue {
                key: "polling.max_polls".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{name}"),
        value: raw.to_string(),
    })
}

/// Loads configuration for an embedding service: the file if given,
/// defaults otherwise, then environment overrides.
pub fn load(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading engine configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("applying PRIVACY_ENGINE_* overrides")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.polling.max_polls, 100);
    }

    #[test]
    fn test_partial_json() {
        let config = EngineConfig::from_json_str(
            r#"{"task_retry": {"max_retries": 7}, "polling": {"interval_ms": 10}, "log_format": "json"}"#,
        )
        .unwrap();
        assert_eq!(config.task_retry.max_retries, 7);
        assert_eq!(config.task_retry.base_delay_ms, 1000);
        assert_eq!(config.polling.interval_ms, 10);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = EngineConfig::from_json_str(r#"{"worker_concurrency": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PRIVACY_ENGINE_MAX_RETRIES", "9"),
            ("PRIVACY_ENGINE_MAX_POLLS", "3"),
            ("PRIVACY_ENGINE_LOG_FORMAT", "json"),
            ("PRIVACY_ENGINE_FAIL_FAST_ACROSS_ACTIONS", "true"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::default()
            .apply_overrides_from(|k| vars.get(k).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.task_retry.max_retries, 9);
        assert_eq!(config.polling.max_polls, 3);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.fail_fast_across_actions);
    }

    #[test]
    fn test_env_override_invalid() {
        let err = EngineConfig::default()
            .apply_overrides_from(|k| (k == "PRIVACY_ENGINE_WORKER_CONCURRENCY").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PRIVACY_ENGINE_WORKER_CONCURRENCY"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"task_lease_seconds": 60}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.task_lease_seconds, 60);

        let loaded = load(Some(file.path())).unwrap();
        assert_eq!(loaded.task_lease_seconds, 60);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Some(Path::new("/nonexistent/engine.json"))).unwrap_err();
        assert!(format!("{err:#}").contains("loading engine configuration"));
    }
}
