//! Engine configuration
//!
//! ```yaml
//! timeout: 5m
//! pollInterval: 2s
//! maxHistory: 10
//! hookDeleteTimeout: 30s
//! manager: rudder
//! retry:
//!   attempts: 5
//!   initialDelay: 100ms
//!   maxDelay: 2s
//!   factor: 2
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KubeError, Result};

/// Settings shared by every operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Default budget for operations, hooks and waits
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Readiness and absence polling interval
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Revisions kept per release, 0 keeps all
    pub max_history: usize,

    /// Budget for removing a failed hook's resources
    #[serde(with = "humantime_serde")]
    pub hook_delete_timeout: Duration,

    /// Identity used as store owner and field manager
    pub manager: String,

    /// Conflict retry backoff
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            max_history: 10,
            hook_delete_timeout: Duration::from_secs(30),
            manager: "rudder".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML, filling missing fields with defaults
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(KubeError::InvalidConfig(
                "pollInterval must be greater than zero".to_string(),
            ));
        }
        if self.manager.trim().is_empty() {
            return Err(KubeError::InvalidConfig("manager must not be empty".to_string()));
        }
        self.retry.validate()
    }
}

/// Exponential backoff for write conflicts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub attempts: u32,

    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    pub factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(KubeError::InvalidConfig(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        if self.factor == 0 {
            return Err(KubeError::InvalidConfig(
                "retry.factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_history, 10);
        assert_eq!(config.hook_delete_timeout, Duration::from_secs(30));
        assert_eq!(config.manager, "rudder");
        assert_eq!(config.retry.attempts, 5);
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = EngineConfig::from_yaml("timeout: 90s\nretry:\n  attempts: 2\n").unwrap();
        assert_eq!(config.timeout, Duration::from_secs(90));
        assert_eq!(config.retry.attempts, 2);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_history, 10);
    }

    #[test]
    fn test_from_yaml_rejects_zero_poll() {
        assert!(EngineConfig::from_yaml("pollInterval: 0s\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "maxHistory: 3\nmanager: ci-bot\npollInterval: 250ms\nhookDeleteTimeout: 5s"
        )
        .unwrap();

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.max_history, 3);
        assert_eq!(config.manager, "ci-bot");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.hook_delete_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay(0), Duration::from_millis(100));
        assert_eq!(retry.delay(1), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(800));
        assert_eq!(retry.delay(10), Duration::from_secs(2));
    }
}
