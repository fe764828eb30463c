/*!
 * Configuration types for the multipart upload engine
 */

use crate::error::{MpuError, MpuResult};
use crate::retry::{BackoffStrategy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of simultaneous in-flight part transfers
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Upper bound accepted for the concurrency ceiling
pub const MAX_IN_FLIGHT_LIMIT: usize = 256;

/// Replica count requested when the caller does not choose one
pub const DEFAULT_DURABILITY: u32 = 2;

/// Main configuration for multipart uploads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpuConfig {
    /// Maximum number of part transfers in flight at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Per-attempt timeout for a part transfer in seconds (0 = none)
    #[serde(default = "default_part_timeout")]
    pub part_timeout_secs: u64,

    /// Durability level used by the whole-object helpers
    #[serde(default = "default_durability")]
    pub default_durability: u32,

    /// Abort the session before surfacing an unrecoverable error
    #[serde(default = "default_true")]
    pub abort_on_failure: bool,

    /// Retry behaviour for retryable failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Part count and size limits
    #[serde(default)]
    pub policy: PartPolicy,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,
}

impl Default for MpuConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            part_timeout_secs: default_part_timeout(),
            default_durability: default_durability(),
            abort_on_failure: true,
            retry: RetryConfig::default(),
            policy: PartPolicy::default(),
            log_level: LogLevel::default(),
            log_file: None,
            verbose: false,
        }
    }
}

/// Retry settings, serialisable form of [`RetryPolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per operation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Hard ceiling on total time per operation in seconds
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,

    /// Jitter factor (0.0-1.0)
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,

    /// Backoff strategy
    #[serde(default = "default_backoff")]
    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_elapsed_secs: default_max_elapsed_secs(),
            jitter_factor: default_jitter(),
            backoff: default_backoff(),
        }
    }
}

impl RetryConfig {
    /// Build the runtime retry policy
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_elapsed: Duration::from_secs(self.max_elapsed_secs),
            backoff: self.backoff,
            jitter_factor: self.jitter_factor,
        }
    }
}

/// Service-side limits the client enforces before sending requests.
///
/// The service contract does not fix these, so every bound is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartPolicy {
    /// Maximum number of parts in a commit ordering
    #[serde(default)]
    pub max_parts: Option<usize>,

    /// Largest accepted part number
    #[serde(default)]
    pub max_part_number: Option<u32>,

    /// Minimum size for every part except the last one in the ordering
    #[serde(default)]
    pub min_part_size: Option<u64>,

    /// Maximum size of any single part
    #[serde(default)]
    pub max_part_size: Option<u64>,
}

impl PartPolicy {
    /// Check a part number against the policy
    pub fn check_part_number(&self, part_number: u32) -> MpuResult<()> {
        match self.max_part_number {
            Some(max) if part_number > max => Err(MpuError::Validation(format!(
                "Part number {} exceeds maximum {}",
                part_number, max
            ))),
            _ => Ok(()),
        }
    }

    /// Check a part size against the upper bound
    pub fn check_part_size(&self, part_number: u32, size: u64) -> MpuResult<()> {
        match self.max_part_size {
            Some(max) if size > max => Err(MpuError::Validation(format!(
                "Part {} is {} bytes, exceeds maximum {}",
                part_number, size, max
            ))),
            _ => Ok(()),
        }
    }

    /// Check a resolved commit ordering given part sizes in commit order
    pub fn check_ordering(&self, sizes: &[(u32, u64)]) -> MpuResult<()> {
        if let Some(max) = self.max_parts {
            if sizes.len() > max {
                return Err(MpuError::Validation(format!(
                    "Commit lists {} parts, maximum is {}",
                    sizes.len(),
                    max
                )));
            }
        }

        if let Some(min) = self.min_part_size {
            let body = sizes.len().saturating_sub(1);
            if let Some((number, size)) = sizes[..body].iter().find(|(_, size)| *size < min) {
                return Err(MpuError::Validation(format!(
                    "Part {} is {} bytes, below minimum {} for non-final parts",
                    number, size, min
                )));
            }
        }

        Ok(())
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_part_timeout() -> u64 {
    300
}

fn default_durability() -> u32 {
    DEFAULT_DURABILITY
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_elapsed_secs() -> u64 {
    300
}

fn default_jitter() -> f64 {
    0.3
}

fn default_backoff() -> BackoffStrategy {
    BackoffStrategy::ExponentialWithJitter
}

impl MpuConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> MpuResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MpuError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> MpuResult<Self> {
        let config: MpuConfig =
            toml::from_str(contents).map_err(|e| MpuError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> MpuResult<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| MpuError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Per-attempt part timeout, if any
    pub fn part_timeout(&self) -> Option<Duration> {
        (self.part_timeout_secs > 0).then(|| Duration::from_secs(self.part_timeout_secs))
    }

    /// Validate the configuration
    pub fn validate(&self) -> MpuResult<()> {
        if self.max_in_flight == 0 {
            return Err(MpuError::InvalidConfig(
                "max_in_flight must be at least 1".to_string(),
            ));
        }

        if self.max_in_flight > MAX_IN_FLIGHT_LIMIT {
            return Err(MpuError::InvalidConfig(format!(
                "max_in_flight {} exceeds maximum {}",
                self.max_in_flight, MAX_IN_FLIGHT_LIMIT
            )));
        }

        if self.default_durability == 0 {
            return Err(MpuError::InvalidConfig(
                "default_durability must be positive".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(MpuError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(MpuError::InvalidConfig(format!(
                "retry.jitter_factor {} must be within 0.0..=1.0",
                self.retry.jitter_factor
            )));
        }

        if let (Some(min), Some(max)) = (self.policy.min_part_size, self.policy.max_part_size) {
            if min > max {
                return Err(MpuError::InvalidConfig(format!(
                    "policy.min_part_size {} exceeds policy.max_part_size {}",
                    min, max
                )));
            }
        }

        if self.policy.max_parts == Some(0) {
            return Err(MpuError::InvalidConfig(
                "policy.max_parts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a configuration tuned for fast local or LAN services
    pub fn fast_preset() -> Self {
        Self {
            max_in_flight: 16,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 50,
                max_delay_ms: 2_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration optimized for flaky network paths
    pub fn network_preset() -> Self {
        Self {
            max_in_flight: 8,
            part_timeout_secs: 600,
            retry: RetryConfig {
                max_attempts: 10,
                initial_delay_ms: 100,
                max_delay_ms: 30_000,
                max_elapsed_secs: 600,
                jitter_factor: 0.5,
                backoff: BackoffStrategy::ExponentialWithJitter,
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MpuConfig::default();
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.default_durability, 2);
        assert!(config.abort_on_failure);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        assert!(MpuConfig::fast_preset().validate().is_ok());
        assert!(MpuConfig::network_preset().validate().is_ok());
        assert_eq!(MpuConfig::network_preset().retry.max_attempts, 10);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = MpuConfig {
            max_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MpuError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_bad_jitter_and_sizes() {
        let mut config = MpuConfig::default();
        config.retry.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = MpuConfig::default();
        config.policy.min_part_size = Some(10);
        config.policy.max_part_size = Some(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_example() {
        let toml_str = r#"
max_in_flight = 8
part_timeout_secs = 60
default_durability = 3
log_level = "debug"

[retry]
max_attempts = 7
initial_delay_ms = 10
backoff = "exponential"

[policy]
max_parts = 10000
min_part_size = 5242880
"#;

        let config = MpuConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.default_durability, 3);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.policy.max_parts, Some(10000));
        assert_eq!(config.policy.min_part_size, Some(5 * 1024 * 1024));
        assert!(config.abort_on_failure);
    }

    #[test]
    fn test_file_roundtrip() {
        let file = NamedTempFile::new().unwrap();
        let config = MpuConfig::network_preset();
        config.to_file(file.path()).unwrap();

        let loaded = MpuConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_retry_config_to_policy() {
        let policy = RetryConfig::default().to_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
        assert_eq!(policy.max_elapsed, Duration::from_secs(300));
    }

    #[test]
    fn test_part_policy_checks() {
        let policy = PartPolicy {
            max_parts: Some(3),
            max_part_number: Some(9),
            min_part_size: Some(100),
            max_part_size: Some(1000),
        };

        assert!(policy.check_part_number(9).is_ok());
        assert!(policy.check_part_number(10).is_err());
        assert!(policy.check_part_size(0, 1001).is_err());

        // Last part may be small
        assert!(policy.check_ordering(&[(0, 100), (1, 100), (2, 1)]).is_ok());
        assert!(policy.check_ordering(&[(0, 99), (1, 100)]).is_err());
        assert!(policy
            .check_ordering(&[(0, 100), (1, 100), (2, 100), (3, 100)])
            .is_err());
    }

    #[test]
    fn test_part_timeout() {
        let mut config = MpuConfig::default();
        assert_eq!(config.part_timeout(), Some(Duration::from_secs(300)));
        config.part_timeout_secs = 0;
        assert_eq!(config.part_timeout(), None);
    }
}
