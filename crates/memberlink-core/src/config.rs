//! Runtime configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberlinkConfig {
    pub subscription: SubscriptionConfig,
    pub time_shift: TimeShiftConfig,
}

/// Member subscription timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// How long a subscribed candidate has to report data (default: 10000).
    pub confirmation_timeout_ms: u64,

    /// How long a member may stay away before re-subscribing (default: 10000).
    pub away_timeout_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_ms: 10_000,
            away_timeout_ms: 10_000,
        }
    }
}

impl SubscriptionConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn away_timeout(&self) -> Duration {
        Duration::from_millis(self.away_timeout_ms)
    }
}

/// Time-shift retry and reporting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeShiftConfig {
    /// Delay before re-running setup after a failure (default: 10000).
    pub retry_delay_ms: u64,

    /// Retry bound for relative (offset) points in time (default: 3).
    pub relative_max_retries: u32,

    /// Minimum spacing of playback head updates (default: 500).
    pub playback_head_interval_ms: u64,
}

impl Default for TimeShiftConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 10_000,
            relative_max_retries: 3,
            playback_head_interval_ms: 500,
        }
    }
}

impl TimeShiftConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn playback_head_interval(&self) -> Duration {
        Duration::from_millis(self.playback_head_interval_ms)
    }
}

impl MemberlinkConfig {
    /// Parse configuration from a JSON string.
    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&contents)?;
        info!(path = %path.as_ref().display(), "Loaded configuration");
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing or invalid.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load_from_file(path.as_ref()).unwrap_or_else(|e| {
            warn!(path = %path.as_ref().display(), "Using default configuration: {}", e);
            Self::default()
        })
    }

    /// Reject values that would make the timers meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscription.confirmation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "subscription.confirmation_timeout_ms must be positive".to_string(),
            ));
        }
        if self.subscription.away_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "subscription.away_timeout_ms must be positive".to_string(),
            ));
        }
        if self.time_shift.retry_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "time_shift.retry_delay_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timers() {
        let config = MemberlinkConfig::default();
        assert_eq!(config.subscription.confirmation_timeout(), Duration::from_secs(10));
        assert_eq!(config.subscription.away_timeout(), Duration::from_secs(10));
        assert_eq!(config.time_shift.retry_delay(), Duration::from_secs(10));
        assert_eq!(config.time_shift.relative_max_retries, 3);
        assert_eq!(
            config.time_shift.playback_head_interval(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            MemberlinkConfig::from_json_str(r#"{ "subscription": { "away_timeout_ms": 2500 } }"#)
                .unwrap();
        assert_eq!(config.subscription.away_timeout_ms, 2500);
        assert_eq!(config.subscription.confirmation_timeout_ms, 10_000);
        assert_eq!(config.time_shift, TimeShiftConfig::default());
    }

    #[test]
    fn zero_retry_delay_is_rejected() {
        let result = MemberlinkConfig::from_json_str(r#"{ "time_shift": { "retry_delay_ms": 0 } }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = MemberlinkConfig::load_or_default("definitely/not/here.json");
        assert_eq!(config, MemberlinkConfig::default());
    }
}
