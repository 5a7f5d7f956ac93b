//! Tracker configuration and its fluent builder.
//!
//! # Example
//!
//! ```rust
//! use chainhead_core::config::TrackerBuilder;
//!
//! let config = TrackerBuilder::new()
//!     .max_block_cached(64)
//!     .max_retry_get_logs(3)
//!     .retry_delay_get_logs_ms(250)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.max_block_cached, 64);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TrackerError;
use crate::retry::RetryPolicy;

/// Options recognized by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Size of the block window kept for ancestor search.
    pub max_block_cached: usize,
    /// Retries for the common-ancestor search and for chain repair.
    pub max_retry_get_block: u32,
    /// Fixed delay between block-fetch retries (milliseconds).
    pub retry_delay_get_block_ms: u64,
    /// Retries for log retrieval, including refetches after a mid-fetch reorg.
    pub max_retry_get_logs: u32,
    /// Fixed delay between log-fetch retries (milliseconds).
    pub retry_delay_get_logs_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_block_cached: 128,
            max_retry_get_block: 5,
            retry_delay_get_block_ms: 1000,
            max_retry_get_logs: 5,
            retry_delay_get_logs_ms: 1000,
        }
    }
}

impl TrackerConfig {
    /// Parse a config from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, TrackerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TrackerError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.max_block_cached == 0 {
            return Err(TrackerError::InvalidConfig(
                "max_block_cached must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn block_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.max_retry_get_block,
            Duration::from_millis(self.retry_delay_get_block_ms),
        )
    }

    pub(crate) fn logs_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.max_retry_get_logs,
            Duration::from_millis(self.retry_delay_get_logs_ms),
        )
    }
}

/// Fluent builder for `TrackerConfig`.
#[derive(Default)]
pub struct TrackerBuilder {
    config: TrackerConfig,
}

impl TrackerBuilder {
    pub fn new() -> Self {
        Self {
            config: TrackerConfig::default(),
        }
    }

    /// Set the number of recent blocks kept in the cache window.
    pub fn max_block_cached(mut self, n: usize) -> Self {
        self.config.max_block_cached = n;
        self
    }

    pub fn max_retry_get_block(mut self, n: u32) -> Self {
        self.config.max_retry_get_block = n;
        self
    }

    pub fn retry_delay_get_block_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_get_block_ms = ms;
        self
    }

    pub fn max_retry_get_logs(mut self, n: u32) -> Self {
        self.config.max_retry_get_logs = n;
        self
    }

    pub fn retry_delay_get_logs_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_get_logs_ms = ms;
        self
    }

    /// Zero both retry delays (tests, replays).
    pub fn no_retry_delay(self) -> Self {
        self.retry_delay_get_block_ms(0).retry_delay_get_logs_ms(0)
    }

    /// Validate and return the `TrackerConfig`.
    pub fn build(self) -> Result<TrackerConfig, TrackerError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = TrackerBuilder::new().build().unwrap();
        assert_eq!(cfg.max_block_cached, 128);
        assert_eq!(cfg.max_retry_get_block, 5);
        assert_eq!(cfg.retry_delay_get_logs_ms, 1000);
    }

    #[test]
    fn builder_custom() {
        let cfg = TrackerBuilder::new()
            .max_block_cached(10)
            .max_retry_get_block(2)
            .max_retry_get_logs(7)
            .no_retry_delay()
            .build()
            .unwrap();
        assert_eq!(cfg.max_block_cached, 10);
        assert_eq!(cfg.max_retry_get_block, 2);
        assert_eq!(cfg.max_retry_get_logs, 7);
        assert_eq!(cfg.retry_delay_get_block_ms, 0);
        assert_eq!(cfg.retry_delay_get_logs_ms, 0);
    }

    #[test]
    fn zero_window_rejected() {
        let err = TrackerBuilder::new().max_block_cached(0).build().unwrap_err();
        assert!(matches!(err, TrackerError::InvalidConfig(_)));
    }

    #[test]
    fn json_partial_uses_defaults() {
        let cfg = TrackerConfig::from_json_str(r#"{ "max_block_cached": 12 }"#).unwrap();
        assert_eq!(cfg.max_block_cached, 12);
        assert_eq!(cfg.max_retry_get_logs, 5);
        assert!(TrackerConfig::from_json_str("not json").is_err());
    }
}
