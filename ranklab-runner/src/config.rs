//! Serializable runner configuration.
//!
//! One TOML-loadable struct covers the fetch layer, the execution sandbox,
//! and run-level limits. Every field has a default so a partial config
//! file works.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use ranklab_core::data::FetcherConfig;
use ranklab_core::dsl::ExecLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Complete runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    // ── Fetch layer ──
    /// Retry attempts after the first try (transient failures only).
    pub fetch_max_retries: u32,
    /// First backoff delay in milliseconds; doubles per attempt.
    pub fetch_base_delay_ms: u64,
    /// Token-bucket acquisition timeout in milliseconds.
    pub rate_acquire_timeout_ms: u64,
    /// Bounded concurrency for batch fetches.
    pub fetch_workers: usize,
    /// Cache TTL in seconds.
    pub cache_ttl_secs: u64,
    /// Cache capacity in entries (LRU above this).
    pub cache_capacity: usize,

    // ── Execution sandbox ──
    /// Bounded concurrency for per-(factor, entity) executions.
    pub exec_workers: usize,
    /// Wall-clock ceiling per execution, milliseconds.
    pub exec_timeout_ms: u64,
    /// Op-fuel ceiling per execution.
    pub exec_max_ops: u64,
    /// Series cell budget per execution.
    pub exec_max_cells: usize,

    // ── Run level ──
    /// Default ranked-output size when the strategy does not set one.
    pub default_top_n: usize,
    /// Whole-run deadline in seconds; None disables it.
    pub run_deadline_secs: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            fetch_max_retries: 3,
            fetch_base_delay_ms: 200,
            rate_acquire_timeout_ms: 30_000,
            fetch_workers: 8,
            cache_ttl_secs: 24 * 60 * 60,
            cache_capacity: 1024,
            exec_workers: 8,
            exec_timeout_ms: 2_000,
            exec_max_ops: 1_000_000,
            exec_max_cells: 10_000_000,
            default_top_n: 20,
            run_deadline_secs: None,
        }
    }
}

impl RunnerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            max_retries: self.fetch_max_retries,
            base_delay: Duration::from_millis(self.fetch_base_delay_ms),
            rate_acquire_timeout: Duration::from_millis(self.rate_acquire_timeout_ms),
            workers: self.fetch_workers,
        }
    }

    pub fn exec_limits(&self) -> ExecLimits {
        ExecLimits {
            timeout: Duration::from_millis(self.exec_timeout_ms),
            max_ops: self.exec_max_ops,
            max_cells: self.exec_max_cells,
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RunnerConfig::default();
        assert_eq!(config.cache_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.fetcher_config().max_retries, 3);
        assert!(config.run_deadline().is_none());
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config: RunnerConfig = toml::from_str(
            r#"
                exec_workers = 2
                run_deadline_secs = 90
            "#,
        )
        .unwrap();
        assert_eq!(config.exec_workers, 2);
        assert_eq!(config.run_deadline(), Some(Duration::from_secs(90)));
        // Untouched fields keep defaults.
        assert_eq!(config.fetch_workers, 8);
    }
}
