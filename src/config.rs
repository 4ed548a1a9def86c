//! Configuration surface for the dispatch core.
//!
//! Loaded from a TOML file (`dispatcher.toml` by convention) with environment
//! variables as an override layer, the way the teacher crate this was grown from
//! loads its own settings file before falling back to `.env`-sourced values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-queue subscription and routing policy, one entry per row of the queue
/// configuration table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub logical_name: String,
    pub result_queue_name: String,
    pub handler_name: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    10
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Exponential backoff parameters for retrying a transient failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_backoff_cap_ms")]
    pub cap_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_backoff_ms(),
            multiplier: default_backoff_multiplier(),
            cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl BackoffConfig {
    /// Full-jitter exponential backoff delay for the given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = (self.initial_ms as f64 * exp).min(self.cap_ms as f64);
        let jittered = rand::thread_rng().gen_range(0.0..=raw.max(0.0001));
        Duration::from_millis(jittered as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_visibility_seconds")]
    pub visibility_seconds: u64,
}

fn default_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    10
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_visibility_seconds() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_seconds: default_visibility_seconds(),
        }
    }
}

impl PoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_approval_ttl_seconds")]
    pub default_ttl_seconds: u64,
    #[serde(default = "default_gc_interval_seconds")]
    pub gc_interval_seconds: u64,
}

fn default_approval_ttl_seconds() -> u64 {
    60
}
fn default_gc_interval_seconds() -> u64 {
    30
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_approval_ttl_seconds(),
            gc_interval_seconds: default_gc_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_terminal_retention_seconds")]
    pub terminal_retention_seconds: u64,
}

fn default_terminal_retention_seconds() -> u64 {
    3_600
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            terminal_retention_seconds: default_terminal_retention_seconds(),
        }
    }
}

/// Top-level configuration, matching every knob in the dispatcher's configuration
/// surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl Config {
    /// The default queue configuration table from the spec: rule updates, LLM config
    /// updates, and job requests, each with their documented per-type defaults.
    pub fn default_queues() -> Vec<QueueConfig> {
        vec![
            QueueConfig {
                logical_name: "rule_updates".into(),
                result_queue_name: "rule_updates_results".into(),
                handler_name: "rule-engine".into(),
                max_attempts: 5,
                timeout_secs: 10,
                backoff: BackoffConfig::default(),
            },
            QueueConfig {
                logical_name: "llm_config_updates".into(),
                result_queue_name: "llm_config_updates_results".into(),
                handler_name: "llm-config-manager".into(),
                max_attempts: 5,
                timeout_secs: 10,
                backoff: BackoffConfig::default(),
            },
            QueueConfig {
                logical_name: "job_requests".into(),
                result_queue_name: "job_results".into(),
                handler_name: "job-executor".into(),
                max_attempts: 3,
                timeout_secs: 30,
                backoff: BackoffConfig::default(),
            },
        ]
    }

    /// Load configuration from a TOML file, falling back to the documented defaults
    /// for any field the file omits. Missing file is not an error: the default queue
    /// table is used, mirroring the teacher's tolerant settings loader.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&raw)?;
        Ok(cfg)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queues: Self::default_queues(),
            pool: PoolConfig::default(),
            approval: ApprovalConfig::default(),
            observability: ObservabilityConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.pool.workers, 4);
        assert_eq!(cfg.pool.batch_size, 10);
        assert_eq!(cfg.pool.visibility_seconds, 60);
        assert_eq!(cfg.approval.default_ttl_seconds, 60);
        assert_eq!(cfg.registry.terminal_retention_seconds, 3_600);
        assert_eq!(cfg.queues.len(), 3);
        assert_eq!(cfg.queues[2].max_attempts, 3);
        assert_eq!(cfg.queues[0].max_attempts, 5);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/dispatcher.toml")).unwrap();
        assert_eq!(cfg.queues.len(), 3);
    }

    #[test]
    fn backoff_delay_never_exceeds_cap() {
        let backoff = BackoffConfig::default();
        for attempt in 1..10 {
            let delay = backoff.delay_for_attempt(attempt);
            assert!(delay.as_millis() <= backoff.cap_ms as u128);
        }
    }
}
