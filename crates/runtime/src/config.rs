use std::time::Duration;

use keel_core::{env_parse, Backoff};
use serde::{Deserialize, Serialize};

/// Engine tuning. `from_env` falls back to the defaults for unset or malformed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Reconcile worker tasks.
    pub workers: usize,
    /// Concurrent rule invocations.
    pub rule_workers: usize,
    /// Reconcile attempts before a failure is terminal.
    pub max_attempts: u32,
    pub reconcile_backoff: Backoff,
    /// Retry window for cached rule failures.
    pub rule_retry: Backoff,
    pub shards: usize,
    pub default_namespace: String,
    /// Pending derive requests before reconcilers wait.
    pub derive_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            rule_workers: 4,
            max_attempts: 5,
            reconcile_backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(30)),
            rule_retry: Backoff::new(Duration::from_millis(500), Duration::from_secs(60)),
            shards: 16,
            default_namespace: "default".to_string(),
            derive_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let ms = |key: &str, fallback: Duration| env_parse::<u64>(key).map(Duration::from_millis).unwrap_or(fallback);
        Self {
            workers: env_parse::<usize>("KEEL_WORKERS").filter(|n| *n > 0).unwrap_or(d.workers),
            rule_workers: env_parse::<usize>("KEEL_RULE_WORKERS").filter(|n| *n > 0).unwrap_or(d.rule_workers),
            max_attempts: env_parse::<u32>("KEEL_MAX_ATTEMPTS").filter(|n| *n > 0).unwrap_or(d.max_attempts),
            reconcile_backoff: Backoff::new(
                ms("KEEL_BACKOFF_BASE_MS", d.reconcile_backoff.base),
                ms("KEEL_BACKOFF_MAX_MS", d.reconcile_backoff.max),
            ),
            rule_retry: Backoff::new(
                ms("KEEL_RULE_RETRY_BASE_MS", d.rule_retry.base),
                ms("KEEL_RULE_RETRY_MAX_MS", d.rule_retry.max),
            ),
            shards: env_parse::<usize>("KEEL_SHARDS").filter(|n| *n > 0).unwrap_or(d.shards),
            default_namespace: std::env::var("KEEL_DEFAULT_NAMESPACE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(d.default_namespace),
            derive_capacity: env_parse::<usize>("KEEL_DERIVE_CAPACITY").filter(|n| *n > 0).unwrap_or(d.derive_capacity),
        }
    }
}
