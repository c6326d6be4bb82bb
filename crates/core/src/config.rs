//! Runtime configuration
//!
//! One struct per subsystem, all nested under [`Config`], deserializable
//! from partial TOML (every field carries a `#[serde(default = ...)]` so
//! a deployment only needs to override what it cares about).

use serde::{Deserialize, Serialize};

/// Top-level configuration for an `Ontology` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lock manager tuning.
    pub lock: LockConfig,
    /// Outbox publisher/subscriber tuning.
    pub outbox: OutboxConfig,
    /// Subscriber-side idempotency tuning.
    pub subscriber: SubscriberConfig,
    /// Merge engine tuning.
    pub merge: MergeConfig,
    /// Delta/ETag service tuning.
    pub delta: DeltaConfig,
    /// Shadow index coordinator tuning.
    pub shadow: ShadowConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lock: LockConfig::default(),
            outbox: OutboxConfig::default(),
            subscriber: SubscriberConfig::default(),
            merge: MergeConfig::default(),
            delta: DeltaConfig::default(),
            shadow: ShadowConfig::default(),
        }
    }
}

/// Branch Lock Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Default lock TTL in seconds when a caller doesn't specify one.
    pub default_ttl_seconds: u64,
    /// How often the sweeper scans for expired/heartbeat-stale locks.
    pub sweep_interval_seconds: u64,
    /// A heartbeat is considered stale after this many missed intervals.
    pub heartbeat_stale_after_missed: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            default_ttl_seconds: 3600,
            sweep_interval_seconds: 30,
            heartbeat_stale_after_missed: 2,
        }
    }
}

/// Outbox publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Rows are polled for publishing in batches of this size.
    pub batch_size: usize,
    /// How long the publisher sleeps between empty polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Rows are moved to `Dead` after this many failed publish attempts.
    pub max_attempts: u32,
    /// Base backoff in milliseconds; actual backoff is `base * 2^attempt`, capped.
    pub backoff_base_ms: u64,
    /// Backoff never exceeds this many milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        OutboxConfig {
            batch_size: 100,
            poll_interval_ms: 200,
            max_attempts: 10,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
        }
    }
}

/// Event subscriber configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Window, in seconds, that a processed event id is remembered for dedup.
    pub idempotency_window_s: u64,
    /// Handler failures beyond this many retries go to the processing DLQ.
    pub max_handler_attempts: u32,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        SubscriberConfig {
            idempotency_window_s: 3600,
            max_handler_attempts: 5,
        }
    }
}

/// Merge engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Merge aborts with `Timeout` if it exceeds this wall-clock budget.
    pub deadline_ms: u64,
    /// Whether `auto_resolve` defaults to true when the caller doesn't specify it.
    pub auto_resolve_default: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            deadline_ms: 30_000,
            auto_resolve_default: true,
        }
    }
}

/// ETag/Delta service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Maximum patch/full size ratio before a raw `JsonPatch` is still
    /// preferred over compression or a full replace.
    pub compression_threshold: f64,
    /// A compressed patch is used only if it beats the raw patch by at least this fraction.
    pub compression_improvement_threshold: f64,
    /// Maximum number of JsonPatch deltas folded into one `ChainDelta`.
    pub max_chain_length: usize,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        DeltaConfig {
            compression_threshold: 0.7,
            compression_improvement_threshold: 0.10,
            max_chain_length: 5,
        }
    }
}

/// Shadow index coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Default switch timeout in seconds when a caller doesn't specify one.
    pub default_switch_timeout_seconds: u64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        ShadowConfig {
            default_switch_timeout_seconds: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = Config::default();
        let toml_str = toml_encode(&cfg);
        assert!(toml_str.contains("default_ttl_seconds"));
    }

    fn toml_encode(cfg: &Config) -> String {
        serde_json::to_string(cfg).expect("config serializes")
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let json = serde_json::json!({
            "lock": { "default_ttl_seconds": 60 }
        });
        let cfg: Config = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.lock.default_ttl_seconds, 60);
        assert_eq!(cfg.lock.sweep_interval_seconds, 30);
        assert_eq!(cfg.outbox.max_attempts, 10);
    }
}
