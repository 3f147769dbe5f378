//! Engine-wide configuration: per-component tunables loaded once at process
//! start, following `core_config`'s `FromEnv` + builder idiom.

use crate::error::{EngineError, EngineResult};

/// DLQ policy for a stream: how many deliveries before a move to the DLQ,
/// and the minimum idle time before an entry is even eligible for a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlqConfig {
    pub max_deliveries: i64,
    pub min_idle_ms: i64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 2,
            min_idle_ms: 100,
        }
    }
}

/// Process-wide engine configuration.
///
/// Every field has a default matching the literal values named in the
/// component design; each is independently overridable via environment
/// variables through [`EngineConfig::from_env`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dlq_defaults: DlqConfig,
    pub work_queue_poll_ms: u64,
    pub work_queue_workers: usize,
    pub fanout_workers: usize,
    pub per_key_lock_ttl_ms: u64,
    pub per_key_idle_claim_ms: u64,
    pub per_key_workers: usize,
    pub token_bucket_idle_claim_ms: u64,
    pub token_bucket_workers: usize,
    pub scheduler_poll_ms: u64,
    pub request_reply_group: String,
    pub request_reply_timeout_sec: u64,
}

impl EngineConfig {
    /// Construct and validate. Returns `Err` if `min_idle_ms` does not
    /// exceed the work-queue poll interval (see DESIGN.md, Open Question 3).
    pub fn new() -> EngineResult<Self> {
        let cfg = Self::default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.dlq_defaults.min_idle_ms as u64 <= self.work_queue_poll_ms {
            return Err(EngineError::Config(format!(
                "dlq minIdleMs ({}) must exceed work_queue_poll_ms ({}); \
                 otherwise a worker's own in-flight delivery can be re-claimed \
                 before it has a chance to ack",
                self.dlq_defaults.min_idle_ms, self.work_queue_poll_ms
            )));
        }
        Ok(())
    }

    /// Load from the environment, falling back to defaults for unset vars.
    pub fn from_env() -> EngineResult<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("ENGINE_DLQ_MAX_DELIVERIES") {
            cfg.dlq_defaults.max_deliveries = v
                .parse()
                .map_err(|_| EngineError::Config("ENGINE_DLQ_MAX_DELIVERIES must be an integer".into()))?;
        }
        if let Ok(v) = std::env::var("ENGINE_DLQ_MIN_IDLE_MS") {
            cfg.dlq_defaults.min_idle_ms = v
                .parse()
                .map_err(|_| EngineError::Config("ENGINE_DLQ_MIN_IDLE_MS must be an integer".into()))?;
        }
        if let Ok(v) = std::env::var("ENGINE_WORK_QUEUE_POLL_MS") {
            cfg.work_queue_poll_ms = v
                .parse()
                .map_err(|_| EngineError::Config("ENGINE_WORK_QUEUE_POLL_MS must be an integer".into()))?;
        }
        if let Ok(v) = std::env::var("ENGINE_WORK_QUEUE_WORKERS") {
            cfg.work_queue_workers = v
                .parse()
                .map_err(|_| EngineError::Config("ENGINE_WORK_QUEUE_WORKERS must be an integer".into()))?;
        }
        if let Ok(v) = std::env::var("ENGINE_FANOUT_WORKERS") {
            cfg.fanout_workers = v
                .parse()
                .map_err(|_| EngineError::Config("ENGINE_FANOUT_WORKERS must be an integer".into()))?;
        }
        if let Ok(v) = std::env::var("ENGINE_PER_KEY_WORKERS") {
            cfg.per_key_workers = v
                .parse()
                .map_err(|_| EngineError::Config("ENGINE_PER_KEY_WORKERS must be an integer".into()))?;
        }
        if let Ok(v) = std::env::var("ENGINE_TOKEN_BUCKET_WORKERS") {
            cfg.token_bucket_workers = v
                .parse()
                .map_err(|_| EngineError::Config("ENGINE_TOKEN_BUCKET_WORKERS must be an integer".into()))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dlq_defaults: DlqConfig::default(),
            work_queue_poll_ms: 100,
            work_queue_workers: 3,
            fanout_workers: 3,
            per_key_lock_ttl_ms: 30_000,
            per_key_idle_claim_ms: 500,
            per_key_workers: 3,
            token_bucket_idle_claim_ms: 500,
            token_bucket_workers: 8,
            scheduler_poll_ms: 500,
            request_reply_group: "inventory-service".to_string(),
            request_reply_timeout_sec: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_min_idle_not_exceeding_poll_interval() {
        let mut cfg = EngineConfig::default();
        cfg.dlq_defaults.min_idle_ms = 50;
        cfg.work_queue_poll_ms = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_env_overrides_defaults() {
        temp_env::with_var("ENGINE_WORK_QUEUE_WORKERS", Some("7"), || {
            let cfg = EngineConfig::from_env().unwrap();
            assert_eq!(cfg.work_queue_workers, 7);
        });
    }
}
