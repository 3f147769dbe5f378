//! Error types for the messaging engine.
//!
//! - `EngineError` - the main error type surfaced by every component
//! - `ErrorCategory` - classification used by worker loops to decide retry vs. surface
//! - `RetryStrategy` - backoff shape for a category

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in any engine component.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required broker-side script failed to install at startup.
    #[error("Script load error: {0}")]
    ScriptLoad(String),

    /// Consumer group error (other than NOGROUP, which is treated as empty).
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Input failed validation (HTTP boundary).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Engine configuration is inconsistent or incomplete.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal invariant violation; should not normally occur.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the underlying Redis error is a plain consumer-group read
    /// timeout, which is expected behavior under blocking reads, not a fault.
    pub fn is_block_timeout(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let s = e.to_string().to_lowercase();
                s.contains("timed out") && !s.contains("connection")
            }
            _ => false,
        }
    }

    /// Whether this looks like a dropped/broken connection, as opposed to a
    /// semantic error from the broker.
    pub fn is_connection_error(&self) -> bool {
        if self.is_block_timeout() {
            return false;
        }
        match self {
            Self::Redis(e) => {
                let s = e.to_string().to_lowercase();
                s.contains("connection")
                    || s.contains("disconnected")
                    || s.contains("broken pipe")
                    || s.contains("reset by peer")
                    || s.contains("refused")
                    || s.contains("eof")
                    || s.contains("io error")
            }
            _ => false,
        }
    }

    /// Whether this is a NOGROUP error, which workers treat as "no messages",
    /// not as a fault (the caller is expected to `ensure_consumer_group` and retry).
    pub fn is_nogroup_error(&self) -> bool {
        match self {
            Self::Redis(e) => e.to_string().contains("NOGROUP"),
            Self::ConsumerGroup(s) => s.contains("NOGROUP"),
            _ => false,
        }
    }

    /// Classify this error for a worker loop's retry decision.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Redis(e) => {
                let s = e.to_string().to_lowercase();
                if s.contains("busy") || s.contains("loading") {
                    ErrorCategory::RateLimited
                } else {
                    ErrorCategory::Transient
                }
            }
            Self::ConsumerGroup(_) => ErrorCategory::Transient,
            Self::Serialization(_) => ErrorCategory::Permanent,
            Self::Validation(_) | Self::NotFound(_) | Self::Config(_) => ErrorCategory::Permanent,
            Self::ScriptLoad(_) | Self::Internal(_) => ErrorCategory::Permanent,
        }
    }
}

/// Error category for smart retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary error - retry with exponential backoff.
    Transient,
    /// Permanent error - do not retry.
    Permanent,
    /// Broker is overloaded - retry with longer backoff.
    RateLimited,
}

impl ErrorCategory {
    /// The retry strategy associated with this category.
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::Transient => RetryStrategy::ExponentialBackoff {
                base_delay_ms: 1000,
                max_delay_ms: 30_000,
                max_retries: 3,
            },
            Self::Permanent => RetryStrategy::NoRetry,
            Self::RateLimited => RetryStrategy::ExponentialBackoff {
                base_delay_ms: 5000,
                max_delay_ms: 120_000,
                max_retries: 5,
            },
        }
    }

    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

/// Retry strategy for handling errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    NoRetry,
    ExponentialBackoff {
        base_delay_ms: u64,
        max_delay_ms: u64,
        max_retries: u32,
    },
}

impl RetryStrategy {
    /// Delay before the given attempt, with jitter, or `None` if exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::NoRetry => None,
            Self::ExponentialBackoff {
                base_delay_ms,
                max_delay_ms,
                max_retries,
            } => {
                if attempt >= *max_retries {
                    return None;
                }
                let exp_delay = base_delay_ms.saturating_mul(2u64.pow(attempt));
                let capped = exp_delay.min(*max_delay_ms);
                Some(Duration::from_millis(Self::apply_jitter(capped)))
            }
        }
    }

    fn apply_jitter(delay_ms: u64) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        use std::time::SystemTime;

        let mut hasher = DefaultHasher::new();
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .hash(&mut hasher);
        let hash = hasher.finish();

        let jitter_range = delay_ms / 4;
        if jitter_range == 0 {
            return delay_ms;
        }
        let offset = (hash % (jitter_range * 2 + 1)) as i64 - jitter_range as i64;
        if offset < 0 {
            delay_ms.saturating_sub((-offset) as u64)
        } else {
            delay_ms.saturating_add(offset as u64)
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        match self {
            Self::NoRetry => false,
            Self::ExponentialBackoff { max_retries, .. } => attempt < *max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::NoRetry => 0,
            Self::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = EngineError::Validation("missing field".to_string());
        assert_eq!(err.to_string(), "Validation error: missing field");
    }

    #[test]
    fn category_permanent_for_bad_input() {
        assert_eq!(
            EngineError::Validation("x".into()).category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            EngineError::NotFound("x".into()).category(),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn category_transient_for_consumer_group() {
        assert_eq!(
            EngineError::ConsumerGroup("NOGROUP no such key".into()).category(),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn retry_strategy_no_retry() {
        let strategy = RetryStrategy::NoRetry;
        assert!(!strategy.should_retry(0));
        assert_eq!(strategy.delay_for_attempt(0), None);
    }

    #[test]
    fn retry_strategy_exponential_backoff() {
        let strategy = RetryStrategy::ExponentialBackoff {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_retries: 3,
        };
        assert!(strategy.should_retry(0));
        assert!(!strategy.should_retry(3));
        assert!(strategy.delay_for_attempt(2).is_some());
        assert!(strategy.delay_for_attempt(3).is_none());
    }

    #[test]
    fn category_retry_strategy_shapes() {
        assert!(matches!(
            ErrorCategory::Transient.retry_strategy(),
            RetryStrategy::ExponentialBackoff { max_retries: 3, .. }
        ));
        assert!(matches!(
            ErrorCategory::Permanent.retry_strategy(),
            RetryStrategy::NoRetry
        ));
        assert!(matches!(
            ErrorCategory::RateLimited.retry_strategy(),
            RetryStrategy::ExponentialBackoff { max_retries: 5, .. }
        ));
    }
}
