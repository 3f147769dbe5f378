//! Shared application state handed to every Axum handler.

use std::sync::Arc;

use redis::aio::ConnectionManager;

use engine::{Broadcaster, EngineConfig, Scripts};

#[derive(Clone)]
pub struct AppState {
    pub redis: ConnectionManager,
    pub scripts: Arc<Scripts>,
    pub broadcaster: Broadcaster,
    pub config: Arc<EngineConfig>,
}

impl AppState {
    pub fn new(redis: ConnectionManager, scripts: Arc<Scripts>, broadcaster: Broadcaster, config: Arc<EngineConfig>) -> Self {
        Self {
            redis,
            scripts,
            broadcaster,
            config,
        }
    }

    /// Every handler takes its own clone of the connection manager, matching
    /// `HealthState`/`health.rs`'s per-request-clone idiom rather than
    /// wrapping it in a mutex.
    pub fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }
}
