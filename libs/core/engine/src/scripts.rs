//! C1 — function loader.
//!
//! `redis-rs` has no Redis Functions API; `redis::Script` already gives us
//! idempotent "install once" semantics via EVALSHA-with-EVAL-fallback, so
//! "installing a library" reduces to constructing each `Script` from its
//! `lua/*.lua` source and exercising it once against the shared connection
//! at process start, grounded on the `RedisScript` struct in
//! `other_examples/0eea1b68_..apalis-redis-src-storage.rs.rs` and the inline
//! `Script::new` usage in `axum-helpers::redis_auth_store`.

use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::{EngineError, EngineResult};

/// Handles to the four atomic broker-side procedures named in the design.
pub struct Scripts {
    pub read_claim_or_dlq: Script,
    pub route_message: Script,
    pub request: Script,
    pub response: Script,
    pub token_bucket_acquire: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            read_claim_or_dlq: Script::new(include_str!("lua/read_claim_or_dlq.lua")),
            route_message: Script::new(include_str!("lua/route_message.lua")),
            request: Script::new(include_str!("lua/request.lua")),
            response: Script::new(include_str!("lua/response.lua")),
            token_bucket_acquire: Script::new(include_str!("lua/token_bucket_acquire.lua")),
        }
    }

    /// Load (warm) every script against the broker, failing fast if any is
    /// rejected. The engine cannot operate without them, so this runs once,
    /// synchronously, before any worker or tailer task is spawned.
    pub async fn install(&self, conn: &mut ConnectionManager) -> EngineResult<()> {
        // SCRIPT LOAD both validates the script and warms the SHA1 cache that
        // the later `invoke_async` calls rely on (EVALSHA with EVAL fallback).
        for (name, source) in [
            ("read_claim_or_dlq", include_str!("lua/read_claim_or_dlq.lua")),
            ("route_message", include_str!("lua/route_message.lua")),
            ("request", include_str!("lua/request.lua")),
            ("response", include_str!("lua/response.lua")),
            (
                "token_bucket_acquire",
                include_str!("lua/token_bucket_acquire.lua"),
            ),
        ] {
            redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(source)
                .query_async::<String>(conn)
                .await
                .map_err(|e| EngineError::ScriptLoad(format!("{name}: {e}")))?;
        }
        Ok(())
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}
