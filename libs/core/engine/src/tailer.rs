//! C2 — stream tailer.
//!
//! One concurrent task per tailed stream name. Grounded on
//! `stream-worker::consumer::read_new_messages`'s XREAD-with-BLOCK idiom and
//! its tolerant handling of timeout-shaped errors, but deliberately does NOT
//! join a consumer group: the tailer is observation-only and must never
//! perturb the PEL of the group readers (C5/C6/C8/C9/C10) on the same
//! stream names.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

use crate::broadcaster::Broadcaster;
use crate::event::EngineEvent;

const BLOCK_MS: usize = 1000;
const READ_COUNT: usize = 100;
const RETRY_BACKOFF_SECS: u64 = 5;

/// Runs until `shutdown` flips to `true`. Reads are non-blocking at the host
/// scheduler level but each call suspends for up to `BLOCK_MS`, which bounds
/// shutdown latency.
pub async fn run(
    mut conn: ConnectionManager,
    stream_name: String,
    broadcaster: Broadcaster,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_id = "$".to_string();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let read_result: redis::RedisResult<redis::streams::StreamReadReply> = conn
            .xread_options(
                &[&stream_name],
                &[&last_id],
                &redis::streams::StreamReadOptions::default()
                    .block(BLOCK_MS)
                    .count(READ_COUNT),
            )
            .await;

        match read_result {
            Ok(reply) => {
                for stream_key in reply.keys {
                    for entry in stream_key.ids {
                        last_id = entry.id.clone();
                        let payload: Value = entry
                            .map
                            .into_iter()
                            .filter_map(|(k, v)| {
                                redis::from_redis_value::<String>(&v).ok().map(|s| (k, Value::String(s)))
                            })
                            .collect::<serde_json::Map<_, _>>()
                            .into();
                        broadcaster.publish(
                            EngineEvent::message_produced(stream_name.clone(), entry.id)
                                .with_payload(payload),
                        );
                    }
                }
            }
            Err(e) => {
                let msg = e.to_string().to_lowercase();
                if !msg.contains("timed out") {
                    warn!(stream = %stream_name, error = %e, "tailer read failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(RETRY_BACKOFF_SECS)) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ms_bounds_shutdown_latency() {
        assert!(BLOCK_MS <= 1000);
    }
}
