//! C5 — work-queue workers, and the shared loop body C6 (fan-out) reuses.
//!
//! Grounded on `stream-worker::worker::StreamWorker::run`'s poll-loop /
//! shutdown-select / backoff shape, generalized because this worker's core
//! step is `read_claim_or_dlq` (C4) rather than a plain group read.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::watch;
use tracing::warn;

use crate::broadcaster::Broadcaster;
use crate::config::DlqConfig;
use crate::dlq;
use crate::event::EngineEvent;
use crate::scripts::Scripts;

const PROCESSING_DELAY_MS: u64 = 50;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// One worker loop, shared verbatim by C5 (single group) and C6 (private
/// group per worker) — the only difference between them is which `group`
/// name is passed in and whether the caller first creates it.
pub async fn run_worker_loop(
    mut conn: ConnectionManager,
    scripts: std::sync::Arc<Scripts>,
    stream: String,
    dlq_config: DlqConfig,
    group: String,
    consumer: String,
    done_stream_suffix: String,
    poll_interval: Duration,
    broadcaster: Broadcaster,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        match dlq::read_claim_or_dlq(&mut conn, &scripts, &stream, &group, &consumer, &dlq_config, 1).await {
            Ok(result) => {
                for moved in result.dlq_moved {
                    broadcaster.publish(EngineEvent::message_deleted(&stream, &moved.original_id));
                    broadcaster.publish(
                        EngineEvent::new(crate::event::EventType::MessageToDlq)
                            .with_stream(keys_dlq(&stream))
                            .with_message_id(&moved.dlq_id),
                    );
                }

                for entry in result.delivered {
                    tokio::time::sleep(Duration::from_millis(PROCESSING_DELAY_MS)).await;

                    let processing_type = entry
                        .fields
                        .iter()
                        .find(|(k, _)| k == "processingType")
                        .map(|(_, v)| v.as_str())
                        .unwrap_or("OK");

                    if processing_type == "OK" {
                        let done_stream = format!("{stream}.{done_stream_suffix}");
                        if let Err(e) = xadd_fields(&mut conn, &done_stream, &entry.fields).await {
                            warn!(stream = %stream, error = %e, "failed to append to done stream");
                            continue;
                        }
                        if let Err(e) = conn.xack::<_, _, _, i64>(&stream, &group, &[&entry.id]).await {
                            warn!(stream = %stream, error = %e, "failed to ack processed entry");
                            continue;
                        }
                        broadcaster.publish(
                            EngineEvent::new(crate::event::EventType::MessageProcessed)
                                .with_stream(stream.clone())
                                .with_message_id(entry.id)
                                .with_consumer(consumer.clone()),
                        );
                    }
                    // else: leave unacked; the next read_claim_or_dlq pass
                    // will re-claim it once it has been idle long enough,
                    // eventually routing it to the DLQ.
                }

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
            Err(e) if e.is_nogroup_error() => {
                // the caller is responsible for `ensure_consumer_group`; treat
                // as transient and let the next pass retry after it's created.
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
            Err(e) => {
                warn!(stream = %stream, group = %group, error = %e, "work-queue worker error, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
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

async fn xadd_fields(
    conn: &mut ConnectionManager,
    stream: &str,
    fields: &[(String, String)],
) -> redis::RedisResult<String> {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream).arg("*");
    for (k, v) in fields {
        cmd.arg(k).arg(v);
    }
    cmd.query_async(conn).await
}

fn keys_dlq(stream: &str) -> String {
    crate::keys::dlq_stream(stream)
}

/// Ensure the consumer group exists for `stream`, tolerating `BUSYGROUP`.
pub async fn ensure_consumer_group(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
) -> crate::error::EngineResult<()> {
    let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
        Err(e) => Err(crate::error::EngineError::ConsumerGroup(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_stream_name_is_suffixed() {
        let stream = "jobs.imageProcessing.v1".to_string();
        let suffix = "worker-0".to_string();
        assert_eq!(format!("{stream}.{suffix}"), "jobs.imageProcessing.v1.worker-0");
    }
}
