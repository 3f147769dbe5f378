//! C9 — per-key serialized processor.
//!
//! AUTOCLAIM-first, then a short-block group read. Per-key ordering is
//! enforced by a non-blocking `SET ... NX PX` lock rather than a queue per
//! key; losing the lock leaves the entry pending for a future AUTOCLAIM pass.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::watch;
use tracing::warn;

use crate::broadcaster::Broadcaster;
use crate::event::{EngineEvent, EventType};
use crate::keys;

const PROCESSING_DELAY_MS: u64 = 50;
const READ_BLOCK_MS: usize = 200;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub async fn run_worker(
    mut conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    idle_claim_ms: u64,
    lock_ttl_ms: u64,
    broadcaster: Broadcaster,
    mut shutdown: watch::Receiver<bool>,
) -> redis::RedisResult<()> {
    crate::work_queue::ensure_consumer_group(&mut conn, &stream, &group)
        .await
        .ok();

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let candidate = match claim_or_read(&mut conn, &stream, &group, &consumer, idle_claim_ms).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
                continue;
            }
            Err(e) => {
                warn!(stream = %stream, error = %e, "per-key worker read error, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
                continue;
            }
        };

        let Some(business_key) = candidate
            .fields
            .iter()
            .find(|(k, _)| k == "businessKey")
            .map(|(_, v)| v.clone())
        else {
            warn!(entry_id = %candidate.id, "per-key entry missing businessKey, skipping");
            continue;
        };

        let lock_key = keys::per_key_lock(&business_key);
        let acquired = try_acquire_lock(&mut conn, &lock_key, &candidate.id, lock_ttl_ms)
            .await
            .unwrap_or(false);

        if !acquired {
            // Leave pending; a future AUTOCLAIM (by this worker or another)
            // will resurface it once idle_claim_ms has elapsed.
            continue;
        }

        tokio::time::sleep(Duration::from_millis(PROCESSING_DELAY_MS)).await;

        let done_stream = format!("{stream}.{consumer}.done");
        match xadd_fields(&mut conn, &done_stream, &candidate.fields).await {
            Ok(_) => {
                let _: redis::RedisResult<i64> = conn.xack(&stream, &group, &[&candidate.id]).await;
                broadcaster.publish(
                    EngineEvent::new(EventType::MessageProcessed)
                        .with_stream(stream.clone())
                        .with_message_id(candidate.id.clone())
                        .with_consumer(consumer.clone()),
                );
            }
            Err(e) => {
                warn!(stream = %stream, error = %e, "per-key done-stream append failed");
            }
        }

        release_lock(&mut conn, &lock_key, &candidate.id).await;
    }
}

struct Candidate {
    id: String,
    fields: Vec<(String, String)>,
}

/// Parses one RESP `[id, [field, value, ...]]` stream-entry pair by hand.
/// `StreamId.map` in redis-rs's typed replies is a `HashMap`, which would
/// discard field order (SPEC_FULL.md §9); this keeps `XADD`'s order intact.
fn parse_stream_entry(value: redis::Value) -> Option<(String, Vec<(String, String)>)> {
    let redis::Value::Array(parts) = value else {
        return None;
    };
    let mut it = parts.into_iter();
    let id: String = redis::from_redis_value(&it.next()?).ok()?;
    let fields: Vec<(String, String)> = match it.next() {
        Some(v) => redis::from_redis_value(&v).unwrap_or_default(),
        None => vec![],
    };
    Some((id, fields))
}

fn parse_xautoclaim(raw: redis::Value) -> Option<Candidate> {
    let redis::Value::Array(parts) = raw else {
        return None;
    };
    let mut it = parts.into_iter();
    let _cursor = it.next()?;
    let redis::Value::Array(entries) = it.next()? else {
        return None;
    };
    let entry = entries.into_iter().next()?;
    let (id, fields) = parse_stream_entry(entry)?;
    Some(Candidate { id, fields })
}

fn parse_xreadgroup(raw: redis::Value) -> Option<Candidate> {
    let redis::Value::Array(streams) = raw else {
        return None;
    };
    for stream_reply in streams {
        let redis::Value::Array(pair) = stream_reply else {
            continue;
        };
        let mut it = pair.into_iter();
        let _name = it.next();
        let Some(redis::Value::Array(entries)) = it.next() else {
            continue;
        };
        if let Some(entry) = entries.into_iter().next() {
            if let Some((id, fields)) = parse_stream_entry(entry) {
                return Some(Candidate { id, fields });
            }
        }
    }
    None
}

async fn claim_or_read(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
    consumer: &str,
    idle_claim_ms: u64,
) -> redis::RedisResult<Option<Candidate>> {
    let raw: redis::Value = redis::cmd("XAUTOCLAIM")
        .arg(stream)
        .arg(group)
        .arg(consumer)
        .arg(idle_claim_ms)
        .arg("0-0")
        .arg("COUNT")
        .arg(1)
        .query_async(conn)
        .await?;

    if let Some(candidate) = parse_xautoclaim(raw) {
        return Ok(Some(candidate));
    }

    let raw: redis::Value = redis::cmd("XREADGROUP")
        .arg("GROUP")
        .arg(group)
        .arg(consumer)
        .arg("COUNT")
        .arg(1)
        .arg("BLOCK")
        .arg(READ_BLOCK_MS)
        .arg("STREAMS")
        .arg(stream)
        .arg(">")
        .query_async(conn)
        .await?;

    Ok(parse_xreadgroup(raw))
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

/// `SET key value NX PX ttl`: returns `true` iff this call won the lock.
async fn try_acquire_lock(
    conn: &mut ConnectionManager,
    lock_key: &str,
    entry_id: &str,
    ttl_ms: u64,
) -> redis::RedisResult<bool> {
    let reply: Option<String> = redis::cmd("SET")
        .arg(lock_key)
        .arg(entry_id)
        .arg("NX")
        .arg("PX")
        .arg(ttl_ms)
        .query_async(conn)
        .await?;
    Ok(reply.is_some())
}

/// Release is explicit and called from every outcome arm rather than via
/// `Drop` (which cannot await); a mismatched lock value (another worker's
/// lock after our TTL expired mid-processing) is left untouched.
async fn release_lock(conn: &mut ConnectionManager, lock_key: &str, our_entry_id: &str) {
    let held: Option<String> = conn.get(lock_key).await.unwrap_or(None);
    if held.as_deref() == Some(our_entry_id) {
        let _: redis::RedisResult<i64> = conn.del(lock_key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_stream_is_per_consumer() {
        let stream = "order.process.v1".to_string();
        let consumer = "worker-2".to_string();
        assert_eq!(format!("{stream}.{consumer}.done"), "order.process.v1.worker-2.done");
    }
}
