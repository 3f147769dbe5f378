//! C10 — token bucket limiter.
//!
//! Same AUTOCLAIM-then-read shape as C9 (`per_key::claim_or_read`'s sibling),
//! but serialization is per job *type* via a counter instead of per
//! business key via a lock, and a refused acquire leaves the entry pending
//! rather than retrying immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::watch;
use tracing::warn;

use crate::broadcaster::Broadcaster;
use crate::event::{EngineEvent, EventType};
use crate::keys;
use crate::scripts::Scripts;

const READ_BLOCK_MS: usize = 200;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const PROGRESS_STREAM_MAXLEN: usize = 1000;
const HISTORY_LIST_CAP: isize = 99;

struct Candidate {
    id: String,
    fields: Vec<(String, String)>,
}

pub async fn run_worker(
    mut conn: ConnectionManager,
    scripts: Arc<Scripts>,
    stream: String,
    group: String,
    consumer: String,
    idle_claim_ms: u64,
    processing_ms: HashMap<String, u64>,
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
            Ok(Some(c)) => c,
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
                warn!(stream = %stream, error = %e, "token-bucket worker read error, backing off");
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

        let Some(job_type) = candidate.fields.iter().find(|(k, _)| k == "type").map(|(_, v)| v.clone()) else {
            warn!(entry_id = %candidate.id, "token-bucket entry missing type, skipping");
            continue;
        };

        let max: i64 = conn
            .hget::<_, _, Option<String>>(keys::TOKEN_BUCKET_CONFIG, keys::token_bucket_max_field(&job_type))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let running_key = keys::token_bucket_running_key(&job_type);
        let acquired = acquire(&mut conn, &scripts, &running_key, max).await.unwrap_or(false);

        if !acquired {
            // Leave pending; another worker may succeed later once running drops.
            continue;
        }

        emit_progress(&mut conn, &broadcaster, &stream, &candidate.id, "STARTED").await;
        let _: redis::RedisResult<i64> = conn.lpush("token-bucket:submitted", &candidate.id).await;
        let _: redis::RedisResult<()> = conn.ltrim("token-bucket:submitted", 0, HISTORY_LIST_CAP).await;

        let delay = processing_ms.get(&job_type).copied().unwrap_or(100);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        emit_progress(&mut conn, &broadcaster, &stream, &candidate.id, "COMPLETED").await;
        let _: redis::RedisResult<i64> = conn.lpush("token-bucket:completed", &candidate.id).await;
        let _: redis::RedisResult<()> = conn.ltrim("token-bucket:completed", 0, HISTORY_LIST_CAP).await;

        let done_stream = format!("{stream}.done");
        if xadd_fields(&mut conn, &done_stream, &candidate.fields).await.is_ok() {
            let _: redis::RedisResult<i64> = conn.xack(&stream, &group, &[&candidate.id]).await;
            broadcaster.publish(
                EngineEvent::new(EventType::MessageProcessed)
                    .with_stream(stream.clone())
                    .with_message_id(candidate.id.clone())
                    .with_consumer(consumer.clone()),
            );
        }

        release(&mut conn, &running_key).await;
    }
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

async fn acquire(
    conn: &mut ConnectionManager,
    scripts: &Scripts,
    running_key: &str,
    max: i64,
) -> redis::RedisResult<bool> {
    let acquired: i64 = scripts
        .token_bucket_acquire
        .key(running_key)
        .arg(max)
        .invoke_async(conn)
        .await?;
    Ok(acquired == 1)
}

async fn release(conn: &mut ConnectionManager, running_key: &str) {
    let _: redis::RedisResult<i64> = conn.decr(running_key, 1).await;
}

async fn emit_progress(
    conn: &mut ConnectionManager,
    broadcaster: &Broadcaster,
    stream: &str,
    entry_id: &str,
    phase: &str,
) {
    let progress_stream = format!("{stream}.progress");
    let mut cmd = redis::cmd("XADD");
    cmd.arg(&progress_stream)
        .arg("MAXLEN")
        .arg("~")
        .arg(PROGRESS_STREAM_MAXLEN)
        .arg("*")
        .arg("entryId")
        .arg(entry_id)
        .arg("phase")
        .arg(phase);
    let _: redis::RedisResult<String> = cmd.query_async(conn).await;

    broadcaster.publish(
        EngineEvent::info(format!("{phase}:{entry_id}"))
            .with_stream(stream.to_string())
            .with_message_id(entry_id.to_string()),
    );
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn progress_and_done_stream_names() {
        let stream = "jobs.render.v1".to_string();
        assert_eq!(format!("{stream}.progress"), "jobs.render.v1.progress");
        assert_eq!(format!("{stream}.done"), "jobs.render.v1.done");
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn s6_token_bucket_cap() {
        let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = redis::Client::open(redis_url).expect("valid redis url");
        let mut conn = ConnectionManager::new(client).await.expect("connect to redis");
        let scripts = Arc::new(Scripts::new());
        scripts.install(&mut conn).await.unwrap();

        let running_key = keys::token_bucket_running_key("s6-payment");
        let _: i64 = conn.del(&running_key).await.unwrap();

        let max = 2i64;
        let in_flight = Arc::new(AtomicI64::new(0));
        let peak = Arc::new(AtomicI64::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let mut conn = conn.clone();
            let scripts = scripts.clone();
            let running_key = running_key.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if acquire(&mut conn, &scripts, &running_key, max).await.unwrap_or(false) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                release(&mut conn, &running_key).await;
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= max);
        let final_running: i64 = conn.get(&running_key).await.unwrap_or(0);
        assert_eq!(final_running, 0);
    }
}
