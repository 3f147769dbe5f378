//! C4 — DLQ claimer (`read_claim_or_dlq`) plus the DLQ-config CRUD and
//! stream-inspection helpers the `/api/dlq/*` HTTP surface needs.

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::DlqConfig;
use crate::error::{EngineError, EngineResult};
use crate::keys;
use crate::scripts::Scripts;

/// One entry delivered by `read_claim_or_dlq`, either freshly delivered or
/// re-claimed from the PEL. `fields` keeps the original `XADD` insertion
/// order (SPEC_FULL.md §9) rather than round-tripping through a `HashMap`.
#[derive(Debug, Clone)]
pub struct ClaimedEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

/// One entry that crossed the delivery threshold and was moved to the DLQ
/// by the same atomic call.
#[derive(Debug, Clone)]
pub struct DlqMove {
    pub original_id: String,
    pub fields: Vec<(String, String)>,
    pub dlq_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReadClaimOrDlqResult {
    pub delivered: Vec<ClaimedEntry>,
    pub dlq_moved: Vec<DlqMove>,
}

/// Call the atomic `read_claim_or_dlq` procedure (§4.4). `count` applies
/// independently to the PEL scan and the trailing read.
pub async fn read_claim_or_dlq(
    conn: &mut ConnectionManager,
    scripts: &Scripts,
    stream: &str,
    group: &str,
    consumer: &str,
    dlq: &DlqConfig,
    count: i64,
) -> EngineResult<ReadClaimOrDlqResult> {
    let dlq_stream = keys::dlq_stream(stream);

    let raw: redis::Value = scripts
        .read_claim_or_dlq
        .key(stream)
        .key(&dlq_stream)
        .arg(group)
        .arg(consumer)
        .arg(dlq.min_idle_ms)
        .arg(count)
        .arg(dlq.max_deliveries)
        .invoke_async(conn)
        .await?;

    parse_read_claim_or_dlq(raw)
}

fn parse_read_claim_or_dlq(raw: redis::Value) -> EngineResult<ReadClaimOrDlqResult> {
    let redis::Value::Array(top) = raw else {
        return Err(EngineError::Internal(
            "read_claim_or_dlq: expected a 2-element array reply".into(),
        ));
    };
    let mut it = top.into_iter();
    let delivered_raw = it.next().unwrap_or(redis::Value::Array(vec![]));
    let dlq_moved_raw = it.next().unwrap_or(redis::Value::Array(vec![]));

    let delivered = parse_delivered(delivered_raw)?;
    let dlq_moved = parse_dlq_moved(dlq_moved_raw)?;

    Ok(ReadClaimOrDlqResult {
        delivered,
        dlq_moved,
    })
}

fn parse_delivered(raw: redis::Value) -> EngineResult<Vec<ClaimedEntry>> {
    let redis::Value::Array(items) = raw else {
        return Ok(vec![]);
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let redis::Value::Array(pair) = item else {
            continue;
        };
        let mut it = pair.into_iter();
        let id: String = redis::from_redis_value(&it.next().unwrap_or(redis::Value::Nil))?;
        let fields: Vec<(String, String)> =
            redis::from_redis_value(&it.next().unwrap_or(redis::Value::Array(vec![])))?;
        out.push(ClaimedEntry { id, fields });
    }
    Ok(out)
}

fn parse_dlq_moved(raw: redis::Value) -> EngineResult<Vec<DlqMove>> {
    let redis::Value::Array(items) = raw else {
        return Ok(vec![]);
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let redis::Value::Array(triple) = item else {
            continue;
        };
        let mut it = triple.into_iter();
        let original_id: String = redis::from_redis_value(&it.next().unwrap_or(redis::Value::Nil))?;
        let fields: Vec<(String, String)> =
            redis::from_redis_value(&it.next().unwrap_or(redis::Value::Array(vec![])))?;
        let dlq_id: String = redis::from_redis_value(&it.next().unwrap_or(redis::Value::Nil))?;
        out.push(DlqMove {
            original_id,
            fields,
            dlq_id,
        });
    }
    Ok(out)
}

/// Append a payload to `stream`, preserving insertion order of its fields
/// (the spec's field-order invariant applies here too, since `/api/dlq/produce`
/// echoes the same entry back out through the tailer).
pub async fn produce(
    conn: &mut ConnectionManager,
    stream: &str,
    fields: &[(String, String)],
) -> EngineResult<String> {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream).arg("*");
    for (k, v) in fields {
        cmd.arg(k).arg(v);
    }
    let id: String = cmd.query_async(conn).await?;
    Ok(id)
}

pub async fn ack(conn: &mut ConnectionManager, stream: &str, group: &str, id: &str) -> EngineResult<()> {
    let _: i64 = conn.xack(stream, group, &[id]).await?;
    Ok(())
}

/// Last N entries of a stream, newest first, via `XREVRANGE`. Parses the raw
/// RESP reply by hand rather than going through `StreamRangeReply`, whose
/// `StreamId.map` is a `HashMap` and would discard field order (SPEC_FULL.md §9).
pub async fn last_n(
    conn: &mut ConnectionManager,
    stream: &str,
    count: usize,
) -> EngineResult<Vec<(String, Vec<(String, String)>)>> {
    let raw: redis::Value = redis::cmd("XREVRANGE")
        .arg(stream)
        .arg("+")
        .arg("-")
        .arg("COUNT")
        .arg(count)
        .query_async(conn)
        .await?;

    let redis::Value::Array(items) = raw else {
        return Ok(vec![]);
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let redis::Value::Array(pair) = item else {
            continue;
        };
        let mut it = pair.into_iter();
        let id: String = redis::from_redis_value(&it.next().unwrap_or(redis::Value::Nil))?;
        let fields: Vec<(String, String)> =
            redis::from_redis_value(&it.next().unwrap_or(redis::Value::Array(vec![])))?;
        out.push((id, fields));
    }
    Ok(out)
}

pub async fn delete_stream(conn: &mut ConnectionManager, stream: &str) -> EngineResult<()> {
    let _: i64 = conn.del(stream).await?;
    Ok(())
}

/// Read the DLQ policy stored at `dlq:config:<stream>`, falling back to the
/// process-wide default if unset.
pub async fn get_config(
    conn: &mut ConnectionManager,
    stream: &str,
    default: &DlqConfig,
) -> EngineResult<DlqConfig> {
    let key = keys::dlq_config_key(stream);
    let raw: HashMap<String, String> = conn.hgetall(&key).await?;
    if raw.is_empty() {
        return Ok(*default);
    }
    let max_deliveries = raw
        .get("maxDeliveries")
        .and_then(|v| v.parse().ok())
        .unwrap_or(default.max_deliveries);
    let min_idle_ms = raw
        .get("minIdleMs")
        .and_then(|v| v.parse().ok())
        .unwrap_or(default.min_idle_ms);
    Ok(DlqConfig {
        max_deliveries,
        min_idle_ms,
    })
}

pub async fn set_config(conn: &mut ConnectionManager, stream: &str, cfg: &DlqConfig) -> EngineResult<()> {
    let key = keys::dlq_config_key(stream);
    let _: () = conn
        .hset_multiple(
            &key,
            &[
                ("maxDeliveries", cfg.max_deliveries.to_string()),
                ("minIdleMs", cfg.min_idle_ms.to_string()),
            ],
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_reply() {
        let raw = redis::Value::Array(vec![redis::Value::Array(vec![]), redis::Value::Array(vec![])]);
        let result = parse_read_claim_or_dlq(raw).unwrap();
        assert!(result.delivered.is_empty());
        assert!(result.dlq_moved.is_empty());
    }

    #[test]
    fn parse_delivered_entries() {
        let raw = redis::Value::Array(vec![
            redis::Value::Array(vec![
                redis::Value::BulkString(b"1-0".to_vec()),
                redis::Value::Array(vec![
                    redis::Value::BulkString(b"type".to_vec()),
                    redis::Value::BulkString(b"order.created".to_vec()),
                ]),
            ]),
            redis::Value::Array(vec![]),
        ]);
        let result = parse_read_claim_or_dlq(raw).unwrap();
        assert_eq!(result.delivered.len(), 1);
        assert_eq!(result.delivered[0].id, "1-0");
        assert_eq!(
            result.delivered[0]
                .fields
                .iter()
                .find(|(k, _)| k == "type")
                .map(|(_, v)| v.as_str()),
            Some("order.created")
        );
    }

    #[test]
    fn parse_dlq_moved_entries() {
        let raw = redis::Value::Array(vec![
            redis::Value::Array(vec![]),
            redis::Value::Array(vec![redis::Value::Array(vec![
                redis::Value::BulkString(b"1-0".to_vec()),
                redis::Value::Array(vec![
                    redis::Value::BulkString(b"type".to_vec()),
                    redis::Value::BulkString(b"order.cancelled".to_vec()),
                ]),
                redis::Value::BulkString(b"2-0".to_vec()),
            ])]),
        ]);
        let result = parse_read_claim_or_dlq(raw).unwrap();
        assert_eq!(result.dlq_moved.len(), 1);
        assert_eq!(result.dlq_moved[0].original_id, "1-0");
        assert_eq!(result.dlq_moved[0].dlq_id, "2-0");
    }

    async fn test_conn() -> ConnectionManager {
        let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = redis::Client::open(redis_url).expect("valid redis url");
        ConnectionManager::new(client).await.expect("connect to redis")
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn s1_happy_dlq_success() {
        let mut conn = test_conn().await;
        let scripts = Scripts::new();
        scripts.install(&mut conn).await.unwrap();

        let stream = "test-stream";
        let group = "s1-group";
        let _: i64 = conn.del(stream).await.unwrap();
        let _: i64 = conn.del(keys::dlq_stream(stream)).await.unwrap();
        crate::work_queue::ensure_consumer_group(&mut conn, stream, group)
            .await
            .unwrap();

        let fields = vec![
            ("type".to_string(), "order.created".to_string()),
            ("order_id".to_string(), "1001".to_string()),
            ("amount".to_string(), "59.90".to_string()),
        ];
        produce(&mut conn, stream, &fields).await.unwrap();

        let dlq_cfg = DlqConfig::default();
        let result = read_claim_or_dlq(&mut conn, &scripts, stream, group, "s1-consumer", &dlq_cfg, 1)
            .await
            .unwrap();
        assert_eq!(result.delivered.len(), 1);
        assert!(result.dlq_moved.is_empty());
        let entry = &result.delivered[0];
        ack(&mut conn, stream, group, &entry.id).await.unwrap();

        let len: i64 = conn.xlen(stream).await.unwrap();
        assert_eq!(len, 1);
        let pending: redis::streams::StreamPendingReply = conn.xpending(stream, group).await.unwrap();
        assert_eq!(pending.count, 0);
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn s2_dlq_routing() {
        let mut conn = test_conn().await;
        let scripts = Scripts::new();
        scripts.install(&mut conn).await.unwrap();

        let stream = "test-stream";
        let group = "s2-group";
        let dlq_stream_name = keys::dlq_stream(stream);
        let _: i64 = conn.del(stream).await.unwrap();
        let _: i64 = conn.del(&dlq_stream_name).await.unwrap();
        crate::work_queue::ensure_consumer_group(&mut conn, stream, group)
            .await
            .unwrap();

        let fields = vec![
            ("type".to_string(), "order.cancelled".to_string()),
            ("order_id".to_string(), "1002".to_string()),
        ];
        let original_id = produce(&mut conn, stream, &fields).await.unwrap();

        let dlq_cfg = DlqConfig {
            max_deliveries: 2,
            min_idle_ms: 100,
        };
        let mut last = ReadClaimOrDlqResult::default();
        for _ in 0..3 {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            last = read_claim_or_dlq(&mut conn, &scripts, stream, group, "s2-consumer", &dlq_cfg, 1)
                .await
                .unwrap();
        }

        assert_eq!(last.dlq_moved.len(), 1);
        assert_eq!(last.dlq_moved[0].original_id, original_id);

        let moved = last_n(&mut conn, &dlq_stream_name, 1).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].1, fields);
    }
}
