//! C8 — request/reply with timeout: the `request`/`response` scripts, the
//! request-side worker loop, the response listener, and the expiry observer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broadcaster::Broadcaster;
use crate::config::DlqConfig;
use crate::dlq;
use crate::error::{EngineError, EngineResult};
use crate::event::EngineEvent;
use crate::keys;
use crate::scripts::Scripts;

const LOCK_CLAIM_BACKOFF: Duration = Duration::from_secs(1);

/// Response style selected by the request's `responseType` field (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Ok,
    Ko,
    Error,
    Timeout,
}

impl ResponseType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OK" => Some(Self::Ok),
            "KO" => Some(Self::Ko),
            "ERROR" => Some(Self::Error),
            "TIMEOUT" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Ko => "KO",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
        }
    }
}

/// Re-encodes a JSON object as an array of `[field, value]` pairs in its
/// `serde_json::Map` iteration order, so `request.lua`/`response.lua` can
/// walk it with `ipairs()` instead of the order-losing `pairs()` over a
/// decoded object.
fn payload_pairs_json(payload: &Value) -> EngineResult<String> {
    let Value::Object(map) = payload else {
        return Ok("[]".to_string());
    };
    let pairs: Vec<(&String, &Value)> = map.iter().collect();
    Ok(serde_json::to_string(&pairs)?)
}

/// Invoke the atomic `request` procedure (§4.8). `payload` must include
/// `responseType`; it is carried through to the request-stream entry as an
/// ordered array of `[field, value]` pairs (see `payload_pairs_json`) so
/// `request.lua` can preserve field order with `ipairs()`.
pub async fn request(
    conn: &mut ConnectionManager,
    scripts: &Scripts,
    req_stream: &str,
    resp_stream: &str,
    correlation_id: &str,
    business_id: &str,
    timeout_sec: i64,
    payload: &Value,
) -> EngineResult<String> {
    let timeout_key = keys::request_timeout_key(correlation_id);
    let shadow_key = keys::request_shadow_key(correlation_id);
    let payload_json = payload_pairs_json(payload)?;

    let id: String = scripts
        .request
        .key(&timeout_key)
        .key(&shadow_key)
        .key(req_stream)
        .arg(correlation_id)
        .arg(business_id)
        .arg(resp_stream)
        .arg(timeout_sec)
        .arg(payload_json)
        .invoke_async(conn)
        .await?;
    Ok(id)
}

/// Invoke the atomic `response` procedure (§4.8). `DEL`-ing an already-expired
/// `timeoutKey` is a harmless no-op, so this is safe to call from both the
/// worker loop and the expiry observer without coordination between them.
pub async fn response(
    conn: &mut ConnectionManager,
    scripts: &Scripts,
    resp_stream: &str,
    correlation_id: &str,
    business_id: &str,
    payload: &Value,
) -> EngineResult<String> {
    let timeout_key = keys::request_timeout_key(correlation_id);
    let payload_json = payload_pairs_json(payload)?;

    let id: String = scripts
        .response
        .key(&timeout_key)
        .key(resp_stream)
        .arg(correlation_id)
        .arg(business_id)
        .arg(payload_json)
        .invoke_async(conn)
        .await?;
    Ok(id)
}

/// The request-side worker: reads `reqStream` via `group`, branches on
/// `responseType`, and resolves each request with exactly one of the four
/// styles named in §4.8.
pub async fn run_worker(
    mut conn: ConnectionManager,
    scripts: Arc<Scripts>,
    req_stream: String,
    group: String,
    consumer: String,
    dlq_config: DlqConfig,
    poll_interval: Duration,
    broadcaster: Broadcaster,
    mut shutdown: watch::Receiver<bool>,
) -> EngineResult<()> {
    crate::work_queue::ensure_consumer_group(&mut conn, &req_stream, &group).await?;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match dlq::read_claim_or_dlq(&mut conn, &scripts, &req_stream, &group, &consumer, &dlq_config, 1).await {
            Ok(result) => {
                for moved in result.dlq_moved {
                    broadcaster.publish(EngineEvent::message_deleted(&req_stream, &moved.original_id));
                }

                for entry in result.delivered {
                    if let Err(e) = handle_request_entry(&mut conn, &scripts, &req_stream, &group, &entry).await {
                        warn!(correlation_id = ?field(&entry, "correlationId"), error = %e, "request handler failed");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }
            Err(e) if e.is_nogroup_error() => {
                tokio::time::sleep(LOCK_CLAIM_BACKOFF).await;
            }
            Err(e) => {
                warn!(stream = %req_stream, error = %e, "request worker error, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(LOCK_CLAIM_BACKOFF) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Looks up the first occurrence of `key` in an entry's ordered fields.
fn field<'a>(entry: &'a dlq::ClaimedEntry, key: &str) -> Option<&'a str> {
    entry.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

/// Builds an ordered `serde_json::Map` from `fields` followed by `extra`,
/// so the resulting `Value::Object` serializes in that same field order.
fn fields_to_ordered_object<'a>(
    fields: &[(String, String)],
    extra: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::with_capacity(fields.len());
    for (k, v) in fields {
        map.insert(k.clone(), Value::String(v.clone()));
    }
    for (k, v) in extra {
        map.insert(k.to_string(), Value::String(v.to_string()));
    }
    map
}

async fn handle_request_entry(
    conn: &mut ConnectionManager,
    scripts: &Scripts,
    req_stream: &str,
    group: &str,
    entry: &dlq::ClaimedEntry,
) -> EngineResult<()> {
    let correlation_id =
        field(entry, "correlationId").ok_or_else(|| EngineError::Validation("request entry missing correlationId".into()))?;
    let business_id =
        field(entry, "businessId").ok_or_else(|| EngineError::Validation("request entry missing businessId".into()))?;
    let response_type = field(entry, "responseType")
        .and_then(ResponseType::parse)
        .unwrap_or(ResponseType::Error);

    match response_type {
        ResponseType::Timeout => {
            // No response, no ack: the client observes the expiry path.
            Ok(())
        }
        ResponseType::Ok => {
            let resp_stream = resp_stream_for(entry);
            let payload = ok_payload(entry);
            response(conn, scripts, &resp_stream, correlation_id, business_id, &payload).await?;
            dlq::ack(conn, req_stream, group, &entry.id).await
        }
        ResponseType::Ko => {
            let resp_stream = resp_stream_for(entry);
            let payload = serde_json::json!({ "responseType": "KO", "reason": "out of stock" });
            response(conn, scripts, &resp_stream, correlation_id, business_id, &payload).await?;
            dlq::ack(conn, req_stream, group, &entry.id).await
        }
        ResponseType::Error => {
            let resp_stream = resp_stream_for(entry);
            let payload = serde_json::json!({ "responseType": "ERROR", "reason": "processing failed" });
            response(conn, scripts, &resp_stream, correlation_id, business_id, &payload).await?;
            // Deliberately not acked: it will retry/DLQ via read_claim_or_dlq.
            Ok(())
        }
    }
}

fn resp_stream_for(entry: &dlq::ClaimedEntry) -> String {
    field(entry, "streamResponseName")
        .map(str::to_string)
        .unwrap_or_else(|| "order.holdInventory.response.v1".to_string())
}

/// Builds the `OK` response payload, preserving the request entry's
/// original field order (SPEC_FULL.md §9) before appending `responseType`.
fn ok_payload(entry: &dlq::ClaimedEntry) -> Value {
    Value::Object(fields_to_ordered_object(&entry.fields, [("responseType", "OK")]))
}

/// The response listener (§4.8): reads `respStream` via `read_claim_or_dlq`
/// with `maxDeliveries=2`, emits a demultiplexable `INFO` event, then acks.
pub async fn run_response_listener(
    mut conn: ConnectionManager,
    scripts: Arc<Scripts>,
    resp_stream: String,
    group: String,
    consumer: String,
    poll_interval: Duration,
    broadcaster: Broadcaster,
    mut shutdown: watch::Receiver<bool>,
) -> EngineResult<()> {
    crate::work_queue::ensure_consumer_group(&mut conn, &resp_stream, &group).await?;
    let dlq_config = DlqConfig {
        max_deliveries: 2,
        min_idle_ms: 100,
    };

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match dlq::read_claim_or_dlq(&mut conn, &scripts, &resp_stream, &group, &consumer, &dlq_config, 10).await {
            Ok(result) => {
                for entry in result.delivered {
                    let payload = Value::Object(fields_to_ordered_object(&entry.fields, std::iter::empty()));
                    broadcaster.publish(
                        EngineEvent::info(format!("response:{}", field(&entry, "correlationId").unwrap_or("?")))
                            .with_payload(payload),
                    );
                    dlq::ack(&mut conn, &resp_stream, &group, &entry.id).await?;
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }
            Err(e) if e.is_nogroup_error() => {
                tokio::time::sleep(LOCK_CLAIM_BACKOFF).await;
            }
            Err(e) => {
                warn!(stream = %resp_stream, error = %e, "response listener error, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(LOCK_CLAIM_BACKOFF) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

const TIMEOUT_KEY_EVENT_CHANNEL: &str = "__keyevent@0__:expired";
const TIMEOUT_KEY_PREFIX: &str = "order.holdInventory.request.timeout.v1:";

/// The expiry observer (§4.8): subscribes to the broker's key-expiry
/// notification channel on its own dedicated `PubSub` connection (keyspace
/// notifications cannot share a `ConnectionManager` used for regular
/// commands) and resolves any request whose timeout key fires first.
pub async fn run_expiry_observer(
    client: redis::Client,
    mut cmd_conn: ConnectionManager,
    scripts: Arc<Scripts>,
    broadcaster: Broadcaster,
    mut shutdown: watch::Receiver<bool>,
) -> EngineResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(TIMEOUT_KEY_EVENT_CHANNEL).await?;

    use futures::StreamExt;
    let mut stream = pubsub.on_message();

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { return Ok(()) };
                let key: String = match msg.get_payload() {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(error = %e, "expiry observer: malformed pubsub payload");
                        continue;
                    }
                };
                let Some(correlation_id) = key.strip_prefix(TIMEOUT_KEY_PREFIX) else {
                    continue;
                };
                if let Err(e) = handle_expiry(&mut cmd_conn, &scripts, &broadcaster, correlation_id).await {
                    warn!(correlation_id, error = %e, "expiry observer: failed to resolve timeout");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_expiry(
    conn: &mut ConnectionManager,
    scripts: &Scripts,
    broadcaster: &Broadcaster,
    correlation_id: &str,
) -> EngineResult<()> {
    let shadow_key = keys::request_shadow_key(correlation_id);
    let shadow: HashMap<String, String> = conn.hgetall(&shadow_key).await?;

    let Some(business_id) = shadow.get("businessId").cloned() else {
        // The response beat the timeout and already cleaned up the shadow.
        return Ok(());
    };
    let resp_stream = shadow
        .get("streamResponseName")
        .cloned()
        .unwrap_or_else(|| "order.holdInventory.response.v1".to_string());

    let payload = serde_json::json!({ "responseType": "TIMEOUT" });
    response(conn, scripts, &resp_stream, correlation_id, &business_id, &payload).await?;
    let _: () = conn.del(&shadow_key).await?;

    info!(correlation_id, business_id, "request timed out");
    broadcaster.publish(
        EngineEvent::info(format!("timeout:{correlation_id}"))
            .with_payload(serde_json::json!({ "correlationId": correlation_id, "businessId": business_id })),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_type_round_trips() {
        for s in ["OK", "KO", "ERROR", "TIMEOUT"] {
            assert_eq!(ResponseType::parse(s).unwrap().as_str(), s);
        }
        assert!(ResponseType::parse("BOGUS").is_none());
    }

    #[test]
    fn timeout_key_prefix_matches_keys_module() {
        let key = keys::request_timeout_key("abc123");
        assert!(key.starts_with(TIMEOUT_KEY_PREFIX));
        assert_eq!(&key[TIMEOUT_KEY_PREFIX.len()..], "abc123");
    }
}
