//! C7 — topic exchange (`route_message`) and C12 — rule store CRUD.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::keys;
use crate::scripts::Scripts;

/// A single routing rule, JSON-serialized as the hash value at
/// `routing:rules:<exchange>` keyed by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub pattern: String,
    pub destination: String,
    pub priority: i64,
    pub enabled: bool,
    #[serde(rename = "stopOnMatch")]
    pub stop_on_match: bool,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMetadata {
    #[serde(rename = "maxRules")]
    pub max_rules: i64,
    pub version: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    pub description: String,
}

impl Default for RuleMetadata {
    fn default() -> Self {
        Self {
            max_rules: 100,
            version: 1,
            updated_at: Utc::now(),
            description: "default routing rule set".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutedTo {
    pub stream: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    pub exchange_id: String,
    pub routed_to: Vec<RoutedTo>,
}

/// Re-encodes a JSON object as an array of `[field, value]` pairs in its
/// `serde_json::Map` iteration order, so the Lua side can walk it with
/// `ipairs()` instead of the order-losing `pairs()` over a decoded object.
fn payload_pairs_json(payload: &Value) -> EngineResult<String> {
    let Value::Object(map) = payload else {
        return Ok("[]".to_string());
    };
    let pairs: Vec<(&String, &Value)> = map.iter().collect();
    Ok(serde_json::to_string(&pairs)?)
}

/// Invoke the atomic `route_message` procedure (§4.7). `payload` must be a
/// flat JSON object of string-coercible fields; `route_message.lua` receives
/// it as an ordered array of `[field, value]` pairs (see `payload_pairs_json`)
/// rather than a decoded JSON object, so field insertion order survives the
/// round trip even though Lua's `pairs()` would not preserve it.
pub async fn route_message(
    conn: &mut ConnectionManager,
    scripts: &Scripts,
    exchange_stream: &str,
    routing_key: &str,
    payload: &Value,
) -> EngineResult<RouteResult> {
    let payload_json = payload_pairs_json(payload)?;

    let raw: redis::Value = scripts
        .route_message
        .key(exchange_stream)
        .arg(routing_key)
        .arg(payload_json)
        .invoke_async(conn)
        .await?;

    let redis::Value::Array(top) = raw else {
        return Err(EngineError::Internal(
            "route_message: expected a 2-element array reply".into(),
        ));
    };
    let mut it = top.into_iter();
    let exchange_id: String = redis::from_redis_value(&it.next().unwrap_or(redis::Value::Nil))?;
    let routed_raw = it.next().unwrap_or(redis::Value::Array(vec![]));

    let redis::Value::Array(routed_items) = routed_raw else {
        return Ok(RouteResult {
            exchange_id,
            routed_to: vec![],
        });
    };

    let mut routed_to = Vec::with_capacity(routed_items.len());
    for item in routed_items {
        let redis::Value::Array(pair) = item else {
            continue;
        };
        let mut pit = pair.into_iter();
        let stream: String = redis::from_redis_value(&pit.next().unwrap_or(redis::Value::Nil))?;
        let message_id: String = redis::from_redis_value(&pit.next().unwrap_or(redis::Value::Nil))?;
        routed_to.push(RoutedTo { stream, message_id });
    }

    Ok(RouteResult {
        exchange_id,
        routed_to,
    })
}

// ---- C12: rule store CRUD -------------------------------------------------

pub async fn list_rules(conn: &mut ConnectionManager, exchange: &str) -> EngineResult<Vec<RoutingRule>> {
    let key = keys::routing_rules_key(exchange);
    let raw: HashMap<String, String> = conn.hgetall(&key).await?;
    let mut rules: Vec<RoutingRule> = raw
        .values()
        .map(|json| serde_json::from_str(json))
        .collect::<Result<_, _>>()?;
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    Ok(rules)
}

pub async fn get_rule(conn: &mut ConnectionManager, exchange: &str, id: &str) -> EngineResult<RoutingRule> {
    let key = keys::routing_rules_key(exchange);
    let raw: Option<String> = conn.hget(&key, id).await?;
    match raw {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Err(EngineError::NotFound(format!("routing rule {id} on {exchange}"))),
    }
}

pub async fn save_rule(conn: &mut ConnectionManager, exchange: &str, rule: &RoutingRule) -> EngineResult<()> {
    let key = keys::routing_rules_key(exchange);
    let json = serde_json::to_string(rule)?;
    let _: () = conn.hset(&key, &rule.id, json).await?;
    touch_metadata(conn, exchange).await
}

pub async fn delete_rule(conn: &mut ConnectionManager, exchange: &str, id: &str) -> EngineResult<()> {
    let key = keys::routing_rules_key(exchange);
    let _: i64 = conn.hdel(&key, id).await?;
    touch_metadata(conn, exchange).await
}

pub async fn get_metadata(conn: &mut ConnectionManager, exchange: &str) -> EngineResult<RuleMetadata> {
    let key = keys::routing_config_key(exchange);
    let raw: HashMap<String, String> = conn.hgetall(&key).await?;
    if raw.is_empty() {
        return Ok(RuleMetadata::default());
    }
    Ok(RuleMetadata {
        max_rules: raw.get("maxRules").and_then(|v| v.parse().ok()).unwrap_or(100),
        version: raw.get("version").and_then(|v| v.parse().ok()).unwrap_or(1),
        updated_at: raw
            .get("updatedAt")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(Utc::now),
        description: raw.get("description").cloned().unwrap_or_default(),
    })
}

pub async fn save_metadata(
    conn: &mut ConnectionManager,
    exchange: &str,
    metadata: &RuleMetadata,
) -> EngineResult<()> {
    let key = keys::routing_config_key(exchange);
    let _: () = conn
        .hset_multiple(
            &key,
            &[
                ("maxRules", metadata.max_rules.to_string()),
                ("version", metadata.version.to_string()),
                ("updatedAt", metadata.updated_at.to_rfc3339()),
                ("description", metadata.description.clone()),
            ],
        )
        .await?;
    Ok(())
}

async fn touch_metadata(conn: &mut ConnectionManager, exchange: &str) -> EngineResult<()> {
    let key = keys::routing_config_key(exchange);
    let _: () = conn.hset(&key, "updatedAt", Utc::now().to_rfc3339()).await?;
    Ok(())
}

/// The default rule set reinstalled by `resetToDefaults`, grounded on
/// scenario S4 (§8): `order.cancelled.*` stops at the audit trail,
/// `order.place.*` fans out to the order stream and both notification
/// channels.
pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule {
            id: "rule-topic-all".to_string(),
            pattern: "^%$".to_string(),
            destination: "events.topic.v1".to_string(),
            priority: 0,
            enabled: true,
            stop_on_match: false,
            description: "mirror every routed event onto the raw topic stream".to_string(),
        },
        RoutingRule {
            id: "rule-order-cancelled-audit".to_string(),
            pattern: "order.cancelled.%".to_string(),
            destination: "events.audit.cancelled".to_string(),
            priority: 1,
            enabled: true,
            stop_on_match: true,
            description: "cancelled orders go to the audit trail and nowhere else".to_string(),
        },
        RoutingRule {
            id: "rule-order-place".to_string(),
            pattern: "order.place.%".to_string(),
            destination: "events.order.v1".to_string(),
            priority: 2,
            enabled: true,
            stop_on_match: false,
            description: "placed orders are recorded on the order stream".to_string(),
        },
        RoutingRule {
            id: "rule-notify-vip".to_string(),
            pattern: "order.place.vip.%".to_string(),
            destination: "events.notification.vip".to_string(),
            priority: 3,
            enabled: true,
            stop_on_match: false,
            description: "VIP customers get a dedicated notification".to_string(),
        },
        RoutingRule {
            id: "rule-notify-gdpr".to_string(),
            pattern: "order.place.%".to_string(),
            destination: "events.notification.gdpr".to_string(),
            priority: 4,
            enabled: true,
            stop_on_match: false,
            description: "every placed order is mirrored to the GDPR notification channel".to_string(),
        },
    ]
}

pub async fn reset_to_defaults(conn: &mut ConnectionManager, exchange: &str) -> EngineResult<()> {
    let rules_key = keys::routing_rules_key(exchange);
    let config_key = keys::routing_config_key(exchange);
    let _: () = conn.del(&rules_key).await?;
    let _: () = conn.del(&config_key).await?;

    for rule in default_rules() {
        save_rule(conn, exchange, &rule).await?;
    }
    save_metadata(conn, exchange, &RuleMetadata::default()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_match_scenario_s4() {
        let rules = default_rules();
        let cancelled_vip = rules
            .iter()
            .find(|r| r.id == "rule-order-cancelled-audit")
            .unwrap();
        assert!(cancelled_vip.stop_on_match);
        assert_eq!(cancelled_vip.destination, "events.audit.cancelled");

        let place = rules.iter().find(|r| r.id == "rule-order-place").unwrap();
        assert!(!place.stop_on_match);
    }

    #[test]
    fn rule_sort_is_priority_then_id() {
        let mut rules = default_rules();
        rules.reverse();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        assert_eq!(rules[0].id, "rule-topic-all");
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn s4_topic_fanout_with_stop_on_match() {
        let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = redis::Client::open(redis_url).expect("valid redis url");
        let mut conn = ConnectionManager::new(client).await.expect("connect to redis");
        let scripts = crate::scripts::Scripts::new();
        scripts.install(&mut conn).await.unwrap();

        let exchange = "events.topic.v1";
        for destination in [
            "events.topic.v1",
            "events.audit.cancelled",
            "events.order.v1",
            "events.notification.vip",
            "events.notification.gdpr",
        ] {
            let _: i64 = conn.del(destination).await.unwrap();
        }
        reset_to_defaults(&mut conn, exchange).await.unwrap();

        let cancelled = route_message(
            &mut conn,
            &scripts,
            exchange,
            "order.cancelled.vip.eu.v1",
            &serde_json::json!({ "orderId": "1" }),
        )
        .await
        .unwrap();
        let mut cancelled_streams: Vec<&str> = cancelled.routed_to.iter().map(|r| r.stream.as_str()).collect();
        cancelled_streams.sort();
        assert_eq!(cancelled_streams, vec!["events.audit.cancelled", "events.topic.v1"]);

        let placed = route_message(
            &mut conn,
            &scripts,
            exchange,
            "order.place.vip.eu.v1",
            &serde_json::json!({ "orderId": "2" }),
        )
        .await
        .unwrap();
        let mut placed_streams: Vec<&str> = placed.routed_to.iter().map(|r| r.stream.as_str()).collect();
        placed_streams.sort();
        assert_eq!(
            placed_streams,
            vec![
                "events.notification.gdpr",
                "events.notification.vip",
                "events.order.v1",
                "events.topic.v1",
            ]
        );
    }
}
