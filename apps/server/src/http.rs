//! The `/api/*` HTTP surface: one handler per operation named in the
//! external-interface design, built directly on `engine`'s component
//! functions. Every success response is a bare JSON object; every error
//! goes through [`crate::error::ApiError`]'s uniform `{success:false,message}` shape.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use redis::AsyncCommands;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use engine::{dlq, request_reply, scheduler, topic};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::streams;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/dlq/produce", post(dlq_produce))
        .route("/api/dlq/process", post(dlq_process))
        .route("/api/dlq/stream/{name}", get(dlq_stream_get).delete(dlq_stream_delete))
        .route("/api/dlq/config", get(dlq_config_get).post(dlq_config_set))
        .route("/api/work-queue/produce", post(work_queue_produce))
        .route("/api/work-queue/streams", get(work_queue_streams))
        .route("/api/fanout/produce", post(fanout_produce))
        .route("/api/fanout/streams", get(fanout_streams))
        .route("/api/topic/route", post(topic_route))
        .route("/api/topic/rules", get(topic_rules_list))
        .route(
            "/api/topic/rules/{id}",
            get(topic_rule_get).post(topic_rule_save).delete(topic_rule_delete),
        )
        .route("/api/topic/metadata", get(topic_metadata_get).post(topic_metadata_set))
        .route("/api/topic/reset", post(topic_reset))
        .route("/api/request-reply/send", post(request_reply_send))
        .route("/api/per-key-serialized/submit", post(per_key_submit))
        .route("/api/token-bucket/config", get(token_bucket_config_get).post(token_bucket_config_set))
        .route("/api/token-bucket/submit", post(token_bucket_submit))
        .route("/api/token-bucket/progress", get(token_bucket_progress))
        .route("/api/token-bucket/logs", get(token_bucket_logs).delete(token_bucket_logs_clear))
        .route("/api/token-bucket/clear", post(token_bucket_clear))
        .route(
            "/api/scheduled/messages",
            get(scheduled_list).post(scheduled_create).put(scheduled_update).delete(scheduled_delete),
        )
        .route("/api/scheduled/clear", post(scheduled_clear))
        .with_state(state)
}

/// Flattens a JSON object into ordered `(field, value)` string pairs the way
/// `XADD` wants them; scalars stringify directly, nested values carry their
/// JSON text so nothing is silently dropped.
fn json_object_to_fields(payload: &Value) -> Vec<(String, String)> {
    let Value::Object(map) = payload else {
        return vec![];
    };
    map.iter().map(|(k, v)| (k.clone(), value_to_field(v))).collect()
}

fn value_to_field(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn fields_to_value(fields: &[(String, String)]) -> Value {
    let map: Map<String, Value> = fields.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
    Value::Object(map)
}

// ---- C4: DLQ claimer -------------------------------------------------------

#[derive(Deserialize)]
struct DlqProduceBody {
    #[serde(rename = "streamName")]
    stream_name: String,
    payload: Value,
}

async fn dlq_produce(State(state): State<AppState>, Json(body): Json<DlqProduceBody>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let fields = json_object_to_fields(&body.payload);
    let message_id = dlq::produce(&mut conn, &body.stream_name, &fields).await?;
    Ok(Json(json!({
        "success": true,
        "messageId": message_id,
        "streamName": body.stream_name,
    })))
}

#[derive(Deserialize)]
struct DlqProcessBody {
    #[serde(rename = "shouldSucceed")]
    should_succeed: bool,
}

async fn dlq_process(State(state): State<AppState>, Json(body): Json<DlqProcessBody>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let result = dlq::read_claim_or_dlq(
        &mut conn,
        &state.scripts,
        streams::DLQ_DEMO_STREAM,
        streams::DLQ_DEMO_GROUP,
        "http-demo-consumer",
        &state.config.dlq_defaults,
        1,
    )
    .await?;

    if !result.dlq_moved.is_empty() {
        let moved = &result.dlq_moved[0];
        return Ok(Json(json!({
            "success": true,
            "messageId": moved.original_id,
            "movedToDlq": true,
            "dlqMessageId": moved.dlq_id,
        })));
    }

    let Some(entry) = result.delivered.into_iter().next() else {
        return Ok(Json(json!({ "success": true, "messageId": Value::Null })));
    };

    if body.should_succeed {
        dlq::ack(&mut conn, streams::DLQ_DEMO_STREAM, streams::DLQ_DEMO_GROUP, &entry.id).await?;
    }

    Ok(Json(json!({
        "success": true,
        "messageId": entry.id,
        "movedToDlq": false,
    })))
}

#[derive(Deserialize)]
struct CountQuery {
    count: Option<usize>,
}

async fn dlq_stream_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<CountQuery>,
) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let entries = dlq::last_n(&mut conn, &name, q.count.unwrap_or(20)).await?;
    let entries: Vec<Value> = entries
        .into_iter()
        .map(|(id, fields)| json!({ "id": id, "fields": fields_to_value(&fields) }))
        .collect();
    Ok(Json(json!({ "success": true, "entries": entries })))
}

async fn dlq_stream_delete(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    dlq::delete_stream(&mut conn, &name).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct StreamNameQuery {
    #[serde(rename = "streamName")]
    stream_name: Option<String>,
}

async fn dlq_config_get(State(state): State<AppState>, Query(q): Query<StreamNameQuery>) -> ApiResult<Json<Value>> {
    let stream_name = q.stream_name.unwrap_or_else(|| streams::DLQ_DEMO_STREAM.to_string());
    let mut conn = state.conn();
    let config = dlq::get_config(&mut conn, &stream_name, &state.config.dlq_defaults).await?;
    Ok(Json(json!({
        "success": true,
        "streamName": stream_name,
        "maxDeliveries": config.max_deliveries,
        "minIdleMs": config.min_idle_ms,
    })))
}

#[derive(Deserialize)]
struct DlqConfigBody {
    #[serde(rename = "streamName")]
    stream_name: Option<String>,
    #[serde(rename = "maxDeliveries")]
    max_deliveries: i64,
    #[serde(rename = "minIdleMs")]
    min_idle_ms: i64,
}

async fn dlq_config_set(State(state): State<AppState>, Json(body): Json<DlqConfigBody>) -> ApiResult<Json<Value>> {
    let stream_name = body.stream_name.unwrap_or_else(|| streams::DLQ_DEMO_STREAM.to_string());
    let mut conn = state.conn();
    let config = engine::DlqConfig {
        max_deliveries: body.max_deliveries,
        min_idle_ms: body.min_idle_ms,
    };
    dlq::set_config(&mut conn, &stream_name, &config).await?;
    Ok(Json(json!({ "success": true, "streamName": stream_name })))
}

// ---- C5: work-queue workers -------------------------------------------------

#[derive(Deserialize)]
struct WorkQueueProduceBody {
    #[serde(rename = "jobId")]
    job_id: String,
    #[serde(rename = "processingType")]
    processing_type: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

async fn work_queue_produce(State(state): State<AppState>, Json(body): Json<WorkQueueProduceBody>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let mut fields = vec![
        ("jobId".to_string(), body.job_id),
        ("processingType".to_string(), body.processing_type),
    ];
    fields.extend(json_object_to_fields(&Value::Object(body.fields)));
    let message_id = dlq::produce(&mut conn, streams::WORK_QUEUE_STREAM, &fields).await?;
    Ok(Json(json!({ "success": true, "messageId": message_id, "streamName": streams::WORK_QUEUE_STREAM })))
}

async fn work_queue_streams(State(state): State<AppState>) -> Json<Value> {
    let mut names = vec![streams::WORK_QUEUE_STREAM.to_string(), engine::keys::dlq_stream(streams::WORK_QUEUE_STREAM)];
    for i in 0..state.config.work_queue_workers {
        names.push(format!("{}.worker-{i}.done", streams::WORK_QUEUE_STREAM));
    }
    Json(json!({ "success": true, "streams": names }))
}

// ---- C6: fan-out workers -----------------------------------------------------

#[derive(Deserialize)]
struct FanoutProduceBody {
    #[serde(rename = "eventId")]
    event_id: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

async fn fanout_produce(State(state): State<AppState>, Json(body): Json<FanoutProduceBody>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let mut fields = vec![("eventId".to_string(), body.event_id)];
    fields.extend(json_object_to_fields(&Value::Object(body.fields)));
    let message_id = dlq::produce(&mut conn, streams::FANOUT_STREAM, &fields).await?;
    Ok(Json(json!({ "success": true, "messageId": message_id, "streamName": streams::FANOUT_STREAM })))
}

async fn fanout_streams(State(state): State<AppState>) -> Json<Value> {
    let mut names = vec![streams::FANOUT_STREAM.to_string(), engine::keys::dlq_stream(streams::FANOUT_STREAM)];
    for i in 0..state.config.fanout_workers {
        names.push(format!("{}.worker-{i}.done", streams::FANOUT_STREAM));
    }
    Json(json!({ "success": true, "streams": names }))
}

// ---- C7 / C12: topic exchange and rule store --------------------------------

#[derive(Deserialize)]
struct ExchangeQuery {
    exchange: Option<String>,
}

fn exchange_or_default(exchange: Option<String>) -> String {
    exchange.unwrap_or_else(|| streams::TOPIC_EXCHANGE_STREAM.to_string())
}

#[derive(Deserialize)]
struct TopicRouteBody {
    #[serde(rename = "routingKey")]
    routing_key: String,
    #[serde(rename = "eventId")]
    event_id: String,
    data: Value,
}

async fn topic_route(State(state): State<AppState>, Json(body): Json<TopicRouteBody>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let mut payload = match body.data {
        Value::Object(m) => m,
        other => {
            let mut m = Map::new();
            m.insert("data".to_string(), other);
            m
        }
    };
    payload.insert("eventId".to_string(), Value::String(body.event_id));

    let result = topic::route_message(
        &mut conn,
        &state.scripts,
        streams::TOPIC_EXCHANGE_STREAM,
        &body.routing_key,
        &Value::Object(payload),
    )
    .await?;

    let routed_to: Vec<Value> = result
        .routed_to
        .into_iter()
        .map(|r| json!({ "stream": r.stream, "messageId": r.message_id }))
        .collect();
    Ok(Json(json!({ "exchangeId": result.exchange_id, "routedTo": routed_to })))
}

async fn topic_rules_list(State(state): State<AppState>, Query(q): Query<ExchangeQuery>) -> ApiResult<Json<Value>> {
    let exchange = exchange_or_default(q.exchange);
    let mut conn = state.conn();
    let rules = topic::list_rules(&mut conn, &exchange).await?;
    Ok(Json(json!({ "success": true, "rules": rules })))
}

async fn topic_rule_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ExchangeQuery>,
) -> ApiResult<Json<Value>> {
    let exchange = exchange_or_default(q.exchange);
    let mut conn = state.conn();
    let rule = topic::get_rule(&mut conn, &exchange, &id).await?;
    Ok(Json(json!({ "success": true, "rule": rule })))
}

async fn topic_rule_save(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ExchangeQuery>,
    Json(mut rule): Json<topic::RoutingRule>,
) -> ApiResult<Json<Value>> {
    let exchange = exchange_or_default(q.exchange);
    rule.id = id;
    let mut conn = state.conn();
    topic::save_rule(&mut conn, &exchange, &rule).await?;
    Ok(Json(json!({ "success": true, "rule": rule })))
}

async fn topic_rule_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ExchangeQuery>,
) -> ApiResult<Json<Value>> {
    let exchange = exchange_or_default(q.exchange);
    let mut conn = state.conn();
    topic::delete_rule(&mut conn, &exchange, &id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn topic_metadata_get(State(state): State<AppState>, Query(q): Query<ExchangeQuery>) -> ApiResult<Json<Value>> {
    let exchange = exchange_or_default(q.exchange);
    let mut conn = state.conn();
    let metadata = topic::get_metadata(&mut conn, &exchange).await?;
    Ok(Json(json!({ "success": true, "metadata": metadata })))
}

async fn topic_metadata_set(
    State(state): State<AppState>,
    Query(q): Query<ExchangeQuery>,
    Json(metadata): Json<topic::RuleMetadata>,
) -> ApiResult<Json<Value>> {
    let exchange = exchange_or_default(q.exchange);
    let mut conn = state.conn();
    topic::save_metadata(&mut conn, &exchange, &metadata).await?;
    Ok(Json(json!({ "success": true })))
}

async fn topic_reset(State(state): State<AppState>, Query(q): Query<ExchangeQuery>) -> ApiResult<Json<Value>> {
    let exchange = exchange_or_default(q.exchange);
    let mut conn = state.conn();
    topic::reset_to_defaults(&mut conn, &exchange).await?;
    Ok(Json(json!({ "success": true })))
}

// ---- C8: request/reply with timeout ------------------------------------------

#[derive(Deserialize)]
struct RequestReplyBody {
    #[serde(rename = "businessId")]
    business_id: String,
    #[serde(rename = "responseType")]
    response_type: String,
    #[serde(rename = "timeoutSec")]
    timeout_sec: Option<i64>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

async fn request_reply_send(State(state): State<AppState>, Json(body): Json<RequestReplyBody>) -> ApiResult<Json<Value>> {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let mut conn = state.conn();

    let mut payload = body.rest;
    payload.insert("responseType".to_string(), Value::String(body.response_type));
    payload.insert(
        "streamResponseName".to_string(),
        Value::String(streams::RESPONSE_STREAM.to_string()),
    );

    request_reply::request(
        &mut conn,
        &state.scripts,
        streams::REQUEST_STREAM,
        streams::RESPONSE_STREAM,
        &correlation_id,
        &body.business_id,
        body.timeout_sec.unwrap_or(state.config.request_reply_timeout_sec as i64),
        &Value::Object(payload),
    )
    .await?;

    Ok(Json(json!({ "success": true, "correlationId": correlation_id })))
}

// ---- C9: per-key serialized processor -----------------------------------------

#[derive(Deserialize)]
struct PerKeySubmitItem {
    #[serde(rename = "orderId")]
    order_id: String,
    action: String,
}

async fn per_key_submit(State(state): State<AppState>, Json(items): Json<Vec<PerKeySubmitItem>>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let mut message_ids = Vec::with_capacity(items.len());
    for item in items {
        let fields = vec![
            ("businessKey".to_string(), item.order_id),
            ("action".to_string(), item.action),
        ];
        let id = dlq::produce(&mut conn, streams::PER_KEY_STREAM, &fields).await?;
        message_ids.push(id);
    }
    Ok(Json(json!({ "success": true, "messageIds": message_ids })))
}

// ---- C10: token bucket --------------------------------------------------------

#[derive(Deserialize)]
struct TypeQuery {
    #[serde(rename = "type")]
    job_type: Option<String>,
}

async fn token_bucket_config_get(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let raw: HashMap<String, String> = conn.hgetall(engine::keys::TOKEN_BUCKET_CONFIG).await.map_err(engine::EngineError::from)?;
    Ok(Json(json!({ "success": true, "config": raw })))
}

#[derive(Deserialize)]
struct TokenBucketConfigBody {
    #[serde(rename = "type")]
    job_type: String,
    max: i64,
}

async fn token_bucket_config_set(State(state): State<AppState>, Json(body): Json<TokenBucketConfigBody>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let field = engine::keys::token_bucket_max_field(&body.job_type);
    let _: () = conn
        .hset(engine::keys::TOKEN_BUCKET_CONFIG, &field, body.max)
        .await
        .map_err(engine::EngineError::from)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct TokenBucketSubmitBody {
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

async fn token_bucket_submit(State(state): State<AppState>, Json(body): Json<TokenBucketSubmitBody>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let mut fields = vec![("type".to_string(), body.job_type)];
    fields.extend(json_object_to_fields(&Value::Object(body.fields)));
    let message_id = dlq::produce(&mut conn, streams::TOKEN_BUCKET_STREAM, &fields).await?;
    Ok(Json(json!({ "success": true, "messageId": message_id })))
}

async fn token_bucket_progress(State(state): State<AppState>, Query(q): Query<CountQuery>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let progress_stream = format!("{}.progress", streams::TOKEN_BUCKET_STREAM);
    let entries = dlq::last_n(&mut conn, &progress_stream, q.count.unwrap_or(50)).await?;
    let entries: Vec<Value> = entries
        .into_iter()
        .map(|(id, fields)| json!({ "id": id, "fields": fields_to_value(&fields) }))
        .collect();
    Ok(Json(json!({ "success": true, "entries": entries })))
}

async fn token_bucket_logs(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let submitted: Vec<String> = conn.lrange("token-bucket:submitted", 0, -1).await.map_err(engine::EngineError::from)?;
    let completed: Vec<String> = conn.lrange("token-bucket:completed", 0, -1).await.map_err(engine::EngineError::from)?;
    Ok(Json(json!({ "success": true, "submitted": submitted, "completed": completed })))
}

async fn token_bucket_logs_clear(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let _: i64 = conn
        .del(&["token-bucket:submitted", "token-bucket:completed"])
        .await
        .map_err(engine::EngineError::from)?;
    Ok(Json(json!({ "success": true })))
}

async fn token_bucket_clear(State(state): State<AppState>, Query(q): Query<TypeQuery>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    if let Some(job_type) = q.job_type {
        let _: i64 = conn
            .del(&engine::keys::token_bucket_running_key(&job_type))
            .await
            .map_err(engine::EngineError::from)?;
    } else {
        let _: i64 = conn
            .del(&[
                "token-bucket:submitted",
                "token-bucket:completed",
                engine::keys::TOKEN_BUCKET_CONFIG,
            ])
            .await
            .map_err(engine::EngineError::from)?;
    }
    Ok(Json(json!({ "success": true })))
}

// ---- C11: delayed scheduler ----------------------------------------------------

async fn scheduled_list(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let ids: Vec<String> = conn
        .zrangebyscore(engine::keys::SCHEDULED_INDEX, "-inf", "+inf")
        .await
        .map_err(engine::EngineError::from)?;
    let mut messages = Vec::with_capacity(ids.len());
    for id in ids {
        let key = engine::keys::scheduled_message_key(&id);
        let fields: Vec<(String, String)> = conn.hgetall(&key).await.map_err(engine::EngineError::from)?;
        if fields.is_empty() {
            continue;
        }
        messages.push(json!({ "id": id, "fields": fields_to_value(&fields) }));
    }
    Ok(Json(json!({ "success": true, "messages": messages })))
}

#[derive(Deserialize)]
struct ScheduledCreateBody {
    id: Option<String>,
    #[serde(rename = "runAt")]
    run_at: i64,
    #[serde(default)]
    payload: Map<String, Value>,
}

async fn scheduled_create(State(state): State<AppState>, Json(body): Json<ScheduledCreateBody>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let id = body.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let payload = json_object_to_fields(&Value::Object(body.payload));
    scheduler::schedule(&mut conn, &id, body.run_at, &payload).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

#[derive(Deserialize)]
struct ScheduledUpdateBody {
    id: String,
    #[serde(rename = "runAt")]
    run_at: i64,
    #[serde(default)]
    payload: Map<String, Value>,
}

async fn scheduled_update(State(state): State<AppState>, Json(body): Json<ScheduledUpdateBody>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let payload = json_object_to_fields(&Value::Object(body.payload));
    scheduler::update(&mut conn, &body.id, body.run_at, &payload).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct IdQuery {
    id: String,
}

async fn scheduled_delete(State(state): State<AppState>, Query(q): Query<IdQuery>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    scheduler::delete(&mut conn, &q.id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn scheduled_clear(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let mut conn = state.conn();
    let ids: Vec<String> = conn
        .zrangebyscore(engine::keys::SCHEDULED_INDEX, "-inf", "+inf")
        .await
        .map_err(engine::EngineError::from)?;
    for id in &ids {
        scheduler::delete(&mut conn, id).await?;
    }
    Ok(Json(json!({ "success": true, "cleared": ids.len() })))
}
