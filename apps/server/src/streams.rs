//! Demo stream/group names wired up by this binary.
//!
//! `engine` itself is stream-name-agnostic (every component takes its stream
//! and group names as arguments); this module is where the teaching demo's
//! concrete topology lives, matching the persisted-state layout.

pub const DLQ_DEMO_STREAM: &str = "test-stream";
pub const DLQ_DEMO_GROUP: &str = "test-stream-group";

pub const WORK_QUEUE_STREAM: &str = "jobs.imageProcessing.v1";
pub const WORK_QUEUE_GROUP: &str = "work-queue-group";

pub const FANOUT_STREAM: &str = "fanout.events.v1";
pub const FANOUT_GROUP_PREFIX: &str = "fanout-group";

pub const TOPIC_EXCHANGE_STREAM: &str = "events.topic.v1";

pub const REQUEST_STREAM: &str = "order.holdInventory.v1";
pub const RESPONSE_STREAM: &str = "order.holdInventory.response.v1";

pub const PER_KEY_STREAM: &str = "jobs.perkey.v1";
pub const PER_KEY_GROUP: &str = "perkey-group";

pub const TOKEN_BUCKET_STREAM: &str = "token-bucket.jobs.v1";
pub const TOKEN_BUCKET_GROUP: &str = "token-bucket-group";

pub const REMINDERS_STREAM: &str = "reminders.v1";

/// Every stream C2 tails: the demo input streams plus the DLQ/done/response
/// streams workers append to, so an observer sees the whole lifecycle of an
/// entry over the WebSocket feed.
pub fn tailed_streams(work_queue_workers: usize, fanout_workers: usize, per_key_workers: usize) -> Vec<String> {
    let mut streams = vec![
        DLQ_DEMO_STREAM.to_string(),
        engine::keys::dlq_stream(DLQ_DEMO_STREAM),
        WORK_QUEUE_STREAM.to_string(),
        engine::keys::dlq_stream(WORK_QUEUE_STREAM),
        FANOUT_STREAM.to_string(),
        engine::keys::dlq_stream(FANOUT_STREAM),
        TOPIC_EXCHANGE_STREAM.to_string(),
        "events.order.v1".to_string(),
        "events.order.v2".to_string(),
        "events.notification.vip".to_string(),
        "events.notification.gdpr".to_string(),
        "events.audit.cancelled".to_string(),
        REQUEST_STREAM.to_string(),
        engine::keys::dlq_stream(REQUEST_STREAM),
        RESPONSE_STREAM.to_string(),
        engine::keys::dlq_stream(RESPONSE_STREAM),
        PER_KEY_STREAM.to_string(),
        TOKEN_BUCKET_STREAM.to_string(),
        format!("{TOKEN_BUCKET_STREAM}.done"),
        format!("{TOKEN_BUCKET_STREAM}.progress"),
        REMINDERS_STREAM.to_string(),
    ];

    for i in 0..work_queue_workers {
        streams.push(format!("{WORK_QUEUE_STREAM}.worker-{i}.done"));
    }
    for i in 0..fanout_workers {
        streams.push(format!("{FANOUT_STREAM}.worker-{i}.done"));
    }
    for i in 0..per_key_workers {
        streams.push(format!("{PER_KEY_STREAM}.worker-{i}.done"));
    }

    streams
}
