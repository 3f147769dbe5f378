//! Redis key-naming helpers, grounded on the `RedisQueueInfo`-style "name
//! everything in one place" convention from the apalis-redis storage backend.

/// `<name>:dlq`
pub fn dlq_stream(stream: &str) -> String {
    format!("{stream}:dlq")
}

/// `dlq:config:<stream>`
pub fn dlq_config_key(stream: &str) -> String {
    format!("dlq:config:{stream}")
}

/// `routing:rules:<exchange>`
pub fn routing_rules_key(exchange: &str) -> String {
    format!("routing:rules:{exchange}")
}

/// `routing:config:<exchange>`
pub fn routing_config_key(exchange: &str) -> String {
    format!("routing:config:{exchange}")
}

/// `order.holdInventory.request.timeout.v1:<correlationId>`
pub fn request_timeout_key(correlation_id: &str) -> String {
    format!("order.holdInventory.request.timeout.v1:{correlation_id}")
}

/// `request-reply:shadow:<correlationId>`
pub fn request_shadow_key(correlation_id: &str) -> String {
    format!("request-reply:shadow:{correlation_id}")
}

/// `scheduled:message:<id>`
pub fn scheduled_message_key(id: &str) -> String {
    format!("scheduled:message:{id}")
}

/// the sorted-set index of scheduled messages.
pub const SCHEDULED_INDEX: &str = "scheduled.messages";

/// `token-bucket:running:<type>`
pub fn token_bucket_running_key(job_type: &str) -> String {
    format!("token-bucket:running:{job_type}")
}

/// the hash holding per-type caps, field `max:<type>`.
pub const TOKEN_BUCKET_CONFIG: &str = "token-bucket:config";

pub fn token_bucket_max_field(job_type: &str) -> String {
    format!("max:{job_type}")
}

/// `running:order:<businessKey>` — the per-key serializer's NX lock.
pub fn per_key_lock(business_key: &str) -> String {
    format!("running:order:{business_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_stream_suffix() {
        assert_eq!(dlq_stream("test-stream"), "test-stream:dlq");
    }

    #[test]
    fn key_namespaces_are_stable() {
        assert_eq!(dlq_config_key("s"), "dlq:config:s");
        assert_eq!(routing_rules_key("events.topic.v1"), "routing:rules:events.topic.v1");
        assert_eq!(per_key_lock("1001"), "running:order:1001");
    }
}
