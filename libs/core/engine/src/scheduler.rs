//! C11 — delayed scheduler.
//!
//! A plain poll loop (no consumer group, no script): due members are read
//! off a sorted-set index and fired sequentially. No atomicity requirement
//! is named for this component, so each due member's read/append/remove is
//! three ordinary commands rather than a Lua script.

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::broadcaster::Broadcaster;
use crate::error::{EngineError, EngineResult};
use crate::event::EngineEvent;
use crate::keys;

const BATCH: isize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: String,
    #[serde(rename = "runAt")]
    pub run_at: i64,
    pub payload: Vec<(String, String)>,
}

/// Runs forever, polling `scheduled.messages` every `poll_interval`.
pub async fn run(
    mut conn: ConnectionManager,
    reminders_stream: String,
    poll_interval: Duration,
    broadcaster: Broadcaster,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        match fire_due(&mut conn, &reminders_stream, &broadcaster).await {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "scheduler pass failed"),
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
}

async fn fire_due(
    conn: &mut ConnectionManager,
    reminders_stream: &str,
    broadcaster: &Broadcaster,
) -> EngineResult<()> {
    let now = Utc::now().timestamp_millis();
    let due: Vec<String> = conn
        .zrangebyscore_limit(keys::SCHEDULED_INDEX, "-inf", now, 0, BATCH)
        .await?;

    for id in due {
        let message_key = keys::scheduled_message_key(&id);
        let fields: Vec<(String, String)> = conn.hgetall(&message_key).await?;
        if fields.is_empty() {
            // Already consumed by a previous (possibly crashed) pass; skip.
            continue;
        }

        let scheduled_for = fields
            .iter()
            .find(|(k, _)| k == "runAt")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(reminders_stream)
            .arg("*")
            .arg("scheduledMessageId")
            .arg(&id)
            .arg("scheduledFor")
            .arg(&scheduled_for)
            .arg("executedAt")
            .arg(now.to_string());
        for (k, v) in &fields {
            if k == "runAt" {
                continue;
            }
            cmd.arg(k).arg(v);
        }
        let entry_id: String = cmd.query_async(conn).await?;

        let _: i64 = conn.zrem(keys::SCHEDULED_INDEX, &id).await?;
        let _: i64 = conn.del(&message_key).await?;

        broadcaster.publish(EngineEvent::message_produced(reminders_stream, entry_id));
    }

    Ok(())
}

pub async fn schedule(
    conn: &mut ConnectionManager,
    id: &str,
    run_at_millis: i64,
    payload: &[(String, String)],
) -> EngineResult<()> {
    let message_key = keys::scheduled_message_key(id);
    let mut fields: Vec<(String, String)> = payload.to_vec();
    fields.push(("runAt".to_string(), run_at_millis.to_string()));

    let _: () = conn.hset_multiple(&message_key, &fields).await?;
    let _: i64 = conn.zadd(keys::SCHEDULED_INDEX, id, run_at_millis).await?;
    Ok(())
}

pub async fn update(
    conn: &mut ConnectionManager,
    id: &str,
    run_at_millis: i64,
    payload: &[(String, String)],
) -> EngineResult<()> {
    let message_key = keys::scheduled_message_key(id);
    let exists: bool = conn.exists(&message_key).await?;
    if !exists {
        return Err(EngineError::NotFound(format!("scheduled message {id}")));
    }
    schedule(conn, id, run_at_millis, payload).await
}

pub async fn delete(conn: &mut ConnectionManager, id: &str) -> EngineResult<()> {
    let message_key = keys::scheduled_message_key(id);
    let _: i64 = conn.zrem(keys::SCHEDULED_INDEX, id).await?;
    let _: i64 = conn.del(&message_key).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_bounded() {
        assert!(BATCH > 0 && BATCH <= 100);
    }
}
