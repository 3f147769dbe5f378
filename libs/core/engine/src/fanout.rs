//! C6 — fan-out workers.
//!
//! Same loop as C5 (`work_queue::run_worker_loop`), but each worker owns its
//! own consumer group `<prefix>-<i>` rather than sharing one, so every
//! worker sees every entry delivered to it independently.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::watch;

use crate::broadcaster::Broadcaster;
use crate::config::DlqConfig;
use crate::error::EngineResult;
use crate::scripts::Scripts;
use crate::work_queue;

pub async fn run_worker(
    mut conn: ConnectionManager,
    scripts: Arc<Scripts>,
    stream: String,
    dlq_config: DlqConfig,
    group_prefix: String,
    worker_index: usize,
    poll_interval: Duration,
    broadcaster: Broadcaster,
    shutdown: watch::Receiver<bool>,
) -> EngineResult<()> {
    let group = format!("{group_prefix}-{worker_index}");
    work_queue::ensure_consumer_group(&mut conn, &stream, &group).await?;

    let consumer = format!("worker-{worker_index}");
    let done_suffix = format!("worker-{worker_index}.done");

    work_queue::run_worker_loop(
        conn,
        scripts,
        stream,
        dlq_config,
        group,
        consumer,
        done_suffix,
        poll_interval,
        broadcaster,
        shutdown,
    )
    .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn each_worker_gets_a_private_group_name() {
        let prefix = "fanout.events.v1";
        assert_eq!(format!("{prefix}-{}", 0), "fanout.events.v1-0");
        assert_eq!(format!("{prefix}-{}", 1), "fanout.events.v1-1");
    }
}
