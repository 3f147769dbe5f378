//! Spawns every long-running background task: C2 tailers, C5/C6 queue
//! workers, C8's three-part request/reply machinery, C9/C10 serializers, and
//! the C11 scheduler. Grounded on `tasks-worker::run()`'s "spawn, don't
//! await" composition-root shape.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tracing::error;

use engine::{fanout, per_key, request_reply, scheduler, tailer, token_bucket, topic, work_queue, Broadcaster, EngineConfig, Scripts};

use crate::streams;

pub struct Workers {
    redis: ConnectionManager,
    client: redis::Client,
    scripts: Arc<Scripts>,
    config: Arc<EngineConfig>,
    broadcaster: Broadcaster,
    shutdown_rx: watch::Receiver<bool>,
}

impl Workers {
    pub fn new(
        redis: ConnectionManager,
        client: redis::Client,
        scripts: Arc<Scripts>,
        config: Arc<EngineConfig>,
        broadcaster: Broadcaster,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            redis,
            client,
            scripts,
            config,
            broadcaster,
            shutdown_rx,
        }
    }

    /// Install C1's scripts, seed C12's default rule set if the exchange has
    /// none yet, then spawn every worker/tailer as its own task.
    pub async fn start(&self) -> eyre::Result<()> {
        let mut install_conn = self.redis.clone();
        self.scripts.install(&mut install_conn).await?;

        let mut topic_conn = self.redis.clone();
        if topic::list_rules(&mut topic_conn, streams::TOPIC_EXCHANGE_STREAM)
            .await
            .map(|rules| rules.is_empty())
            .unwrap_or(true)
        {
            topic::reset_to_defaults(&mut topic_conn, streams::TOPIC_EXCHANGE_STREAM).await?;
        }

        self.spawn_tailers();
        self.spawn_work_queue();
        self.spawn_fanout();
        self.spawn_request_reply();
        self.spawn_per_key();
        self.spawn_token_bucket();
        self.spawn_scheduler();

        Ok(())
    }

    fn spawn_tailers(&self) {
        for stream in streams::tailed_streams(
            self.config.work_queue_workers,
            self.config.fanout_workers,
            self.config.per_key_workers,
        ) {
            let conn = self.redis.clone();
            let broadcaster = self.broadcaster.clone();
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                tailer::run(conn, stream, broadcaster, shutdown).await;
            });
        }
    }

    fn spawn_work_queue(&self) {
        for i in 0..self.config.work_queue_workers {
            let conn = self.redis.clone();
            let scripts = self.scripts.clone();
            let broadcaster = self.broadcaster.clone();
            let shutdown = self.shutdown_rx.clone();
            let dlq_config = self.config.dlq_defaults;
            let poll_interval = Duration::from_millis(self.config.work_queue_poll_ms);

            tokio::spawn(async move {
                if let Err(e) = work_queue::ensure_consumer_group(
                    &mut conn.clone(),
                    streams::WORK_QUEUE_STREAM,
                    streams::WORK_QUEUE_GROUP,
                )
                .await
                {
                    error!(error = %e, "work-queue: failed to create consumer group");
                    return;
                }

                work_queue::run_worker_loop(
                    conn,
                    scripts,
                    streams::WORK_QUEUE_STREAM.to_string(),
                    dlq_config,
                    streams::WORK_QUEUE_GROUP.to_string(),
                    format!("worker-{i}"),
                    format!("worker-{i}.done"),
                    poll_interval,
                    broadcaster,
                    shutdown,
                )
                .await;
            });
        }
    }

    fn spawn_fanout(&self) {
        for i in 0..self.config.fanout_workers {
            let conn = self.redis.clone();
            let scripts = self.scripts.clone();
            let broadcaster = self.broadcaster.clone();
            let shutdown = self.shutdown_rx.clone();
            let dlq_config = self.config.dlq_defaults;
            let poll_interval = Duration::from_millis(self.config.work_queue_poll_ms);

            tokio::spawn(async move {
                if let Err(e) = fanout::run_worker(
                    conn,
                    scripts,
                    streams::FANOUT_STREAM.to_string(),
                    dlq_config,
                    streams::FANOUT_GROUP_PREFIX.to_string(),
                    i,
                    poll_interval,
                    broadcaster,
                    shutdown,
                )
                .await
                {
                    error!(error = %e, worker = i, "fanout worker exited with an error");
                }
            });
        }
    }

    fn spawn_request_reply(&self) {
        let poll_interval = Duration::from_millis(self.config.work_queue_poll_ms);

        {
            let conn = self.redis.clone();
            let scripts = self.scripts.clone();
            let broadcaster = self.broadcaster.clone();
            let shutdown = self.shutdown_rx.clone();
            let dlq_config = self.config.dlq_defaults;
            let group = self.config.request_reply_group.clone();
            tokio::spawn(async move {
                if let Err(e) = request_reply::run_worker(
                    conn,
                    scripts,
                    streams::REQUEST_STREAM.to_string(),
                    group,
                    "request-worker".to_string(),
                    dlq_config,
                    poll_interval,
                    broadcaster,
                    shutdown,
                )
                .await
                {
                    error!(error = %e, "request/reply worker exited with an error");
                }
            });
        }

        {
            let conn = self.redis.clone();
            let scripts = self.scripts.clone();
            let broadcaster = self.broadcaster.clone();
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = request_reply::run_response_listener(
                    conn,
                    scripts,
                    streams::RESPONSE_STREAM.to_string(),
                    "response-listener-group".to_string(),
                    "response-listener".to_string(),
                    poll_interval,
                    broadcaster,
                    shutdown,
                )
                .await
                {
                    error!(error = %e, "response listener exited with an error");
                }
            });
        }

        {
            let client = self.client.clone();
            let cmd_conn = self.redis.clone();
            let scripts = self.scripts.clone();
            let broadcaster = self.broadcaster.clone();
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = request_reply::run_expiry_observer(client, cmd_conn, scripts, broadcaster, shutdown).await {
                    error!(error = %e, "expiry observer exited with an error");
                }
            });
        }
    }

    fn spawn_per_key(&self) {
        for i in 0..self.config.per_key_workers {
            let conn = self.redis.clone();
            let broadcaster = self.broadcaster.clone();
            let shutdown = self.shutdown_rx.clone();
            let idle_claim_ms = self.config.per_key_idle_claim_ms;
            let lock_ttl_ms = self.config.per_key_lock_ttl_ms;

            tokio::spawn(async move {
                if let Err(e) = per_key::run_worker(
                    conn,
                    streams::PER_KEY_STREAM.to_string(),
                    streams::PER_KEY_GROUP.to_string(),
                    format!("worker-{i}"),
                    idle_claim_ms,
                    lock_ttl_ms,
                    broadcaster,
                    shutdown,
                )
                .await
                {
                    error!(error = %e, worker = i, "per-key worker exited with an error");
                }
            });
        }
    }

    fn spawn_token_bucket(&self) {
        for i in 0..self.config.token_bucket_workers {
            let conn = self.redis.clone();
            let scripts = self.scripts.clone();
            let broadcaster = self.broadcaster.clone();
            let shutdown = self.shutdown_rx.clone();
            let idle_claim_ms = self.config.token_bucket_idle_claim_ms;

            tokio::spawn(async move {
                if let Err(e) = token_bucket::run_worker(
                    conn,
                    scripts,
                    streams::TOKEN_BUCKET_STREAM.to_string(),
                    streams::TOKEN_BUCKET_GROUP.to_string(),
                    format!("worker-{i}"),
                    idle_claim_ms,
                    Default::default(),
                    broadcaster,
                    shutdown,
                )
                .await
                {
                    error!(error = %e, worker = i, "token-bucket worker exited with an error");
                }
            });
        }
    }

    fn spawn_scheduler(&self) {
        let conn = self.redis.clone();
        let broadcaster = self.broadcaster.clone();
        let shutdown = self.shutdown_rx.clone();
        let poll_interval = Duration::from_millis(self.config.scheduler_poll_ms);

        tokio::spawn(async move {
            scheduler::run(conn, streams::REMINDERS_STREAM.to_string(), poll_interval, broadcaster, shutdown).await;
        });
    }
}
