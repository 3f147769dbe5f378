//! Messaging-patterns teaching server.
//!
//! Composition root: load config, connect to Redis, install the broker-side
//! scripts, spawn every background worker, and serve the health/HTTP/WebSocket
//! surface until a shutdown signal arrives.

mod error;
mod http;
mod state;
mod streams;
mod workers;
mod ws;

use std::sync::Arc;

use core_config::{app_info, Environment, FromEnv};
use database::redis::{connect_from_config_with_retry, RedisConfig};
use engine::health::{health_router, HealthState};
use engine::{Broadcaster, EngineConfig, Scripts};
use eyre::WrapErr;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, Level};

use state::AppState;
use workers::Workers;

pub async fn run() -> eyre::Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "starting messaging-patterns server");

    let server_config = core_config::server::ServerConfig::from_env().wrap_err("failed to load server configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("failed to load Redis configuration")?;

    info!("connecting to Redis...");
    let redis = connect_from_config_with_retry(redis_config.clone(), None)
        .await
        .wrap_err("failed to connect to Redis")?;
    let pubsub_client = redis::Client::open(redis_config.url.clone()).wrap_err("failed to open Redis pubsub client")?;
    info!("connected to Redis");

    let engine_config = Arc::new(EngineConfig::from_env().wrap_err("invalid engine configuration")?);
    let scripts = Arc::new(Scripts::new());
    let broadcaster = Broadcaster::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let workers = Workers::new(
        redis.clone(),
        pubsub_client,
        scripts.clone(),
        engine_config.clone(),
        broadcaster.clone(),
        shutdown_rx.clone(),
    );
    workers.start().await.wrap_err("failed to start background workers")?;

    let health_state = HealthState::new(Arc::new(redis.clone()), app_info.name, app_info.version);
    let app_state = AppState::new(redis, scripts, broadcaster, engine_config);

    let app = axum::Router::new()
        .merge(health_router(health_state))
        .merge(http::router(app_state.clone()))
        .merge(ws::router(app_state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

    let addr = server_config.address();
    let listener = TcpListener::bind(&addr).await.wrap_err_with(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    let mut shutdown_rx_serve = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx_serve.changed().await;
        })
        .await
        .wrap_err("server failed")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() -> eyre::Result<()> {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("received SIGTERM, initiating shutdown..."),
    }

    Ok(())
}
