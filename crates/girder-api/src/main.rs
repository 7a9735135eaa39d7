//! Girder API Server

use std::net::SocketAddr;
use std::time::Duration;

use girder_api::{AppState, Config, routes};
use girder_db::{create_pool, run_migrations};
use girder_scheduler::{Reaper, Scheduler};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("connecting to database");
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    info!("database ready");

    let port = config.port;
    let state = AppState::new(pool, config);

    // Background loops run on every instance; cross-instance races are
    // settled by the store's row locks and conditional updates.
    let shutdown = CancellationToken::new();

    let scheduler = Scheduler::new(
        state.builds.clone(),
        Duration::from_secs(state.config.scheduler_tick_interval_seconds),
        state.config.scheduler_batch_size,
    );
    tokio::spawn(scheduler.run(shutdown.clone()));

    let reaper = Reaper::new(
        state.workers.clone(),
        state.builds.clone(),
        Duration::from_secs(state.config.reaper_tick_interval_seconds),
        Duration::from_secs(state.config.worker_heartbeat_timeout_seconds),
        state.config.lost_worker_policy,
    );
    tokio::spawn(reaper.run(shutdown.clone()));

    let app = routes::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");
    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    state.pool.close().await;
    info!("server exited");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM, cancelling the background loops so the
/// server can drain in-flight requests and stop.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    shutdown.cancel();
}
