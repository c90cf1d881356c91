//! Runner process for conveyor.
//!
//! Hosts the engine against PostgreSQL and NATS: the event router, the
//! queue worker, the outbox reconciler and the execution reaper run as
//! background tasks next to the HTTP intake. Any number of runners may share
//! one database and stream; the router and worker loops can be switched off
//! per process.

pub mod config;
pub mod db;
pub mod error;
pub mod http;

use crate::config::RunnerConfig;
use crate::db::PgStore;
use crate::error::RunnerError;
use crate::http::AppState;
use conveyor_engine::{
    LoggingProvisioner, NatsTransport, NodeExecutor, Reaper, Reconciler, Registry, Router,
    TriggerRuntime, Worker,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs the router, worker, maintenance loops and HTTP intake until ctrl-c.
///
/// # Errors
///
/// Returns an error if the database, migrations, transport or listener
/// cannot be set up, or if the server fails.
pub async fn run(config: RunnerConfig) -> conveyor_core::Result<(), RunnerError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| RunnerError::Database {
            details: e.to_string(),
        })?;

    info!("running database migrations");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| RunnerError::Migration {
            details: e.to_string(),
        })?;

    let store = Arc::new(PgStore::new(pool));
    let transport = Arc::new(
        NatsTransport::connect(config.nats.to_nats_config())
            .await
            .map_err(|e| RunnerError::Transport {
                details: e.to_string(),
            })?,
    );
    let registry = Arc::new(Registry::with_builtins());
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    if config.router.enabled {
        let router = Router::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            config.router.to_router_config(),
        );
        let cancel = cancel.clone();
        tasks.spawn(async move { router.run(cancel).await });
    }

    if config.worker.enabled {
        let worker = Arc::new(
            Worker::new(
                Arc::clone(&store),
                Arc::clone(&transport),
                Arc::clone(&registry),
            )
            .with_max_concurrency(config.worker.max_concurrency)
            .with_heartbeat(config.worker.heartbeat()),
        );
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = worker.run(cancel.clone()).await {
                error!(error = %e, "worker stopped, shutting down");
                cancel.cancel();
            }
        });
    }

    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        config.reconciler.to_reconciler_config(),
    );
    let reconciler_cancel = cancel.clone();
    tasks.spawn(async move { reconciler.run(reconciler_cancel).await });

    let reaper = Reaper::new(Arc::clone(&store), config.reaper.to_reaper_config());
    let reaper_cancel = cancel.clone();
    tasks.spawn(async move { reaper.run(reaper_cancel).await });

    let triggers = Arc::new(TriggerRuntime::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::new(LoggingProvisioner),
    ));
    let executor = NodeExecutor::new(Arc::clone(&store), registry);
    let app = http::router(AppState::new(triggers, executor));

    let listener = tokio::net::TcpListener::bind(config.http.listen_addr)
        .await
        .map_err(|e| RunnerError::Server {
            details: format!("failed to bind {}: {e}", config.http.listen_addr),
        })?;
    info!(addr = %config.http.listen_addr, "listening");

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await;

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    info!("runner stopped");

    served.map_err(|e| RunnerError::Server {
        details: e.to_string(),
    })?;
    Ok(())
}

/// Resolves on ctrl-c or when a background task asks for shutdown.
async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        }
        () = cancel.cancelled() => {}
    }
}
