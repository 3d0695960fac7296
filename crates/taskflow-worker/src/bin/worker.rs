//! Worker process entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use taskflow_broker::BrokerPair;
use taskflow_core::{Config, TaskFlowError};
use taskflow_registry::default_registry;
use taskflow_store::PgTaskStore;
use taskflow_worker::Worker;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taskflow_worker=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting taskflow worker");

    let config = Config::from_env()
        .map_err(TaskFlowError::FatalConfig)
        .context("failed to load configuration")?;
    tracing::info!("configuration loaded");

    tracing::info!("connecting to task store...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to task store")?;
    let store = Arc::new(PgTaskStore::new(pool));
    tracing::info!("task store connected");

    tracing::info!("connecting to brokers...");
    let brokers = Arc::new(
        BrokerPair::connect(
            &config.broker_host_high,
            config.broker_port_high,
            &config.broker_host_low,
            config.broker_port_low,
        )
        .context("failed to connect to brokers")?,
    );
    tracing::info!("brokers connected");

    let registry = Arc::new(default_registry());

    let worker = Arc::new(Worker::new(store, brokers, registry, Arc::new(config)));
    tracing::info!(worker_id = %worker.worker_id, "worker ready");

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("received shutdown signal");
        shutdown_for_signal.cancel();
    });

    worker.run(shutdown).await?;

    Ok(())
}

/// Waits for either an interrupt (`SIGINT`/Ctrl-C) or a terminate
/// (`SIGTERM`) signal, per spec.md §4.5 step 10: "On shutdown signal
/// (interrupt or terminate), set a running flag to false." Without the
/// `SIGTERM` arm, `docker stop`/Kubernetes pod termination (which sends
/// `SIGTERM`, not `SIGINT`) would never flip the running flag and the
/// process would be `SIGKILL`ed instead of exiting gracefully.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
