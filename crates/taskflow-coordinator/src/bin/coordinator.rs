//! Coordinator process entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use taskflow_broker::BrokerPair;
use taskflow_core::{Config, TaskFlowError};
use taskflow_coordinator::Coordinator;
use taskflow_store::PgTaskStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taskflow_coordinator=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting taskflow coordinator");

    let config = Config::from_env()
        .map_err(TaskFlowError::FatalConfig)
        .context("failed to load configuration")?;
    tracing::info!("configuration loaded");

    tracing::info!("connecting to task store...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to task store")?;
    sqlx::migrate!("../taskflow-store/migrations")
        .run(&pool)
        .await
        .context("failed to run task store migrations")?;
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

    let coordinator = Arc::new(Coordinator::new(store, brokers, Arc::new(config)));

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("received shutdown signal");
        shutdown_for_signal.cancel();
    });

    coordinator.run(shutdown).await?;

    Ok(())
}

/// Waits for either an interrupt (`SIGINT`/Ctrl-C) or a terminate
/// (`SIGTERM`) signal, per spec.md §5: "Graceful shutdown (interrupt/
/// terminate signal) flips a running flag." Without the `SIGTERM` arm,
/// `docker stop`/Kubernetes pod termination (which sends `SIGTERM`, not
/// `SIGINT`) would never flip the flag and the process would be
/// `SIGKILL`ed instead of releasing its leader lease and exiting
/// gracefully.
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
