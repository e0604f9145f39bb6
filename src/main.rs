//! Tally webhook delivery service.
//!
//! Connects to PostgreSQL, runs the delivery engine over the stored
//! subscriptions and attempt history, and shuts down gracefully on Ctrl+C or
//! SIGTERM.

#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tally_core::{storage::Storage, RealClock, RegistryConfig};
use tally_delivery::DeliveryEngine;
use tracing::{error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        database_url = %config.database_url_masked(),
        worker_count = config.worker_count,
        sweep_interval_seconds = config.sweep_interval_seconds,
        allow_http = config.allow_http,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    tally_core::storage::run_migrations(&db_pool)
        .await
        .context("failed to run database migrations")?;
    info!("database migrations completed");

    let clock = Arc::new(RealClock::new());
    let storage = Storage::new(
        db_pool.clone(),
        clock.clone(),
        RegistryConfig { allow_http: config.allow_http },
    );
    storage.health_check().await.context("database health check failed")?;

    let mut engine = DeliveryEngine::new(
        storage.subscriptions.clone(),
        storage.delivery_attempts.clone(),
        clock,
        config.to_engine_config(),
    )
    .context("failed to create delivery engine")?;
    engine.start().await.context("failed to start delivery engine")?;

    info!("tally is delivering webhooks");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    let stats = engine.stats();
    info!(
        events_accepted = stats.events_accepted,
        deliveries_succeeded = stats.deliveries_succeeded,
        deliveries_failed = stats.deliveries_failed,
        attempts_abandoned = stats.attempts_abandoned,
        in_flight = stats.in_flight,
        "delivery engine stopping"
    );

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine did not shut down cleanly");
    }

    db_pool.close().await;
    info!("database connections closed");

    info!("tally shutdown complete");
    Ok(())
}

/// Initializes tracing. `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Creates the database connection pool, retrying while the database starts.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C");
        },
        () = terminate => {
            info!("received SIGTERM");
        },
    }
}
