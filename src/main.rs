//! hookrelay webhook delivery service.
//!
//! Loads configuration, prepares the PostgreSQL schema, runs the delivery
//! engine and shuts it down gracefully on CTRL+C or SIGTERM.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookrelay::{Config, LogFormat};
use hookrelay_core::{RealClock, Storage};
use hookrelay_delivery::{DeliveryEngine, PostgresDeliveryStorage};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

const MAX_CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(config.log_format)?;

    info!(
        database_url = %config.database_url_masked(),
        worker_count = config.worker_count,
        max_attempts = config.max_attempts,
        tunnel_host_suffixes = ?config.tunnel_host_suffixes,
        "starting hookrelay"
    );

    let pool = create_database_pool(&config).await?;
    let storage = Arc::new(Storage::new(pool.clone()));
    storage.ensure_schema().await.context("failed to prepare database schema")?;
    info!("database schema ready");

    let mut engine = DeliveryEngine::new(
        Arc::new(PostgresDeliveryStorage::new(storage)),
        config.to_delivery_config(),
        Arc::new(RealClock::new()),
    )
    .context("failed to create delivery engine")?;

    engine.start().await.context("failed to start delivery engine")?;

    if config.recover_pending_on_start {
        match engine.recover_pending().await {
            Ok(recovered) => info!(recovered, "startup recovery finished"),
            Err(e) => warn!(error = %e, "startup recovery failed, continuing"),
        }
    }

    info!("hookrelay is delivering webhooks");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    let stats = engine.stats().await;
    let shutdown = engine.shutdown().await;

    pool.close().await;
    info!(
        delivered = stats.delivered,
        retries_scheduled = stats.retries_scheduled,
        gave_up = stats.gave_up,
        "hookrelay shutdown complete"
    );

    shutdown.context("delivery engine did not shut down cleanly")
}

fn init_tracing(format: LogFormat) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,hookrelay=debug"))
        .context("invalid RUST_LOG filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(true)).try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true))
            .try_init(),
    }
    .context("failed to install tracing subscriber")
}

async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                info!(max_connections = config.database_max_connections, "database pool ready");
                return Ok(pool);
            },
            Err(e) if retries < MAX_CONNECT_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_CONNECT_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to connect to database after retries");
            },
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for CTRL+C");
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
        () = ctrl_c => info!("received CTRL+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
