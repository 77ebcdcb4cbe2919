//! Mailflow Worker - self-contained scheduling trigger.
//!
//! Runs one engine cycle (dispatch, retry sweep, automation, experiment)
//! every `TICK_INTERVAL_SECS` until SIGINT/SIGTERM. A cycle in progress is
//! allowed to finish before shutdown.

use std::time::Duration;

use anyhow::Result;
use tokio::{signal, time::MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailflow::{Config, Engine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    let config = Config::from_env();
    info!(
        provider = ?config.provider,
        database_path = ?config.database_path,
        batch_size = config.dispatch_batch_size,
        concurrency = config.dispatch_concurrency,
        tick_interval_secs = config.tick_interval_secs,
        "config_loaded"
    );

    let engine = Engine::from_config(&config).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(config.tick_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let report = engine.run_cycle().await;
                if !report.success {
                    warn!(total_duration_ms = report.total_duration_ms, "worker_cycle_unsuccessful");
                }
            }
        }
    }

    info!("worker_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("worker_shutting_down");
}
