//! ampflow Scout
//!
//! The scout is the cheap half of the trigger protocol: it polls one
//! vehicle snapshot per cycle and pokes the worker when the vehicle is
//! ready to charge at home. It never rewrites schedules itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use amp_scout::{api, config, poller::Poller, worker_client::WorkerClient};
use amp_vehicle::HttpVehicleGateway;

/// Per-call timeout against the vehicle gateway. The scout is the
/// low-latency side; it gives up early and lets the next poll retry.
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to AMP_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ampflow scout");
    info!(
        listen_addr = %config.listen_addr,
        gateway_url = %config.gateway_url,
        worker_url = %config.worker_url,
        poll_interval_secs = config.poll_interval.as_secs(),
        "Configuration loaded"
    );

    let gateway = Arc::new(HttpVehicleGateway::new(
        config.gateway_url.clone(),
        OUTBOUND_TIMEOUT,
    )?);
    let worker = Arc::new(WorkerClient::new(
        config.worker_url.clone(),
        config.service_token.clone(),
    )?);

    let poller = Arc::new(Poller::new(
        gateway,
        worker,
        config.state_path.clone(),
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the poll loop in background
    let poll_handle = tokio::spawn({
        let poller = Arc::clone(&poller);
        let shutdown_rx = shutdown_rx.clone();
        let interval = config.poll_interval;
        async move {
            amp_scout::poller::run_poll_loop(poller, interval, shutdown_rx).await;
        }
    });

    // Build and run the server
    let app = api::create_router(poller);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let mut shutdown_rx = shutdown_rx;
                    loop {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    info!("HTTP server shutting down");
                })
                .await
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to the poll loop
    let _ = shutdown_tx.send(true);

    info!("Waiting for the poll loop to shut down...");
    if let Err(e) = tokio::time::timeout(Duration::from_secs(10), poll_handle).await {
        warn!(error = %e, "Poll loop did not shut down in time");
    }

    info!("Scout shutdown complete");
    Ok(())
}
