//! ampflow Reconciliation Worker
//!
//! The worker owns the full reconciliation cycle for the vehicle's
//! charge schedule: wake-if-needed, price-feed call, fingerprint
//! comparison, add-before-remove schedule rewrite, and the token
//! refresh lifecycle on behalf of the scout.
//!
//! ## Architecture
//!
//! - **Reconciler**: The schedule reconciliation state machine
//! - **Token Custodian**: Sole authority for credential refresh
//! - **Trigger Worker**: Nightly failsafe + weekly emergency cadences
//! - **API**: Cycle triggers, refresh, and status over HTTP

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use amp_store::StateStore;
use amp_vehicle::{HttpPriceFeed, HttpVehicleGateway};
use amp_worker::{
    api, config,
    custodian::TokenCustodian,
    reconciler::{ChargingNeed, Reconciler, ReconcilerConfig},
    state::AppState,
    triggers::{TriggerSchedule, TriggerWorker},
};

/// Per-call timeout against the gateway and price feed.
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to AMP_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ampflow worker");
    info!(
        listen_addr = %config.listen_addr,
        gateway_url = %config.gateway_url,
        state_path = %config.state_path.display(),
        "Configuration loaded"
    );

    // Open the durable state store
    let store = match StateStore::open(&config.state_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "Failed to open state store");
            return Err(e.into());
        }
    };

    // External collaborators
    let gateway = Arc::new(HttpVehicleGateway::new(
        config.gateway_url.clone(),
        OUTBOUND_TIMEOUT,
    )?);
    let price_feed = Arc::new(HttpPriceFeed::new(
        config.price_feed_url.clone(),
        OUTBOUND_TIMEOUT,
    )?);

    let custodian = Arc::new(TokenCustodian::new(
        config.auth_url.clone(),
        Arc::clone(&store),
    )?);

    let reconciler = Arc::new(Reconciler::new(
        gateway,
        price_feed,
        Arc::clone(&store),
        Arc::clone(&custodian),
        config.current_policy.clone(),
        ChargingNeed {
            battery_capacity_kwh: config.battery_capacity_kwh,
            target_percent: config.target_percent,
            deadline: config.charge_deadline,
        },
        ReconcilerConfig::default(),
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the failsafe/emergency trigger worker in background
    let trigger_worker = TriggerWorker::new(
        Arc::clone(&reconciler),
        TriggerSchedule {
            time_zone: config.time_zone,
            failsafe_time: config.failsafe_time,
            emergency_weekday: config.emergency_weekday,
            emergency_time: config.emergency_time,
        },
    );
    let trigger_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            trigger_worker.run(shutdown_rx).await;
        }
    });

    // Create application state
    let state = AppState::new(store, reconciler, custodian, &config.service_token);

    // Build and run the server
    let app = api::create_router(state);

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

    // Signal shutdown to the trigger worker
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if let Err(e) = tokio::time::timeout(Duration::from_secs(10), trigger_handle).await {
        warn!(error = %e, "Trigger worker did not shut down in time");
    }

    info!("Worker shutdown complete");
    Ok(())
}
