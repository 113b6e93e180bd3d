//! The poll-and-decide loop.
//!
//! One cycle reads the cached credentials, fetches one vehicle
//! snapshot, and fires a single worker trigger when the vehicle is
//! ready to charge at home. Credentials are re-read from the store on
//! every cycle so a worker-side refresh is picked up without
//! coordination.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use amp_store::StateStore;
use amp_vehicle::{CredentialSet, GatewayError, VehicleGateway};

use crate::worker_client::WorkerClient;

/// Local refresh rate limit, shared by the loop and the HTTP trigger.
const REFRESH_COOLDOWN: Duration = Duration::from_secs(60);

/// Terminal outcome of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    /// Condition met, worker trigger delivered.
    Triggered,

    /// Vehicle polled fine but is not ready to charge at home.
    NotReady,

    /// Credentials rejected and a refresh is pending or rate limited.
    AuthPending,

    /// The cycle failed; the next scheduled poll retries from scratch.
    Failed,
}

/// The scout poller.
pub struct Poller {
    gateway: Arc<dyn VehicleGateway>,
    worker: Arc<WorkerClient>,
    state_path: PathBuf,
    refresh_cooldown: Duration,
    last_refresh_attempt: Mutex<Option<Instant>>,
}

impl Poller {
    /// Create a new poller.
    pub fn new(
        gateway: Arc<dyn VehicleGateway>,
        worker: Arc<WorkerClient>,
        state_path: PathBuf,
    ) -> Self {
        Self {
            gateway,
            worker,
            state_path,
            refresh_cooldown: REFRESH_COOLDOWN,
            last_refresh_attempt: Mutex::new(None),
        }
    }

    /// Override the refresh cooldown.
    #[doc(hidden)]
    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    /// Run one poll cycle.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> PollOutcome {
        let creds = match self.read_credentials() {
            Ok(Some(creds)) => creds,
            Ok(None) => {
                warn!("No credentials in state store yet, skipping poll");
                return PollOutcome::Failed;
            }
            Err(e) => {
                warn!(error = %e, "State store unavailable, skipping poll");
                return PollOutcome::Failed;
            }
        };

        let snapshot = match self.gateway.fetch_snapshot(&creds.access_token).await {
            Ok(snapshot) => snapshot,
            Err(GatewayError::AuthExpired) => match self.refresh_and_retry().await {
                Some(snapshot) => snapshot,
                None => return PollOutcome::AuthPending,
            },
            Err(e) => {
                warn!(error = %e, "Snapshot fetch failed");
                return PollOutcome::Failed;
            }
        };

        if !snapshot.ready_to_charge_at_home() {
            debug!(
                online = snapshot.online,
                charge_ready = snapshot.charge_ready,
                location = ?snapshot.location,
                "Vehicle not ready, no trigger"
            );
            return PollOutcome::NotReady;
        }

        info!(battery_percent = snapshot.battery_percent, "Vehicle ready, triggering worker");
        match self.worker.trigger_run_cycle().await {
            Ok(()) => PollOutcome::Triggered,
            Err(e) => {
                warn!(error = %e, "Worker trigger failed");
                PollOutcome::Failed
            }
        }
    }

    /// Open a fresh read-only view of the shared store and load
    /// credentials. The handle is dropped at the end of each cycle.
    fn read_credentials(&self) -> Result<Option<CredentialSet>, amp_store::StoreError> {
        let store = StateStore::open_read_only(&self.state_path)?;
        store.load_credentials()
    }

    /// Ask the worker for a refresh, re-read credentials, and retry the
    /// snapshot once. Returns `None` when the refresh path is exhausted
    /// for this cycle.
    async fn refresh_and_retry(&self) -> Option<amp_vehicle::VehicleSnapshot> {
        // The lock is held across the refresh call so a concurrent
        // manual trigger cannot double-spend the cooldown.
        let mut last_attempt = self.last_refresh_attempt.lock().await;
        if let Some(at) = *last_attempt {
            let elapsed = at.elapsed();
            if elapsed < self.refresh_cooldown {
                info!(
                    remaining_secs = (self.refresh_cooldown - elapsed).as_secs(),
                    "Refresh on cooldown, deferring to a later poll"
                );
                return None;
            }
        }
        *last_attempt = Some(Instant::now());

        if let Err(e) = self.worker.refresh_tokens().await {
            warn!(error = %e, "Worker token refresh failed");
            return None;
        }
        drop(last_attempt);

        let creds = match self.read_credentials() {
            Ok(Some(creds)) => creds,
            Ok(None) | Err(_) => {
                warn!("Credentials unreadable after refresh");
                return None;
            }
        };

        match self.gateway.fetch_snapshot(&creds.access_token).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "Snapshot retry after refresh failed");
                None
            }
        }
    }
}

/// Run the poll loop until shutdown.
pub async fn run_poll_loop(
    poller: Arc<Poller>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Starting poll loop");

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match poller.poll_once().await {
                    PollOutcome::Failed => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(consecutive_failures, "Poll cycle failed");
                        } else {
                            error!(consecutive_failures, "Poll cycle failed repeatedly");
                        }
                    }
                    outcome => {
                        consecutive_failures = 0;
                        debug!(outcome = ?outcome, "Poll cycle finished");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Poll loop shutting down");
                    break;
                }
            }
        }
    }
}
