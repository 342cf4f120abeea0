//! Turns aggregated health results into the step-down signal.
//!
//! The controller is the only writer of the down token. Cancelling it is
//! observed by every lease task at once; recovering replaces it with a fresh
//! token and restarts the tasks.
use std::sync::Arc;

use arbiter_core::{
    AggregatedStatus, Notification, PubSub,
    metrics::{LEASE_RESTART, STEP_DOWN},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::lease::LeaseManager;

const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug)]
pub struct StepDownController {
    manager: Arc<LeaseManager>,
    bus: PubSub<Notification>,
}

impl StepDownController {
    pub fn new(manager: Arc<LeaseManager>, bus: PubSub<Notification>) -> Self {
        Self { manager, bus }
    }

    /// Subscribe to aggregated results and start leasing. Runs until
    /// `shutdown` is cancelled, then withdraws every entry before returning.
    pub async fn run(self, shutdown: CancellationToken) {
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.bus
            .subscribe(tx, shutdown.clone().cancelled_owned(), Notification::is_status);

        let mut down = CancellationToken::new();
        self.manager.start(down.clone()).await;
        info!("lease manager started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(notification) = rx.recv() => {
                    if let Notification::Status(status) = notification {
                        self.apply(&status, &mut down).await;
                    }
                }
            }
        }

        down.cancel();
        self.manager.join().await;
        info!("lease manager stopped");
    }

    async fn apply(&self, status: &AggregatedStatus, down: &mut CancellationToken) {
        if let Some(failed) = status.failures().next() {
            if !down.is_cancelled() {
                warn!(
                    check = %failed.name,
                    detail = ?failed.detail,
                    failed = status.failures().count(),
                    "health check failed, stepping down"
                );
                down.cancel();
                STEP_DOWN.inc();
            }
        } else if down.is_cancelled() {
            info!("all health checks passed, restarting leases");
            // tasks of the cancelled epoch are awaited by `start`
            *down = CancellationToken::new();
            self.manager.start(down.clone()).await;
            LEASE_RESTART.inc();
        }
    }
}
