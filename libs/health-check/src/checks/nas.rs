use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use arbiter_core::StatusAction;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};
use tracing_futures::Instrument;

use crate::{
    check::{CheckContext, HealthCheck},
    tracker::FailureTracker,
};

pub const NAME: &str = "nas";

const PROBE_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DISABLE_AFTER: u32 = 2;

#[derive(Debug)]
struct NasState {
    tracker: FailureTracker,
    last_err: Option<String>,
}

impl NasState {
    fn new() -> Self {
        Self {
            tracker: FailureTracker::new(DISABLE_AFTER),
            last_err: None,
        }
    }

    fn record(&mut self, res: Result<()>) {
        let flipped = match res {
            Ok(()) => {
                self.last_err = None;
                self.tracker.record(true)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "nas status probe failed");
                self.last_err = Some(format!("{err:#}"));
                self.tracker.record(false)
            }
        };
        match flipped {
            Some(true) => warn!("nas disabled"),
            Some(false) => info!("nas enabled"),
            None => {}
        }
    }

    fn status(&self) -> StatusAction {
        if self.tracker.disabled() {
            StatusAction::failed(
                NAME,
                self.last_err.as_deref().unwrap_or("check nas failed"),
            )
        } else {
            StatusAction::ok(NAME)
        }
    }
}

/// Polls the NAS status URL in the background; the check only reports the
/// last verdict.
#[derive(Debug)]
pub struct NasCheck {
    state: Arc<Mutex<NasState>>,
}

impl NasCheck {
    pub fn spawn(address: String, shutdown: CancellationToken) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        let state = Arc::new(Mutex::new(NasState::new()));
        let span = info_span!("nas", %address);
        tokio::spawn(probe(client, address, Arc::clone(&state), shutdown).instrument(span));
        Ok(Self { state })
    }

    pub fn build(ctx: &CheckContext) -> Result<Arc<dyn HealthCheck>> {
        Ok(Arc::new(Self::spawn(
            ctx.nas_address.clone(),
            ctx.shutdown.clone(),
        )?))
    }
}

async fn probe(
    client: reqwest::Client,
    address: String,
    state: Arc<Mutex<NasState>>,
    shutdown: CancellationToken,
) {
    loop {
        let res = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = client.get(&address).send() => res,
        };
        let res = match res {
            Ok(resp) if resp.status() == StatusCode::OK => Ok(()),
            Ok(resp) => Err(anyhow::anyhow!("nas status returned {}", resp.status())),
            Err(err) => Err(anyhow::Error::new(err).context("nas status request failed")),
        };
        state.lock().record(res);

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(PROBE_INTERVAL) => {}
        }
    }
}

#[async_trait]
impl HealthCheck for NasCheck {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn check_status(&self) -> StatusAction {
        self.state.lock().status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_after_two_failures() {
        let mut state = NasState::new();
        assert!(state.status().ok);
        state.record(Err(anyhow::anyhow!("connection refused")));
        assert!(state.status().ok);
        state.record(Err(anyhow::anyhow!("connection refused")));
        let status = state.status();
        assert!(!status.ok);
        assert_eq!(status.detail.as_deref(), Some("connection refused"));

        state.record(Ok(()));
        assert!(state.status().ok);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_nas_is_reported() {
        let shutdown = CancellationToken::new();
        let check = NasCheck::spawn("http://127.0.0.1:1/api/status".into(), shutdown.clone())
            .unwrap();
        assert!(check.check_status().await.ok);
        for _ in 0..100 {
            if !check.check_status().await.ok {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(!check.check_status().await.ok);
        shutdown.cancel();
    }
}
