use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use arbiter_core::{
    tokio::{self, task::JoinHandle},
    tracing::warn,
};
use tokio_util::sync::CancellationToken;

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

/// Every long running task must still be alive once the stabilization
/// window has passed.
pub async fn verify_startup_subsystems(
    api_task: &mut JoinHandle<()>,
    controller_task: &mut JoinHandle<()>,
    aggregator_task: &mut JoinHandle<()>,
) -> Result<()> {
    verify_background_task_running("external API", api_task)
        .await
        .context("startup check failed")?;
    verify_background_task_running("step down controller", controller_task)
        .await
        .context("startup check failed")?;
    verify_background_task_running("aggregator", aggregator_task)
        .await
        .context("startup check failed")?;
    Ok(())
}

pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}

/// Cancel `token` and give the controller up to `grace` to withdraw the
/// registry entries. Returns false if it had to be aborted.
pub async fn wind_down(
    token: &CancellationToken,
    controller_task: &mut JoinHandle<()>,
    grace: Duration,
) -> bool {
    token.cancel();
    // already joined by the startup check
    if controller_task.is_finished() {
        return true;
    }
    match tokio::time::timeout(grace, &mut *controller_task).await {
        Ok(_) => true,
        Err(_) => {
            warn!(grace_ms = grace.as_millis(), "registry entries not withdrawn in time");
            controller_task.abort();
            false
        }
    }
}
