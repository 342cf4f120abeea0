//! Service liveness by process name.
//!
//! Pids found by `pgrep` are cached; later checks pass as long as one cached
//! pid is still alive and only go back to `pgrep` once all of them died.
use std::{process::Stdio, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use arbiter_core::StatusAction;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::debug;

use crate::check::{CheckContext, HealthCheck};

pub const NFS: &str = "nfs";
pub const SAMBA: &str = "samba";

const PGREP_TIMEOUT: Duration = Duration::from_secs(5);

/// true if `pid` names a live process
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the existence and permission checks only
    let res = unsafe { libc::kill(pid, 0) };
    // EPERM: it exists but belongs to someone else
    res == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[derive(Debug)]
pub struct ProcessCheck {
    name: &'static str,
    process: &'static str,
    pids: Mutex<Vec<i32>>,
}

impl ProcessCheck {
    pub fn new(name: &'static str, process: &'static str) -> Self {
        Self {
            name,
            process,
            pids: Mutex::new(Vec::new()),
        }
    }

    pub fn build_nfs(_: &CheckContext) -> Result<Arc<dyn HealthCheck>> {
        Ok(Arc::new(Self::new(NFS, "nfsd")))
    }

    pub fn build_samba(_: &CheckContext) -> Result<Arc<dyn HealthCheck>> {
        Ok(Arc::new(Self::new(SAMBA, "smbd")))
    }

    /// drop dead pids, true if any cached pid is alive
    fn cached_alive(&self) -> bool {
        let mut pids = self.pids.lock();
        pids.retain(|pid| process_alive(*pid));
        !pids.is_empty()
    }
}

async fn pgrep(process: &str) -> Result<Vec<i32>> {
    let output = tokio::time::timeout(
        PGREP_TIMEOUT,
        Command::new("pgrep")
            .arg(process)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .with_context(|| format!("pgrep {process} timed out after {}s", PGREP_TIMEOUT.as_secs()))?
    .context("failed to run pgrep")?;

    // 1 means nothing matched
    if !output.status.success() && output.status.code() != Some(1) {
        bail!("pgrep {process} exited with {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

#[async_trait]
impl HealthCheck for ProcessCheck {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn check_status(&self) -> StatusAction {
        if self.cached_alive() {
            return StatusAction::ok(self.name);
        }
        match pgrep(self.process).await {
            Ok(pids) if pids.is_empty() => {
                StatusAction::failed(self.name, format!("has no {} process", self.process))
            }
            Ok(pids) => {
                debug!(process = self.process, ?pids, "caching pids");
                *self.pids.lock() = pids;
                StatusAction::ok(self.name)
            }
            Err(err) => StatusAction::failed(self.name, format!("{err:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(i32::MAX));
        assert!(!process_alive(0));
        assert!(!process_alive(-1));
    }

    #[tokio::test]
    async fn cached_pid_short_circuits() {
        let check = ProcessCheck::new(NFS, "no-such-process-here");
        *check.pids.lock() = vec![i32::MAX, std::process::id() as i32];
        assert!(check.check_status().await.ok);
        // the dead one was dropped
        assert_eq!(*check.pids.lock(), vec![std::process::id() as i32]);
    }

    #[tokio::test]
    async fn missing_process_fails() {
        let check = ProcessCheck::new(SAMBA, "no-such-process-here");
        *check.pids.lock() = vec![i32::MAX];
        let status = check.check_status().await;
        assert!(!status.ok);
        assert_eq!(status.name, SAMBA);
        assert!(check.pids.lock().is_empty());
    }
}
