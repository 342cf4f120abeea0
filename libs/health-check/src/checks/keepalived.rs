use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use arbiter_core::StatusAction;
use async_trait::async_trait;

use super::process::process_alive;
use crate::check::{CheckContext, HealthCheck};

pub const NAME: &str = "keepalived";

/// keepalived's pid file must name a live process
#[derive(Debug)]
pub struct KeepalivedCheck {
    pid_file: PathBuf,
}

impl KeepalivedCheck {
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
        }
    }

    pub fn build(ctx: &CheckContext) -> Result<Arc<dyn HealthCheck>> {
        Ok(Arc::new(Self::new(ctx.keepalived_pid_file.clone())))
    }
}

async fn read_pid(path: &Path) -> Result<i32> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let pid = data
        .trim()
        .parse::<i32>()
        .with_context(|| format!("invalid pid {:?} in {}", data.trim(), path.display()))?;
    if pid <= 0 {
        bail!("invalid pid {pid} in {}", path.display());
    }
    Ok(pid)
}

#[async_trait]
impl HealthCheck for KeepalivedCheck {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn check_status(&self) -> StatusAction {
        match read_pid(&self.pid_file).await {
            Ok(pid) if process_alive(pid) => StatusAction::ok(NAME),
            Ok(pid) => StatusAction::failed(NAME, format!("keepalived pid {pid} is not running")),
            Err(err) => StatusAction::failed(NAME, format!("{err:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn live_pid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", std::process::id()).unwrap();
        let status = KeepalivedCheck::new(file.path()).check_status().await;
        assert!(status.ok, "{status:?}");
    }

    #[tokio::test]
    async fn dead_pid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // above the kernel's pid_max
        writeln!(file, "{}", i32::MAX).unwrap();
        let status = KeepalivedCheck::new(file.path()).check_status().await;
        assert!(!status.ok);
        assert!(status.detail.unwrap().contains("is not running"));
    }

    #[tokio::test]
    async fn garbage_or_missing_pid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "keepalived").unwrap();
        let status = KeepalivedCheck::new(file.path()).check_status().await;
        assert!(!status.ok);
        assert!(status.detail.unwrap().contains("invalid pid"));

        let status = KeepalivedCheck::new("/nonexistent/keepalived.pid")
            .check_status()
            .await;
        assert!(!status.ok);
        assert!(status.detail.unwrap().contains("failed to read"));
    }
}
