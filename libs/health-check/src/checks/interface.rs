use std::sync::Arc;

use anyhow::{Result, bail};
use arbiter_core::StatusAction;
use async_trait::async_trait;

use crate::check::{CheckContext, HealthCheck};

pub const NAME: &str = "front_interface";

/// the VRRP interface must exist and be both UP and RUNNING
#[derive(Debug)]
pub struct FrontInterface {
    interface: String,
}

impl FrontInterface {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    pub fn build(ctx: &CheckContext) -> Result<Arc<dyn HealthCheck>> {
        Ok(Arc::new(Self::new(ctx.interface.clone())))
    }
}

fn interface_up(name: &str) -> Result<()> {
    let Some(interface) = pnet::datalink::interfaces()
        .into_iter()
        .find(|e| e.name == name)
    else {
        bail!("interface {name} not found");
    };
    if !interface.is_up() {
        bail!("interface {name} is down");
    }
    if !interface.is_running() {
        bail!("interface {name} is not running");
    }
    Ok(())
}

#[async_trait]
impl HealthCheck for FrontInterface {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn check_status(&self) -> StatusAction {
        match interface_up(&self.interface) {
            Ok(()) => StatusAction::ok(NAME),
            Err(err) => StatusAction::failed(NAME, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_interface_fails() {
        let status = FrontInterface::new("does-not-exist0").check_status().await;
        assert!(!status.ok);
        assert_eq!(status.name, NAME);
        assert_eq!(
            status.detail.as_deref(),
            Some("interface does-not-exist0 not found")
        );
    }
}
