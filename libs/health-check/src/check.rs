//! The health check capability and the name -> constructor registry
use std::{collections::BTreeMap, fmt, net::IpAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use arbiter_core::{Notification, PubSub, StatusAction};
use async_trait::async_trait;
use config::{ArbiterConfig, PowerCacheConfig};
use coordination::{CoordinationStore, KeyLayout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    checks::{interface, keepalived, nas, process},
    power_cache,
};

#[async_trait]
pub trait HealthCheck: Send + Sync + fmt::Debug + 'static {
    /// stable identifier, used in config, metrics and the support listing
    fn name(&self) -> &'static str;

    /// Probe once. Must not block past the aggregation deadline in the
    /// common case; slow checks fail the whole tick.
    async fn check_status(&self) -> StatusAction;
}

/// Everything a check may need to build itself
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub interface: String,
    pub local_addr: IpAddr,
    pub instances_count: usize,
    pub keepalived_pid_file: PathBuf,
    pub power_cache: PowerCacheConfig,
    pub nas_address: String,
    pub keys: KeyLayout,
    pub store: Arc<dyn CoordinationStore>,
    pub bus: PubSub<Notification>,
    /// stops background probes
    pub shutdown: CancellationToken,
}

impl CheckContext {
    pub fn new(
        cfg: &ArbiterConfig,
        local_addr: IpAddr,
        store: Arc<dyn CoordinationStore>,
        bus: PubSub<Notification>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            interface: cfg.interface().to_owned(),
            local_addr,
            instances_count: cfg.instances_count(),
            keepalived_pid_file: cfg.keepalived_pid_file().to_path_buf(),
            power_cache: cfg.power_cache().clone(),
            nas_address: cfg.nas_address().to_owned(),
            keys: KeyLayout::from(cfg.prefixes()),
            store,
            bus,
            shutdown,
        }
    }
}

/// Builds a check. Constructors of background probes spawn their tasks, so
/// they must be called from within a tokio runtime.
pub type Constructor = fn(&CheckContext) -> Result<Arc<dyn HealthCheck>>;

/// checks that run whether configured or not
pub const ALWAYS: [&str; 2] = [interface::NAME, keepalived::NAME];

#[derive(Clone)]
pub struct CheckRegistry {
    ctors: BTreeMap<&'static str, Constructor>,
}

impl fmt::Debug for CheckRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckRegistry")
            .field("checks", &self.supported())
            .finish()
    }
}

impl Default for CheckRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(interface::NAME, interface::FrontInterface::build)
            .register(keepalived::NAME, keepalived::KeepalivedCheck::build)
            .register(process::NFS, process::ProcessCheck::build_nfs)
            .register(process::SAMBA, process::ProcessCheck::build_samba)
            .register(nas::NAME, nas::NasCheck::build)
            .register(power_cache::NAME, power_cache::PowerCacheCheck::build);
        registry
    }
}

impl CheckRegistry {
    pub fn empty() -> Self {
        Self {
            ctors: BTreeMap::new(),
        }
    }

    /// add or replace the constructor for `name`
    pub fn register(&mut self, name: &'static str, ctor: Constructor) -> &mut Self {
        self.ctors.insert(name, ctor);
        self
    }

    /// every known check name, sorted
    pub fn supported(&self) -> Vec<&'static str> {
        self.ctors.keys().copied().collect()
    }

    /// Build the always-on checks followed by `selected`, in order. Unknown
    /// names are logged and skipped, repeated names are built once.
    pub fn build(
        &self,
        ctx: &CheckContext,
        selected: &[String],
    ) -> Result<Vec<Arc<dyn HealthCheck>>> {
        let mut names: Vec<&'static str> = Vec::new();
        let requested = ALWAYS.iter().copied().chain(selected.iter().map(String::as_str));
        for name in requested {
            match self.ctors.get_key_value(name) {
                Some((&known, _)) if !names.contains(&known) => names.push(known),
                Some(_) => {}
                None => warn!(check = name, supported = ?self.supported(), "unknown health check, skipping"),
            }
        }

        let mut checks = Vec::with_capacity(names.len());
        for name in names {
            let ctor = self.ctors[name];
            checks.push(ctor(ctx).with_context(|| format!("failed to set up {name} check"))?);
        }
        info!(checks = ?checks.iter().map(|c| c.name()).collect::<Vec<_>>(), "health checks enabled");
        Ok(checks)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::Ipv4Addr;

    use coordination::memory::MemoryStore;
    use tracing_test::traced_test;

    use super::*;

    pub(crate) fn context() -> CheckContext {
        CheckContext {
            interface: "does-not-exist0".into(),
            local_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            instances_count: 3,
            keepalived_pid_file: "/nonexistent/keepalived.pid".into(),
            power_cache: PowerCacheConfig {
                mount_point: "/nonexistent/powercache".into(),
                mounts_file: "/nonexistent/mounts".into(),
            },
            nas_address: "http://127.0.0.1:1/api/status".into(),
            keys: KeyLayout::default(),
            store: Arc::new(MemoryStore::new()),
            bus: PubSub::new(),
            shutdown: CancellationToken::new(),
        }
    }

    #[derive(Debug)]
    struct Static(&'static str, bool);

    #[async_trait]
    impl HealthCheck for Static {
        fn name(&self) -> &'static str {
            self.0
        }
        async fn check_status(&self) -> StatusAction {
            if self.1 {
                StatusAction::ok(self.0)
            } else {
                StatusAction::failed(self.0, "static failure")
            }
        }
    }

    fn ok_check(_: &CheckContext) -> Result<Arc<dyn HealthCheck>> {
        Ok(Arc::new(Static("custom", true)))
    }

    #[test]
    fn supported_is_sorted() {
        assert_eq!(
            CheckRegistry::default().supported(),
            vec![
                "front_interface",
                "keepalived",
                "nas",
                "nfs",
                "power_cache",
                "samba"
            ]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn build_skips_unknown_and_duplicates() {
        let ctx = context();
        let checks = CheckRegistry::default()
            .build(
                &ctx,
                &[
                    "nfs".to_owned(),
                    "service".to_owned(),
                    "nfs".to_owned(),
                    "keepalived".to_owned(),
                ],
            )
            .unwrap();
        let names = checks.iter().map(|c| c.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["front_interface", "keepalived", "nfs"]);
        assert!(logs_contain("unknown health check, skipping"));
        ctx.shutdown.cancel();
    }

    #[tokio::test]
    async fn custom_checks_can_be_registered() {
        let mut registry = CheckRegistry::empty();
        registry.register("custom", ok_check);
        let checks = registry.build(&context(), &["custom".to_owned()]).unwrap();
        assert_eq!(checks.len(), 1);
        assert!(checks[0].check_status().await.ok);
    }
}
