use std::{
    collections::HashSet,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use pnet::ipnetwork::IpNetwork;
use tracing::debug;

pub mod wire;

pub const DEFAULT_PID_FILE: &str = "/var/run/keepalived.pid";
pub const DEFAULT_MOUNT_POINT: &str = "/var/powercache";
pub const DEFAULT_MOUNTS_FILE: &str = "/proc/mounts";
pub const DEFAULT_NAS_ADDRESS: &str = "http://localhost:9999/api/status";
pub const DEFAULT_PRESENCE_PREFIX: &str = "/keepalived/";
pub const DEFAULT_AVAILABILITY_PREFIX: &str = "/disable_power_cache/";

/// highest priority keepalived accepts
const MAX_PRIORITY: i64 = 255;

/// validated arbiter config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterConfig {
    interface: String,
    local_addr: Option<IpAddr>,
    etcd: Vec<String>,
    dial: Duration,
    ttl: Duration,
    instances_count: usize,
    vips: Vec<VipEntry>,
    checks: Vec<String>,
    keepalived_pid_file: PathBuf,
    power_cache: PowerCacheConfig,
    nas_address: String,
    prefixes: Prefixes,
    path: Option<PathBuf>,
}

/// one VIP this node is a candidate for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VipEntry {
    pub instance: String,
    pub vip: IpAddr,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerCacheConfig {
    pub mount_point: PathBuf,
    pub mounts_file: PathBuf,
}

/// key prefixes in the coordination store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefixes {
    pub presence: String,
    pub availability: String,
}

impl Default for Prefixes {
    fn default() -> Self {
        Self {
            presence: DEFAULT_PRESENCE_PREFIX.to_owned(),
            availability: DEFAULT_AVAILABILITY_PREFIX.to_owned(),
        }
    }
}

impl ArbiterConfig {
    /// read and validate the YAML config at `path`
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::parse_str(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )
        .with_context(|| format!("invalid config at {}", path.display()))?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// validate a YAML config string
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let wire: wire::Config =
            serde_yaml::from_str(s.as_ref()).context("failed to decode config")?;
        let config = Self::try_from(wire)?;
        debug!(?config);
        Ok(config)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
    pub fn etcd(&self) -> &[String] {
        &self.etcd
    }
    pub fn dial(&self) -> Duration {
        self.dial
    }
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
    pub fn instances_count(&self) -> usize {
        self.instances_count
    }
    pub fn vips(&self) -> &[VipEntry] {
        &self.vips
    }
    /// union of every instance's checks, first occurrence order, no duplicates
    pub fn checks(&self) -> &[String] {
        &self.checks
    }
    pub fn keepalived_pid_file(&self) -> &Path {
        &self.keepalived_pid_file
    }
    pub fn power_cache(&self) -> &PowerCacheConfig {
        &self.power_cache
    }
    pub fn nas_address(&self) -> &str {
        &self.nas_address
    }
    pub fn prefixes(&self) -> &Prefixes {
        &self.prefixes
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// the address identifying this node in the registry: the configured
    /// `local_addr` or else the first IPv4 on the VRRP interface
    pub fn local_addr(&self) -> Result<IpAddr> {
        match self.local_addr {
            Some(addr) => Ok(addr),
            None => interface_v4(&self.interface),
        }
    }
}

impl TryFrom<wire::Config> for ArbiterConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        if cfg.interface.trim().is_empty() {
            bail!("`interface` must not be empty");
        }
        if cfg.etcd.is_empty() {
            bail!("at least one `etcd` endpoint is required");
        }
        if cfg.instances_count == 0 {
            bail!("`instances_count` must be greater than zero");
        }

        let mut vips = Vec::new();
        let mut seen = HashSet::new();
        let mut checks: Vec<String> = Vec::new();
        for instance in &cfg.instances {
            for entry in &instance.vips {
                let vip = entry.vip.trim().parse::<IpAddr>().with_context(|| {
                    format!("instance {}: invalid vip {:?}", instance.name, entry.vip)
                })?;
                if !(0..=MAX_PRIORITY).contains(&entry.priority) {
                    bail!(
                        "instance {}: priority {} for vip {} out of range 0..={}",
                        instance.name,
                        entry.priority,
                        vip,
                        MAX_PRIORITY
                    );
                }
                if !seen.insert(vip) {
                    bail!("instance {}: vip {} configured twice", instance.name, vip);
                }
                vips.push(VipEntry {
                    instance: instance.name.clone(),
                    vip,
                    priority: entry.priority as i32,
                });
            }
            for check in &instance.check {
                if !checks.iter().any(|c| c == check) {
                    checks.push(check.clone());
                }
            }
        }
        if vips.is_empty() {
            bail!("no vips configured");
        }

        let power_cache = cfg
            .power_cache
            .map(|p| PowerCacheConfig {
                mount_point: p.mount_point,
                mounts_file: p
                    .mounts_file
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNTS_FILE)),
            })
            .unwrap_or_else(|| PowerCacheConfig {
                mount_point: PathBuf::from(DEFAULT_MOUNT_POINT),
                mounts_file: PathBuf::from(DEFAULT_MOUNTS_FILE),
            });

        let mut prefixes = Prefixes::default();
        if let Some(p) = cfg.prefixes {
            if let Some(presence) = p.presence {
                prefixes.presence = with_trailing_slash(presence);
            }
            if let Some(availability) = p.availability {
                prefixes.availability = with_trailing_slash(availability);
            }
        }

        Ok(Self {
            interface: cfg.interface,
            local_addr: cfg.local_addr,
            etcd: cfg.etcd,
            dial: Duration::from_secs(cfg.dial.get() as u64),
            ttl: Duration::from_secs(cfg.ttl.get() as u64),
            instances_count: cfg.instances_count,
            vips,
            checks,
            keepalived_pid_file: cfg
                .keepalived
                .map(|k| k.pid_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE)),
            power_cache,
            nas_address: cfg
                .nas
                .map(|n| n.address)
                .unwrap_or_else(|| DEFAULT_NAS_ADDRESS.to_owned()),
            prefixes,
            path: None,
        })
    }
}

fn with_trailing_slash(mut prefix: String) -> String {
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

/// first IPv4 address assigned to the interface `name`
pub fn interface_v4(name: &str) -> Result<IpAddr> {
    let interface = pnet::datalink::interfaces()
        .into_iter()
        .find(|e| e.name == name)
        .with_context(|| format!("interface {name} not found"))?;

    interface
        .ips
        .iter()
        .find_map(|net| match net {
            IpNetwork::V4(net) => Some(IpAddr::V4(net.ip())),
            _ => None,
        })
        .with_context(|| format!("no IPv4 address on interface {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    static EXAMPLE: &str = include_str!("../../../example.yaml");

    fn minimal(vips: &str) -> String {
        format!(
            r#"
interface: eth0
local_addr: 10.0.0.1
etcd: ["http://127.0.0.1:2379"]
instances_count: 3
instances:
  - name: VI_1
    vips:
{vips}
"#
        )
    }

    #[test]
    fn parses_example() {
        let cfg = ArbiterConfig::parse_str(EXAMPLE).unwrap();
        assert_eq!(cfg.interface(), "eth0");
        assert_eq!(cfg.ttl(), Duration::from_secs(3));
        assert_eq!(cfg.dial(), Duration::from_secs(5));
        assert_eq!(cfg.instances_count(), 3);
        assert_eq!(cfg.vips().len(), 2);
        assert_eq!(cfg.vips()[0].vip, "10.1.33.133".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.vips()[0].priority, 100);
        assert_eq!(cfg.vips()[1].instance, "VI_2");
        assert_eq!(cfg.checks(), ["nfs", "power_cache", "samba"]);
        assert_eq!(cfg.prefixes(), &Prefixes::default());
        assert_eq!(
            cfg.power_cache().mounts_file,
            PathBuf::from(DEFAULT_MOUNTS_FILE)
        );
    }

    #[test]
    fn local_addr_override() {
        let cfg =
            ArbiterConfig::parse_str(minimal("      - {vip: 10.0.0.100, priority: 10}")).unwrap();
        assert_eq!(cfg.local_addr().unwrap(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.keepalived_pid_file(), Path::new(DEFAULT_PID_FILE));
        assert!(cfg.checks().is_empty());
    }

    #[test]
    fn invalid_vip() {
        let err = ArbiterConfig::parse_str(minimal("      - {vip: not-an-ip, priority: 10}"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid vip"), "{err:#}");
    }

    #[test]
    fn invalid_priority() {
        assert!(
            ArbiterConfig::parse_str(minimal("      - {vip: 10.0.0.100, priority: 256}")).is_err()
        );
        assert!(
            ArbiterConfig::parse_str(minimal("      - {vip: 10.0.0.100, priority: -1}")).is_err()
        );
    }

    #[test]
    fn duplicate_vip() {
        let err = ArbiterConfig::parse_str(minimal(
            "      - {vip: 10.0.0.100, priority: 10}\n      - {vip: 10.0.0.100, priority: 20}",
        ))
        .unwrap_err();
        assert!(format!("{err:#}").contains("configured twice"));
    }

    #[test]
    fn no_vips() {
        assert!(ArbiterConfig::parse_str(minimal("      []")).is_err());
    }

    #[test]
    fn prefixes_get_trailing_slash() {
        let mut s = minimal("      - {vip: 10.0.0.100, priority: 10}");
        s.push_str("prefixes:\n  presence: /vrrp\n  availability: /pc/\n");
        let cfg = ArbiterConfig::parse_str(s).unwrap();
        assert_eq!(cfg.prefixes().presence, "/vrrp/");
        assert_eq!(cfg.prefixes().availability, "/pc/");
    }

    #[test]
    fn missing_file() {
        let err = ArbiterConfig::parse("/nonexistent/vip-arbiter.yaml").unwrap_err();
        assert!(format!("{err}").contains("failed to find config"));
    }
}
