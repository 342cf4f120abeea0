//! on-disk config format. Everything here is deserialized as-is and
//! validated into [`crate::ArbiterConfig`].
use std::{net::IpAddr, num::NonZeroU32, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// VRRP interface name
    pub interface: String,
    /// address used in registry keys, defaults to the first IPv4 on `interface`
    #[serde(default)]
    pub local_addr: Option<IpAddr>,
    /// etcd endpoints
    pub etcd: Vec<String>,
    /// dial timeout
    #[serde(default = "default_dial", deserialize_with = "deserialize_duration")]
    pub dial: NonZeroU32,
    /// registry entry TTL
    #[serde(default = "default_ttl", deserialize_with = "deserialize_duration")]
    pub ttl: NonZeroU32,
    /// number of nodes in the cluster
    pub instances_count: usize,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub keepalived: Option<Keepalived>,
    #[serde(default)]
    pub power_cache: Option<PowerCache>,
    #[serde(default)]
    pub nas: Option<Nas>,
    #[serde(default)]
    pub prefixes: Option<Prefixes>,
}

/// a keepalived vrrp_instance
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub vips: Vec<Vip>,
    #[serde(default)]
    pub check: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Vip {
    /// kept as a string so a bad address is reported with its instance
    pub vip: String,
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Keepalived {
    pub pid_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PowerCache {
    pub mount_point: PathBuf,
    #[serde(default)]
    pub mounts_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Nas {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Prefixes {
    #[serde(default)]
    pub presence: Option<String>,
    #[serde(default)]
    pub availability: Option<String>,
}

pub const fn default_dial() -> NonZeroU32 {
    NonZeroU32::new(5).unwrap()
}

pub const fn default_ttl() -> NonZeroU32 {
    NonZeroU32::new(3).unwrap()
}

/// Parse a duration string with optional time units
/// Accepts: "3", "3s", "1m", "1h"
/// If no unit is specified, assumes seconds
fn parse_duration(s: &str) -> Result<u32> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u32>().context("invalid number")?;

    let num_seconds = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', or 's' are supported",
            other
        ),
    };

    num.checked_mul(num_seconds)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
    Int(u64),
    String(String),
}

fn deserialize_duration<'de, D>(de: D) -> Result<NonZeroU32, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = match Seconds::deserialize(de)? {
        Seconds::Int(val) => {
            u32::try_from(val).map_err(|_| de::Error::custom("duration value too large"))?
        }
        Seconds::String(s) => parse_duration(&s).map_err(de::Error::custom)?,
    };
    NonZeroU32::new(secs).ok_or_else(|| de::Error::custom("duration cannot be zero"))
}
