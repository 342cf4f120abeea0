//! The VIP ownership decision behind `GET /check`
//!
//! keepalived calls this before taking or keeping a VIP. The answer comes
//! only from the registry in the coordination store: this node may hold the
//! VIP iff its own entry is present and no entry has a higher priority.
//! Equal top priorities all qualify, VRRP settles the rest.
use std::{collections::HashMap, net::IpAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::http::StatusCode;
use coordination::{CoordinationStore, KeyLayout, KeyValue, bounded};
use tracing::{debug, error, warn};

/// interface name of the caller
pub const LOCAL_HEADER: &str = "local";
/// the VIP being asked about
pub const VIP_HEADER: &str = "vip";

/// Outcome of one decision request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// this node is the highest priority candidate
    Hold,
    /// another node outranks us or we are not registered
    Deny,
    /// headers missing or unusable
    BadRequest,
    /// the registry could not be read or had nobody registered
    Unavailable,
}

impl Decision {
    pub fn status(self) -> StatusCode {
        match self {
            Decision::Hold => StatusCode::OK,
            Decision::Deny => StatusCode::FORBIDDEN,
            Decision::BadRequest => StatusCode::BAD_REQUEST,
            Decision::Unavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Maps interface names to the address this node registers under.
///
/// Pinned interfaces answer with the address resolved at startup, since
/// that is the address in the registry keys. Anything else is looked up
/// on the host.
#[derive(Debug, Clone, Default)]
pub struct InterfaceResolver {
    pinned: HashMap<String, IpAddr>,
}

impl InterfaceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(mut self, interface: impl Into<String>, addr: IpAddr) -> Self {
        self.pinned.insert(interface.into(), addr);
        self
    }

    pub fn resolve(&self, interface: &str) -> Result<IpAddr> {
        match self.pinned.get(interface) {
            Some(addr) => Ok(*addr),
            None => config::interface_v4(interface),
        }
    }
}

/// Everything the decision handler needs
#[derive(Debug)]
pub struct Arbiter {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    resolver: InterfaceResolver,
    query_timeout: Duration,
}

impl Arbiter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeyLayout,
        resolver: InterfaceResolver,
        query_timeout: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            resolver,
            query_timeout,
        }
    }

    /// Decide for the header values `local` and `vip`. Both are checked
    /// before the store is touched.
    pub async fn decide(&self, local: Option<&str>, vip: Option<&str>) -> Decision {
        let (Some(local), Some(vip)) = (local, vip) else {
            debug!(?local, ?vip, "missing Local or Vip header");
            return Decision::BadRequest;
        };
        let vip = match vip.parse::<IpAddr>() {
            Ok(vip) => vip,
            Err(err) => {
                warn!(vip, %err, "invalid vip header");
                return Decision::BadRequest;
            }
        };
        let local_addr = match self.resolver.resolve(local) {
            Ok(addr) => addr,
            Err(err) => {
                warn!(interface = local, err = %format!("{err:#}"), "failed to resolve local address");
                return Decision::BadRequest;
            }
        };

        let prefix = self.keys.vip_prefix(vip);
        let entries = match bounded(self.query_timeout, self.store.get_prefix(&prefix)).await {
            Ok(entries) => entries,
            Err(err) => {
                error!(%prefix, %err, "failed to query registry");
                return Decision::Unavailable;
            }
        };
        if entries.is_empty() {
            warn!(%prefix, "nobody registered for vip");
            return Decision::Unavailable;
        }

        let own_key = self.keys.presence_key(vip, local_addr);
        if holds(&entries, &own_key) {
            debug!(%vip, %local_addr, "vip may be held");
            Decision::Hold
        } else {
            debug!(%vip, %local_addr, "vip denied");
            Decision::Deny
        }
    }
}

/// true if `own_key` is among `entries` with the highest priority seen.
/// Values that are not integers are skipped.
pub fn holds(entries: &[KeyValue], own_key: &str) -> bool {
    let mut max = None;
    let mut own = None;
    for kv in entries {
        let priority = match kv.value.trim().parse::<i64>() {
            Ok(priority) => priority,
            Err(_) => {
                debug!(key = %kv.key, value = %kv.value, "skipping malformed priority");
                continue;
            }
        };
        max = max.max(Some(priority));
        if kv.key == own_key {
            own = Some(priority);
        }
    }
    own.is_some() && own == max
}
