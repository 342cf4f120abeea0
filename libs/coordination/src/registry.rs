//! Registry entries: this node's candidacy for one VIP
use std::net::IpAddr;

use crate::{
    keys::KeyLayout,
    store::{KeepAliveStream, LeaseId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Unregistered,
    Registering,
    Leased,
    Unregistering,
}

/// The fixed part of an entry, everything that comes from config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryId {
    pub vip: IpAddr,
    pub local_addr: IpAddr,
    pub priority: i32,
    pub key: String,
}

impl EntryId {
    pub fn new(vip: IpAddr, local_addr: IpAddr, priority: i32, keys: &KeyLayout) -> Self {
        Self {
            vip,
            local_addr,
            priority,
            key: keys.presence_key(vip, local_addr),
        }
    }

    /// value stored under the key
    pub fn value(&self) -> String {
        self.priority.to_string()
    }
}

/// Point-in-time view of an entry, published by the task that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub vip: IpAddr,
    pub local_addr: IpAddr,
    pub priority: i32,
    pub key: String,
    pub state: EntryState,
    pub lease: Option<LeaseId>,
    /// an unregister failed and the store may still hold our key or lease
    pub residual: bool,
}

/// Owned by exactly one lease task at a time.
///
/// `lease` and `keep_alive` are set by a successful register and cleared by a
/// successful unregister. `residual` is set whenever either operation failed
/// part way, and cleared by the next successful unregister.
#[derive(Debug)]
pub struct RegistryEntry {
    pub(crate) id: EntryId,
    pub(crate) state: EntryState,
    pub(crate) lease: Option<LeaseId>,
    pub(crate) keep_alive: Option<KeepAliveStream>,
    pub(crate) residual: bool,
}

impl RegistryEntry {
    pub fn new(id: EntryId) -> Self {
        Self {
            id,
            state: EntryState::Unregistered,
            lease: None,
            keep_alive: None,
            residual: false,
        }
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            vip: self.id.vip,
            local_addr: self.id.local_addr,
            priority: self.id.priority,
            key: self.id.key.clone(),
            state: self.state,
            lease: self.lease,
            residual: self.residual,
        }
    }
}
