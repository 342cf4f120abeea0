//! In-memory [`CoordinationStore`]
//!
//! Leases never expire on their own; call [`MemoryStore::expire_lease`] to
//! simulate expiry and [`MemoryStore::set_available`] to simulate an outage.
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    error::{StoreError, StoreResult},
    store::{CoordinationStore, KeepAliveEvent, KeepAliveStream, KeyValue, LeaseId},
};

#[derive(Debug)]
struct Value {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    keepers: Vec<mpsc::Sender<KeepAliveEvent>>,
}

#[derive(Debug, Default)]
struct State {
    next_lease: LeaseId,
    kvs: BTreeMap<String, Value>,
    leases: HashMap<LeaseId, Lease>,
}

impl State {
    fn drop_lease(&mut self, id: LeaseId) -> bool {
        if self.leases.remove(&id).is_none() {
            return false;
        }
        self.kvs.retain(|_, v| v.lease != Some(id));
        true
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// while unavailable every operation fails with [`StoreError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// expire `lease` as if it was not renewed in time: attached keys are
    /// removed and its keepalive streams close
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        self.state.lock().drop_lease(lease)
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.state.lock().kvs.get(key).map(|v| v.value.clone())
    }

    /// lease attached to `key`, if any
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.state.lock().kvs.get(key).and_then(|v| v.lease)
    }

    pub fn lease_ttl(&self, lease: LeaseId) -> Option<Duration> {
        self.state.lock().leases.get(&lease).map(|l| l.ttl)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().kvs.keys().cloned().collect()
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        self.check()?;
        let mut state = self.state.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                ttl,
                keepers: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        self.check()?;
        let mut state = self.state.lock();
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        let (tx, rx) = mpsc::channel(8);
        let _ = tx.try_send(KeepAliveEvent {
            lease,
            ttl: entry.ttl.as_secs() as i64,
        });
        entry.keepers.push(tx);
        Ok(rx)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock();
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }
        state.kvs.insert(
            key.to_owned(),
            Value {
                value: value.to_owned(),
                lease,
            },
        );
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .kvs
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.value.clone(),
            })
            .collect())
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.check()?;
        if self.state.lock().drop_lease(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.state.lock().kvs.remove(key);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if state.kvs.contains_key(key) {
            return Ok(false);
        }
        state.kvs.insert(
            key.to_owned(),
            Value {
                value: value.to_owned(),
                lease: None,
            },
        );
        Ok(true)
    }

    async fn delete_if_present(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.state.lock().kvs.remove(key).is_some())
    }
}
