//! # lease
//!
//! Keeps this node's priority for every configured VIP in the registry.
//!
//! Each entry is owned by its own task, which reacts to three events:
//! - the step-down token is cancelled: unregister and exit
//! - the keepalive stream closed (lease lost): register again
//! - the ttl timer fired: retry a pending cleanup, or register if there is no
//!   live keepalive stream
//!
//! A task hands its entry back through its `JoinHandle`, so the next
//! [`LeaseManager::start`] continues from whatever state the last epoch left,
//! pending cleanup included.
use std::{net::IpAddr, sync::Arc, time::Duration};

use arbiter_core::metrics::LEASE_OPS;
use config::ArbiterConfig;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn};
use tracing_futures::Instrument;

use crate::{
    error::StoreResult,
    keys::KeyLayout,
    registry::{EntryId, EntrySnapshot, EntryState, RegistryEntry},
    store::{CoordinationStore, KeepAliveEvent, KeepAliveStream},
};

/// added to the configured ttl when granting a lease
pub const LEASE_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct LeaseManager {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
    slots: Mutex<Vec<Slot>>,
    snapshots: Vec<watch::Receiver<EntrySnapshot>>,
}

#[derive(Debug)]
enum Slot {
    Idle(EntryWorker),
    Running {
        id: EntryId,
        tx: watch::Sender<EntrySnapshot>,
        handle: JoinHandle<EntryWorker>,
    },
}

impl Slot {
    /// wait for a running task to hand its entry back
    async fn reclaim(self) -> EntryWorker {
        match self {
            Slot::Idle(worker) => worker,
            Slot::Running { id, tx, handle } => match handle.await {
                Ok(worker) => worker,
                Err(err) => {
                    // the store may hold a key or lease we lost track of
                    error!(key = %id.key, ?err, "lease task failed, scheduling cleanup");
                    let mut entry = RegistryEntry::new(id);
                    entry.residual = true;
                    tx.send_replace(entry.snapshot());
                    EntryWorker {
                        entry,
                        tx,
                        claimed: true,
                    }
                }
            },
        }
    }
}

impl LeaseManager {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration, entries: Vec<EntryId>) -> Self {
        let mut slots = Vec::with_capacity(entries.len());
        let mut snapshots = Vec::with_capacity(entries.len());
        for id in entries {
            let entry = RegistryEntry::new(id);
            let (tx, rx) = watch::channel(entry.snapshot());
            snapshots.push(rx);
            slots.push(Slot::Idle(EntryWorker {
                entry,
                tx,
                claimed: false,
            }));
        }
        Self {
            store,
            ttl,
            slots: Mutex::new(slots),
            snapshots,
        }
    }

    /// one entry per configured VIP
    pub fn from_config(
        store: Arc<dyn CoordinationStore>,
        cfg: &ArbiterConfig,
        local_addr: IpAddr,
        keys: &KeyLayout,
    ) -> Self {
        let entries = cfg
            .vips()
            .iter()
            .map(|v| EntryId::new(v.vip, local_addr, v.priority, keys))
            .collect();
        Self::new(store, cfg.ttl(), entries)
    }

    /// Start one task per entry, running until `down` is cancelled. Tasks
    /// left from a previous epoch are awaited first, so an entry is never
    /// owned by two tasks.
    pub async fn start(&self, down: CancellationToken) {
        let mut slots = self.slots.lock().await;
        for slot in std::mem::take(&mut *slots) {
            let worker = slot.reclaim().await;
            let id = worker.entry.id.clone();
            let tx = worker.tx.clone();
            let span = info_span!("lease", vip = %id.vip, key = %id.key);
            let handle = tokio::spawn(
                worker
                    .run(Arc::clone(&self.store), self.ttl, down.clone())
                    .instrument(span),
            );
            slots.push(Slot::Running { id, tx, handle });
        }
        debug!(entries = slots.len(), "lease tasks started");
    }

    /// Wait for every task to exit. Only returns once the token given to
    /// [`LeaseManager::start`] was cancelled.
    pub async fn join(&self) {
        let mut slots = self.slots.lock().await;
        for slot in std::mem::take(&mut *slots) {
            slots.push(Slot::Idle(slot.reclaim().await));
        }
    }

    /// latest state of every entry
    pub fn snapshots(&self) -> Vec<EntrySnapshot> {
        self.snapshots.iter().map(|rx| rx.borrow().clone()).collect()
    }
}

#[derive(Debug)]
struct EntryWorker {
    entry: RegistryEntry,
    tx: watch::Sender<EntrySnapshot>,
    /// conditional create done
    claimed: bool,
}

/// next event of the keepalive stream, or never if there is none
async fn lease_event(stream: &mut Option<KeepAliveStream>) -> Option<KeepAliveEvent> {
    match stream {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl EntryWorker {
    async fn run(
        mut self,
        store: Arc<dyn CoordinationStore>,
        ttl: Duration,
        down: CancellationToken,
    ) -> Self {
        let store = &*store;
        if !self.claimed {
            self.claim(store).await;
            self.claimed = true;
        }

        // first tick completes immediately
        let mut timer = tokio::time::interval(ttl);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = down.cancelled() => {
                    info!("step down, withdrawing registry entry");
                    self.unregister(store).await;
                    return self;
                }
                event = lease_event(&mut self.entry.keep_alive) => match event {
                    Some(event) => trace!(lease = event.lease, ttl = event.ttl, "lease renewed"),
                    None => {
                        warn!(lease = ?self.entry.lease, "keepalive closed, lease lost");
                        self.entry.keep_alive = None;
                        self.entry.lease = None;
                        self.register(store, ttl).await;
                    }
                },
                _ = timer.tick() => {
                    if self.entry.residual {
                        self.unregister(store).await;
                    }
                    if self.entry.keep_alive.is_none() && !self.entry.residual {
                        self.register(store, ttl).await;
                    }
                }
            }
        }
    }

    /// Create the key without a lease unless some writer already did. Never
    /// blocks startup.
    async fn claim(&self, store: &dyn CoordinationStore) {
        let id = &self.entry.id;
        match store.put_if_absent(&id.key, &id.value()).await {
            Ok(true) => debug!("registry key created"),
            Ok(false) => debug!("registry key already present"),
            Err(err) => warn!(?err, "failed to claim registry key"),
        }
    }

    async fn register(&mut self, store: &dyn CoordinationStore, ttl: Duration) {
        self.set_state(EntryState::Registering);
        match self.try_register(store, ttl).await {
            Ok(()) => {
                LEASE_OPS.register.ok.inc();
                info!(lease = ?self.entry.lease, "registered");
                self.entry.state = EntryState::Leased;
            }
            Err(err) => {
                LEASE_OPS.register.failed.inc();
                warn!(?err, "register failed, cleanup scheduled");
                // stop renewing, whatever made it into the store expires or
                // is removed by the next cleanup
                self.entry.keep_alive = None;
                self.entry.residual = true;
                self.entry.state = EntryState::Unregistered;
            }
        }
        self.publish();
    }

    async fn try_register(&mut self, store: &dyn CoordinationStore, ttl: Duration) -> StoreResult<()> {
        let lease = store.grant_lease(ttl + LEASE_MARGIN).await?;
        self.entry.lease = Some(lease);
        self.entry.keep_alive = Some(store.keep_alive(lease).await?);
        let id = &self.entry.id;
        store.put(&id.key, &id.value(), Some(lease)).await
    }

    async fn unregister(&mut self, store: &dyn CoordinationStore) {
        self.set_state(EntryState::Unregistering);
        if let Some(lease) = self.entry.lease {
            if let Err(err) = store.revoke(lease).await {
                // it expires on its own once renewals stop
                warn!(lease, ?err, "failed to revoke lease");
            }
        }
        match store.delete(&self.entry.id.key).await {
            Ok(()) => {
                LEASE_OPS.unregister.ok.inc();
                info!("unregistered");
                self.entry.lease = None;
                self.entry.keep_alive = None;
                self.entry.residual = false;
            }
            Err(err) => {
                LEASE_OPS.unregister.failed.inc();
                warn!(?err, "unregister failed, cleanup scheduled");
                self.entry.keep_alive = None;
                self.entry.residual = true;
            }
        }
        self.entry.state = EntryState::Unregistered;
        self.publish();
    }

    fn set_state(&mut self, state: EntryState) {
        self.entry.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.tx.send_replace(self.entry.snapshot());
    }
}
