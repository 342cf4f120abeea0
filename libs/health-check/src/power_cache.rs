//! # power cache
//!
//! The power cache is a shared cache filesystem every node mounts. Whether
//! this node should give up its VIP when its own cache is broken depends on
//! whether any peer still has a working one, so availability is voted on
//! cluster wide.
//!
//! Three tasks cooperate:
//! - the **worker** runs one write probe at a time off the runtime
//! - the **monitor** hands the worker a new probe whenever the previous
//!   result arrived, counts failures and timeouts, flips the local disabled
//!   flag, and mirrors it into the store as a record under the availability
//!   prefix
//! - the **voter** recounts the records whenever the monitor changed ours and
//!   derives the cluster wide available flag
//!
//! The check itself only reads the two flags.
use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use arbiter_core::{
    AvailabilityChange, Notification, PubSub, StatusAction,
    metrics::{POWER_CACHE_CLUSTER_AVAILABLE, POWER_CACHE_LOCAL_DISABLED},
};
use async_trait::async_trait;
use chrono::Utc;
use coordination::{CoordinationStore, bounded};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;

use crate::{
    check::{CheckContext, HealthCheck},
    tracker::FailureTracker,
};

pub const NAME: &str = "power_cache";

/// a probe that has not answered by then counts as failed
const PROBE_TIMEOUT: Duration = Duration::from_secs(25);
/// pause between two monitor rounds
const PROBE_DELAY: Duration = Duration::from_secs(5);
const DISABLE_AFTER: u32 = 5;
const VOTE_TIMEOUT: Duration = Duration::from_secs(2);

/// Writes a timestamp into a marker file on the mounted cache
#[derive(Debug, Clone)]
pub struct WriteProbe {
    mount_point: PathBuf,
    mounts_file: PathBuf,
    file: PathBuf,
}

impl WriteProbe {
    pub fn new(mount_point: PathBuf, mounts_file: PathBuf, marker: &str) -> Self {
        let file = mount_point.join(format!(".write_check_{marker}"));
        Self {
            mount_point,
            mounts_file,
            file,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// create the marker file if it is missing
    pub fn prepare(&self) {
        if let Err(err) = OpenOptions::new().create(true).append(true).open(&self.file) {
            warn!(file = %self.file.display(), ?err, "failed to create marker file");
        }
    }

    /// Blocking. Fails if the mount point is not mounted or the marker file
    /// cannot be written.
    pub fn run(&self, stamp: i64) -> Result<()> {
        if !self.mounted()? {
            bail!("mount point {} not mounted", self.mount_point.display());
        }
        let mut file = match OpenOptions::new().write(true).truncate(true).open(&self.file) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // the cache was wiped, recreate for the next round
                if let Err(err) = File::create(&self.file) {
                    warn!(file = %self.file.display(), ?err, "failed to recreate marker file");
                }
                return Err(err).context("marker file missing");
            }
            Err(err) => return Err(err).context("failed to open marker file"),
        };
        write!(file, "{stamp}").context("failed to write marker file")?;
        file.sync_data().context("failed to sync marker file")?;
        Ok(())
    }

    fn mounted(&self) -> Result<bool> {
        let mounts = std::fs::read_to_string(&self.mounts_file)
            .with_context(|| format!("failed to read {}", self.mounts_file.display()))?;
        Ok(mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|target| Path::new(target) == self.mount_point))
    }
}

async fn worker(probe: WriteProbe, mut work: mpsc::Receiver<i64>, results: mpsc::Sender<Result<()>>) {
    {
        let probe = probe.clone();
        let _ = tokio::task::spawn_blocking(move || probe.prepare()).await;
    }
    while let Some(stamp) = work.recv().await {
        let probe = probe.clone();
        let res = match tokio::task::spawn_blocking(move || probe.run(stamp)).await {
            Ok(res) => res,
            Err(err) => Err(io::Error::other(err)).context("write probe panicked"),
        };
        if results.send(res).await.is_err() {
            break;
        }
    }
}

/// Owns the local disabled flag and our availability record
#[derive(Debug)]
struct Monitor {
    store: Arc<dyn CoordinationStore>,
    key: String,
    tracker: FailureTracker,
    /// flag value last written to the store, `None` until the first write
    synced: Option<bool>,
    local: watch::Sender<bool>,
    notify: mpsc::Sender<()>,
}

impl Monitor {
    async fn run(
        mut self,
        work: mpsc::Sender<i64>,
        mut results: mpsc::Receiver<Result<()>>,
        shutdown: CancellationToken,
    ) {
        let _ = work.try_send(Utc::now().timestamp());
        loop {
            let ok = tokio::select! {
                _ = shutdown.cancelled() => return,
                res = tokio::time::timeout(PROBE_TIMEOUT, results.recv()) => match res {
                    Ok(Some(res)) => {
                        // only queue the next probe once the last one answered
                        let _ = work.try_send(Utc::now().timestamp());
                        match res {
                            Ok(()) => true,
                            Err(err) => {
                                warn!(err = %format!("{err:#}"), "power cache probe failed");
                                false
                            }
                        }
                    }
                    Ok(None) => {
                        error!("power cache worker exited");
                        return;
                    }
                    Err(_) => {
                        warn!(timeout = PROBE_TIMEOUT.as_secs(), "power cache probe timed out");
                        false
                    }
                },
            };
            self.observe(ok).await;

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(PROBE_DELAY) => {}
            }
        }
    }

    async fn observe(&mut self, ok: bool) {
        if let Some(disabled) = self.tracker.record(ok) {
            if disabled {
                warn!("local power cache disabled");
            } else {
                info!("local power cache enabled");
            }
            self.local.send_replace(disabled);
            POWER_CACHE_LOCAL_DISABLED.set(i64::from(disabled));
        }

        let disabled = self.tracker.disabled();
        if self.synced != Some(disabled) {
            if self.sync(disabled).await {
                self.synced = Some(disabled);
            }
            let _ = self.notify.try_send(());
        }
    }

    /// mirror the flag into the store, true on success
    async fn sync(&self, disabled: bool) -> bool {
        let res = if disabled {
            self.store
                .put_if_absent(&self.key, &Utc::now().to_rfc3339())
                .await
        } else {
            self.store.delete_if_present(&self.key).await
        };
        match res {
            Ok(changed) => {
                debug!(key = %self.key, disabled, changed, "availability record synced");
                true
            }
            Err(err) => {
                warn!(key = %self.key, disabled, ?err, "failed to sync availability record");
                false
            }
        }
    }
}

/// Owns the cluster wide available flag
#[derive(Debug)]
pub struct Voter {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    instances: usize,
    available: watch::Sender<bool>,
    bus: PubSub<Notification>,
}

impl Voter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        prefix: String,
        instances: usize,
        bus: PubSub<Notification>,
    ) -> (Self, watch::Receiver<bool>) {
        let (available, rx) = watch::channel(true);
        (
            Self {
                store,
                prefix,
                instances,
                available,
                bus,
            },
            rx,
        )
    }

    async fn run(self, mut notify: mpsc::Receiver<()>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                msg = notify.recv() => match msg {
                    Some(()) => {
                        self.vote().await;
                    }
                    None => return,
                },
            }
        }
    }

    /// Recount the disabled records. Available while fewer nodes than the
    /// cluster size are disabled. A failed read counts as available.
    pub async fn vote(&self) -> bool {
        let (disabled_nodes, available) =
            match bounded(VOTE_TIMEOUT, self.store.get_prefix(&self.prefix)).await {
                Ok(records) => (Some(records.len()), records.len() < self.instances),
                Err(err) => {
                    warn!(?err, "failed to read availability records, assuming peers available");
                    (None, true)
                }
            };
        debug!(?disabled_nodes, instances = self.instances, available, "power cache vote");
        POWER_CACHE_CLUSTER_AVAILABLE.set(i64::from(available));

        let previous = self.available.send_replace(available);
        if previous != available {
            info!(?disabled_nodes, available, "cluster power cache availability changed");
            self.bus
                .publish(Notification::Availability(AvailabilityChange {
                    disabled_nodes,
                    instances: self.instances,
                    available,
                }));
        }
        available
    }
}

/// what the check reports for a combination of flags
pub fn verdict(local_disabled: bool, cluster_available: bool) -> StatusAction {
    match (local_disabled, cluster_available) {
        (false, _) => StatusAction::ok(NAME),
        // a peer can take the VIP over
        (true, true) => StatusAction::failed(NAME, "local power cache unavailable"),
        // moving the VIP would not help
        (true, false) => StatusAction::ok(NAME)
            .with_detail("power cache unavailable on every node, keeping vip"),
    }
}

#[derive(Debug)]
pub struct PowerCacheCheck {
    local_disabled: watch::Receiver<bool>,
    cluster_available: watch::Receiver<bool>,
}

impl PowerCacheCheck {
    /// start the worker, monitor and voter tasks
    pub fn spawn(ctx: &CheckContext) -> Self {
        let marker = ctx.local_addr.to_string();
        let probe = WriteProbe::new(
            ctx.power_cache.mount_point.clone(),
            ctx.power_cache.mounts_file.clone(),
            &marker,
        );
        let (work_tx, work_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::channel(1);
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let (local_tx, local_rx) = watch::channel(false);

        let (voter, cluster_rx) = Voter::new(
            Arc::clone(&ctx.store),
            ctx.keys.availability_prefix().to_owned(),
            ctx.instances_count,
            ctx.bus.clone(),
        );
        let monitor = Monitor {
            store: Arc::clone(&ctx.store),
            key: ctx.keys.availability_key(ctx.local_addr),
            tracker: FailureTracker::new(DISABLE_AFTER),
            synced: None,
            local: local_tx,
            notify: notify_tx,
        };

        let span = info_span!("power_cache", file = %probe.file().display());
        tokio::spawn(worker(probe, work_rx, result_tx).instrument(span.clone()));
        tokio::spawn(
            monitor
                .run(work_tx, result_rx, ctx.shutdown.clone())
                .instrument(span.clone()),
        );
        tokio::spawn(voter.run(notify_rx, ctx.shutdown.clone()).instrument(span));

        Self {
            local_disabled: local_rx,
            cluster_available: cluster_rx,
        }
    }

    pub fn build(ctx: &CheckContext) -> Result<Arc<dyn HealthCheck>> {
        Ok(Arc::new(Self::spawn(ctx)))
    }
}

#[async_trait]
impl HealthCheck for PowerCacheCheck {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn check_status(&self) -> StatusAction {
        let local_disabled = *self.local_disabled.borrow();
        let cluster_available = *self.cluster_available.borrow();
        verdict(local_disabled, cluster_available)
    }
}
