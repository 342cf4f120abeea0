//! Runs every health check on a fixed tick and publishes one
//! [`AggregatedStatus`] per tick.
//!
//! Checks run as their own tasks. When the deadline passes first the tick
//! publishes a single synthetic failure; the slow tasks are left to finish
//! on their own and their results are dropped.
use std::{sync::Arc, time::Duration};

use arbiter_core::{
    AggregatedStatus, Notification, PubSub, StatusAction,
    metrics::{CHECK_TIMEOUT, record_check_run},
};
use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::check::HealthCheck;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Aggregator {
    checks: Vec<Arc<dyn HealthCheck>>,
    bus: PubSub<Notification>,
    interval: Duration,
    deadline: Duration,
}

impl Aggregator {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>, bus: PubSub<Notification>) -> Self {
        Self {
            checks,
            bus,
            interval: DEFAULT_INTERVAL,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_timing(mut self, interval: Duration, deadline: Duration) -> Self {
        self.interval = interval;
        self.deadline = deadline;
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// publish a result every interval until `shutdown`
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("aggregator stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let status = self.tick().await;
                    let delivered = self.bus.publish(Notification::Status(status));
                    debug!(delivered, "aggregated status published");
                }
            }
        }
    }

    /// run every check once, bounded by the deadline
    pub async fn tick(&self) -> AggregatedStatus {
        let handles = self
            .checks
            .iter()
            .map(|check| {
                let check = Arc::clone(check);
                tokio::spawn(async move { check.check_status().await })
            })
            .collect::<Vec<_>>();

        match tokio::time::timeout(self.deadline, join_all(handles)).await {
            Ok(results) => {
                CHECK_TIMEOUT.set(0);
                let results = results
                    .into_iter()
                    .zip(&self.checks)
                    .map(|(res, check)| {
                        let status = res.unwrap_or_else(|err| {
                            StatusAction::failed(check.name(), format!("check task failed: {err}"))
                        });
                        record_check_run(check.name(), !status.ok);
                        if !status.ok {
                            warn!(check = %status.name, detail = ?status.detail, "health check failed");
                        }
                        status
                    })
                    .collect();
                AggregatedStatus(results)
            }
            Err(_) => {
                CHECK_TIMEOUT.set(1);
                warn!(
                    deadline = self.deadline.as_secs(),
                    "health checks did not finish before the deadline"
                );
                AggregatedStatus::timed_out(self.deadline)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use arbiter_core::status::TIMEOUT_CHECK_NAME;
    use async_trait::async_trait;
    use tokio::{sync::mpsc, time::Instant};

    use super::*;

    #[derive(Debug)]
    enum Behavior {
        Pass,
        Fail,
        Hang,
        Panic,
    }

    #[derive(Debug)]
    struct Fake {
        name: &'static str,
        behavior: Behavior,
        runs: AtomicUsize,
    }

    fn fake(name: &'static str, behavior: Behavior) -> Arc<Fake> {
        Arc::new(Fake {
            name,
            behavior,
            runs: AtomicUsize::new(0),
        })
    }

    fn checks(fakes: Vec<Arc<Fake>>) -> Vec<Arc<dyn HealthCheck>> {
        fakes
            .into_iter()
            .map(|f| f as Arc<dyn HealthCheck>)
            .collect()
    }

    #[async_trait]
    impl HealthCheck for Fake {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn check_status(&self) -> StatusAction {
            self.runs.fetch_add(1, Ordering::Relaxed);
            match self.behavior {
                Behavior::Pass => StatusAction::ok(self.name),
                Behavior::Fail => StatusAction::failed(self.name, "broken"),
                Behavior::Hang => std::future::pending().await,
                Behavior::Panic => panic!("check blew up"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn results_in_registration_order() {
        let a = fake("a", Behavior::Pass);
        let b = fake("b", Behavior::Fail);
        let c = fake("c", Behavior::Pass);
        let agg = Aggregator::new(checks(vec![a, b, c]), PubSub::new());
        let status = agg.tick().await;
        let names = status.results().iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(!status.all_ok());
        assert_eq!(status.failures().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_check_times_out_at_deadline() {
        let agg = Aggregator::new(
            checks(vec![fake("ok", Behavior::Pass), fake("stuck", Behavior::Hang)]),
            PubSub::new(),
        );
        let start = Instant::now();
        let status = agg.tick().await;
        assert_eq!(start.elapsed(), DEFAULT_DEADLINE);
        assert_eq!(status.results().len(), 1);
        assert_eq!(status.results()[0].name, TIMEOUT_CHECK_NAME);
        assert!(!status.all_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_deadline() {
        let agg = Aggregator::new(checks(vec![fake("stuck", Behavior::Hang)]), PubSub::new())
            .with_timing(Duration::from_secs(1), Duration::from_secs(2));
        let start = Instant::now();
        let status = agg.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(
            status.results()[0].detail.as_deref(),
            Some("execute all check timeout 2s")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_check_fails_only_itself() {
        let agg = Aggregator::new(
            checks(vec![fake("ok", Behavior::Pass), fake("boom", Behavior::Panic)]),
            PubSub::new(),
        );
        let status = agg.tick().await;
        assert_eq!(status.results().len(), 2);
        assert!(status.results()[0].ok);
        assert!(!status.results()[1].ok);
        assert_eq!(status.results()[1].name, "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_every_interval() {
        let check = fake("a", Behavior::Pass);
        let bus = PubSub::new();
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        bus.subscribe(tx, shutdown.clone().cancelled_owned(), Notification::is_status);
        let agg = Aggregator::new(checks(vec![check.clone()]), bus.clone());
        let handle = tokio::spawn(agg.run(shutdown.clone()));

        let start = Instant::now();
        for _ in 0..3 {
            match rx.recv().await {
                Some(Notification::Status(status)) => assert!(status.all_ok()),
                other => panic!("unexpected {other:?}"),
            }
        }
        // first tick is immediate
        assert_eq!(start.elapsed(), DEFAULT_INTERVAL * 2);
        assert_eq!(check.runs.load(Ordering::Relaxed), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
