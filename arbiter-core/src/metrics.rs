#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! prometheus statistics for the arbiter
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, IntGauge, exponential_buckets,
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum LeaseOp {
        register,
        unregister,
    }
    pub label_enum LeaseOutcome {
        ok,
        failed,
    }
    pub struct LeaseStats: IntCounter {
        "op" => LeaseOp,
        "outcome" => LeaseOutcome,
    }
}

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();

    /// process uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "server uptime (seconds)").unwrap();

    /// histogram of `/check` processing time
    pub static ref CHECK_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "check_requests",
        "decision endpoint processing time (seconds)",
        &["code", "method"],
        exponential_buckets(0.001, 2.0, 24).unwrap()
    )
    .unwrap();

    /// 1 if the last aggregation tick hit its deadline
    pub static ref CHECK_TIMEOUT: IntGauge =
        register_int_gauge!("check_timeout", "1 if executing all health checks timed out on the last tick").unwrap();

    pub static ref HEALTH_CHECK_RUNS: IntCounterVec = register_int_counter_vec!(
        "health_check_runs",
        "health check executions by check and result",
        &["check", "result"]
    )
    .unwrap();

    pub static ref LEASE_OPS_VEC: IntCounterVec = register_int_counter_vec!(
        "lease_ops",
        "registry register/unregister attempts by outcome",
        &["op", "outcome"]
    )
    .unwrap();

    /// register/unregister outcomes, ex. `LEASE_OPS.register.failed.inc()`
    pub static ref LEASE_OPS: LeaseStats = LeaseStats::from(&LEASE_OPS_VEC);

    /// times the controller signalled step down
    pub static ref STEP_DOWN: IntCounter =
        register_int_counter!("step_down", "count of step down signals").unwrap();
    /// times the controller restarted leasing after recovery
    pub static ref LEASE_RESTART: IntCounter =
        register_int_counter!("lease_restart", "count of lease manager restarts after recovery").unwrap();

    pub static ref POWER_CACHE_LOCAL_DISABLED: IntGauge = register_int_gauge!(
        "power_cache_local_disabled",
        "1 if the local power cache is considered unavailable"
    )
    .unwrap();
    pub static ref POWER_CACHE_CLUSTER_AVAILABLE: IntGauge = register_int_gauge!(
        "power_cache_cluster_available",
        "1 if fewer nodes than the cluster size marked their power cache unavailable"
    )
    .unwrap();
}

/// count one run of `check`, and a failure if `failed`
pub fn record_check_run(check: &str, failed: bool) {
    HEALTH_CHECK_RUNS.with_label_values(&[check, "total"]).inc();
    if failed {
        HEALTH_CHECK_RUNS.with_label_values(&[check, "failed"]).inc();
    }
}
