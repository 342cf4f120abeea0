//! # arbiter-core
//!
//! Shared pieces of the VIP arbiter: command line configuration, tracing
//! setup, prometheus metrics, the health status model and the
//! publish/subscribe bus that fans aggregated results out to consumers.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use async_trait::async_trait;
pub use chrono;
pub use tokio;
pub use tokio_util;
pub use tracing;

pub mod config;
pub mod metrics;
pub mod pubsub;
pub mod status;

pub use crate::pubsub::PubSub;
pub use crate::status::{AggregatedStatus, AvailabilityChange, Notification, StatusAction};
