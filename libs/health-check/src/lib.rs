//! # health-check
//!
//! Everything that decides whether this node should keep its VIP candidacy:
//! the [`HealthCheck`] capability and the [`CheckRegistry`] mapping config
//! names to implementations, the [`Aggregator`] running all checks on a
//! fixed tick, and the power cache probe with its cluster-wide vote.

pub mod aggregator;
pub mod check;
pub mod checks;
pub mod power_cache;
pub mod tracker;

pub use aggregator::Aggregator;
pub use check::{CheckContext, CheckRegistry, Constructor, HealthCheck};
pub use tracker::FailureTracker;
