//! Health status model shared by the aggregator and its subscribers

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name given to the synthetic result published when a tick misses its deadline
pub const TIMEOUT_CHECK_NAME: &str = "aggregator";

/// Result of one health check execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusAction {
    /// when the check produced this result
    pub time: DateTime<Utc>,
    /// name of the check, as registered
    pub name: String,
    /// whether this node may keep candidacy as far as this check is concerned
    pub ok: bool,
    /// free-form detail, usually the error that failed the check
    pub detail: Option<String>,
}

impl StatusAction {
    /// a passing result for `name`
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            name: name.into(),
            ok: true,
            detail: None,
        }
    }

    /// a failing result for `name` with `detail`
    pub fn failed(name: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self {
            time: Utc::now(),
            name: name.into(),
            ok: false,
            detail: Some(detail.to_string()),
        }
    }

    /// attach a detail message
    pub fn with_detail(mut self, detail: impl fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

/// One aggregation tick: a result per registered check, in registration order
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregatedStatus(pub Vec<StatusAction>);

impl AggregatedStatus {
    /// the single failing result published when checks miss the deadline
    pub fn timed_out(deadline: std::time::Duration) -> Self {
        Self(vec![StatusAction::failed(
            TIMEOUT_CHECK_NAME,
            format!("execute all check timeout {}s", deadline.as_secs()),
        )])
    }

    /// true if every check passed. An empty tick is healthy.
    pub fn all_ok(&self) -> bool {
        self.0.iter().all(|s| s.ok)
    }

    /// the results that failed
    pub fn failures(&self) -> impl Iterator<Item = &StatusAction> {
        self.0.iter().filter(|s| !s.ok)
    }

    /// results in this tick
    pub fn results(&self) -> &[StatusAction] {
        &self.0
    }
}

/// A change of the cluster-wide resource availability flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityChange {
    /// number of nodes that marked the resource unavailable, `None` if the
    /// records could not be read (peers are then assumed available)
    pub disabled_nodes: Option<usize>,
    /// configured cluster size
    pub instances: usize,
    /// `disabled_nodes < instances`
    pub available: bool,
}

/// Everything published on the notification bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Notification {
    /// the result of an aggregation tick
    Status(AggregatedStatus),
    /// the cluster-wide power cache availability flipped
    Availability(AvailabilityChange),
}

impl Notification {
    /// filter for subscribers that only care about aggregation ticks
    pub fn is_status(&self) -> bool {
        matches!(self, Notification::Status(_))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn all_ok() {
        let status = AggregatedStatus(vec![StatusAction::ok("a"), StatusAction::ok("b")]);
        assert!(status.all_ok());
        assert_eq!(status.failures().count(), 0);

        let status = AggregatedStatus(vec![
            StatusAction::ok("a"),
            StatusAction::failed("b", "down"),
        ]);
        assert!(!status.all_ok());
        assert_eq!(status.failures().next().unwrap().name, "b");
    }

    #[test]
    fn timed_out_is_single_failure() {
        let status = AggregatedStatus::timed_out(Duration::from_secs(5));
        assert_eq!(status.results().len(), 1);
        assert!(!status.all_ok());
        assert_eq!(status.results()[0].name, TIMEOUT_CHECK_NAME);
        assert_eq!(
            status.results()[0].detail.as_deref(),
            Some("execute all check timeout 5s")
        );
    }

    #[test]
    fn notification_json() {
        let n = Notification::Availability(AvailabilityChange {
            disabled_nodes: Some(2),
            instances: 3,
            available: true,
        });
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["kind"], "availability");
        assert_eq!(json["data"]["disabled_nodes"], 2);
        assert!(!n.is_status());
        assert!(Notification::Status(AggregatedStatus::default()).is_status());
    }
}
