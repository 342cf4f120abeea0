//! The store operations the arbiter depends on
use std::{fmt, future::Future, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{StoreError, StoreResult};

/// opaque lease handle issued by the store
pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// one renewal acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveEvent {
    pub lease: LeaseId,
    /// remaining ttl in seconds as reported by the store
    pub ttl: i64,
}

/// Renewal events for a single lease. The channel closes when the lease is
/// lost: revoked, expired, or the store stopped answering renewals. Dropping
/// the receiver stops renewing.
pub type KeepAliveStream = mpsc::Receiver<KeepAliveEvent>;

#[async_trait]
pub trait CoordinationStore: Send + Sync + fmt::Debug + 'static {
    /// grant a lease that expires after `ttl` unless renewed
    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// start renewing `lease` in the background
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream>;

    /// write `key`, optionally attached to `lease`
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()>;

    /// every key under `prefix`, ordered by key
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    /// revoke `lease`, deleting every key attached to it
    async fn revoke(&self, lease: LeaseId) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// create `key` only if it does not exist. Returns whether it was written.
    async fn put_if_absent(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// delete `key` only if it exists. Returns whether it was deleted.
    async fn delete_if_present(&self, key: &str) -> StoreResult<bool>;
}

/// Run a store operation with a deadline. An elapsed deadline is a
/// [`StoreError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Timeout(format!(
            "no response within {}ms",
            limit.as_millis()
        ))),
    }
}
