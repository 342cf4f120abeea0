//! etcd connection with connect retries and per-request deadlines.
//!
//! `etcd_client::Client` is cheap to clone and every call takes `&mut self`,
//! so each operation clones the handle instead of locking a shared one.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, PutOptions, Txn, TxnOp,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{StoreError, StoreResult},
    store::{CoordinationStore, KeepAliveEvent, KeepAliveStream, KeyValue, LeaseId, bounded},
};

/// Base delay for retrying the initial connection.
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for retry backoff during initial connect.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// gRPC http2 keep-alive ping interval and timeout
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// renewals are sent every ttl/3, but never more often than this
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(500);

const KEEP_ALIVE_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// connect timeout
    pub dial_timeout: Duration,
    /// deadline for every request
    pub request_timeout: Duration,
    /// connect attempts after the first one
    pub connect_retry_max: u32,
}

impl EtcdConfig {
    pub fn from_config(cfg: &config::ArbiterConfig) -> Self {
        Self {
            endpoints: cfg.etcd().to_vec(),
            dial_timeout: cfg.dial(),
            request_timeout: cfg.ttl(),
            connect_retry_max: 5,
        }
    }
}

#[derive(Clone)]
pub struct EtcdClient {
    client: Client,
    request_timeout: Duration,
}

impl fmt::Debug for EtcdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdClient")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

fn unavailable(err: etcd_client::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

impl EtcdClient {
    /// Connect to the cluster, retrying with exponential backoff.
    pub async fn connect(config: EtcdConfig) -> StoreResult<Self> {
        if config.endpoints.is_empty() {
            return Err(StoreError::Config("no etcd endpoints configured".into()));
        }
        info!(
            endpoints = ?config.endpoints,
            connect_retry_max = config.connect_retry_max,
            "connecting to etcd"
        );

        let total_attempts = config.connect_retry_max.saturating_add(1);
        for attempt in 0..total_attempts {
            let opts = ConnectOptions::new()
                .with_connect_timeout(config.dial_timeout)
                .with_timeout(config.request_timeout)
                .with_keep_alive(KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIMEOUT);

            match Client::connect(config.endpoints.clone(), Some(opts)).await {
                Ok(client) => {
                    info!(
                        attempt = attempt + 1,
                        total_attempts, "etcd connection established"
                    );
                    return Ok(Self {
                        client,
                        request_timeout: config.request_timeout,
                    });
                }
                Err(err) => {
                    let attempt_num = attempt + 1;
                    if attempt_num >= total_attempts {
                        error!(
                            attempts = total_attempts,
                            error = %err,
                            "etcd connection failed after all retry attempts"
                        );
                        return Err(StoreError::NotConnected(format!(
                            "etcd connection failed after {total_attempts} attempt(s): {err}"
                        )));
                    }

                    let delay = CONNECT_RETRY_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(MAX_CONNECT_RETRY_DELAY);
                    warn!(
                        attempt = attempt_num,
                        total_attempts,
                        retry_in_ms = delay.as_millis(),
                        error = %err,
                        "etcd connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        unreachable!("connect loop returns on success or terminal failure")
    }

}

/// Keys and values are decoded lossily. A record that is not utf-8 still
/// counts as present, and its value fails to parse as a priority.
fn decode(key: &[u8], value: &[u8]) -> KeyValue {
    let kv = KeyValue {
        key: String::from_utf8_lossy(key).into_owned(),
        value: String::from_utf8_lossy(value).into_owned(),
    };
    if std::str::from_utf8(key).is_err() || std::str::from_utf8(value).is_err() {
        debug!(key = %kv.key, value = %kv.value, "record is not valid utf-8");
    }
    kv
}

#[async_trait]
impl CoordinationStore for EtcdClient {
    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut client = self.client.clone();
        // etcd leases have second granularity, round up
        let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        let resp = bounded(self.request_timeout, async {
            client
                .lease_grant(secs as i64, None)
                .await
                .map_err(unavailable)
        })
        .await?;
        trace!(lease = resp.id(), ttl = resp.ttl(), "lease granted");
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = bounded(self.request_timeout, async {
            client.lease_keep_alive(lease).await.map_err(unavailable)
        })
        .await?;

        let (tx, rx) = mpsc::channel(KEEP_ALIVE_BUFFER);
        let request_timeout = self.request_timeout;
        tokio::spawn(async move {
            let mut every = MIN_RENEW_INTERVAL;
            loop {
                if let Err(err) = keeper.keep_alive().await {
                    debug!(lease, ?err, "failed to send lease renewal");
                    break;
                }
                match tokio::time::timeout(request_timeout, stream.message()).await {
                    Ok(Ok(Some(resp))) if resp.ttl() > 0 => {
                        every = (Duration::from_secs(resp.ttl() as u64) / 3).max(MIN_RENEW_INTERVAL);
                        let event = KeepAliveEvent {
                            lease,
                            ttl: resp.ttl(),
                        };
                        if let Err(TrySendError::Closed(_)) = tx.try_send(event) {
                            break;
                        }
                    }
                    Ok(Ok(Some(_))) => {
                        debug!(lease, "lease expired");
                        break;
                    }
                    Ok(Ok(None)) => {
                        debug!(lease, "keepalive stream ended");
                        break;
                    }
                    Ok(Err(err)) => {
                        debug!(lease, ?err, "keepalive stream failed");
                        break;
                    }
                    Err(_) => {
                        debug!(lease, "no keepalive response in time");
                        break;
                    }
                }
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(every) => {}
                }
            }
            // dropping `tx` here closes the stream for the lease owner
        });
        Ok(rx)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut client = self.client.clone();
        let opts = lease.map(|id| PutOptions::new().with_lease(id));
        bounded(self.request_timeout, async {
            client.put(key, value, opts).await.map_err(unavailable)
        })
        .await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let resp = bounded(self.request_timeout, async {
            client
                .get(prefix, Some(GetOptions::new().with_prefix()))
                .await
                .map_err(unavailable)
        })
        .await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| decode(kv.key(), kv.value()))
            .collect())
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut client = self.client.clone();
        bounded(self.request_timeout, async {
            client.lease_revoke(lease).await.map_err(|err| {
                if err.to_string().contains("lease not found") {
                    StoreError::LeaseNotFound(lease)
                } else {
                    unavailable(err)
                }
            })
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut client = self.client.clone();
        bounded(self.request_timeout, async {
            client.delete(key, None).await.map_err(unavailable)
        })
        .await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp = bounded(self.request_timeout, async {
            client.txn(txn).await.map_err(unavailable)
        })
        .await?;
        Ok(resp.succeeded())
    }

    async fn delete_if_present(&self, key: &str) -> StoreResult<bool> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Greater, 0)])
            .and_then(vec![TxnOp::delete(key, None)]);
        let resp = bounded(self.request_timeout, async {
            client.txn(txn).await.map_err(unavailable)
        })
        .await?;
        Ok(resp.succeeded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_without_endpoints_is_config_error() {
        let err = EtcdClient::connect(EtcdConfig {
            endpoints: vec![],
            dial_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
            connect_retry_max: 0,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
        assert!(!err.is_unavailable());
    }

    #[test]
    fn invalid_utf8_records_are_kept() {
        let kv = decode(b"/keepalived/10.0.0.100/10.0.0.9", b"\xff");
        assert_eq!(kv.key, "/keepalived/10.0.0.100/10.0.0.9");
        assert!(kv.value.trim().parse::<i64>().is_err());

        let kv = decode(b"/keepalived/10.0.0.100/\xfe", b"20");
        assert_eq!(kv.value, "20");
        assert!(kv.key.starts_with("/keepalived/10.0.0.100/"));
    }

    #[test]
    fn config_from_arbiter_config() {
        let cfg = config::ArbiterConfig::parse_str(
            r#"
interface: eth0
local_addr: 10.0.0.1
etcd: ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
dial: 7
ttl: 4
instances_count: 2
instances:
  - name: VI_1
    vips: [{vip: 10.0.0.100, priority: 50}]
"#,
        )
        .unwrap();
        let etcd = EtcdConfig::from_config(&cfg);
        assert_eq!(etcd.endpoints.len(), 2);
        assert_eq!(etcd.dial_timeout, Duration::from_secs(7));
        assert_eq!(etcd.request_timeout, Duration::from_secs(4));
    }
}
