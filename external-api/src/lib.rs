//! # Decision & Healthcheck API
//!
//! This crate provides the http api keepalived asks before holding a VIP,
//! along with healthcheck, diagnostics, and metrics.
//! It exposes the following endpoints:
//!
//! /check
//! /health
//! /ping
//! /status
//! /config
//! /metrics
//! /metrics-text
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use arbiter_core::Notification;
use axum::{Router, extract::Extension, routing};
use config::ArbiterConfig;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, trace};

pub mod decision;

pub use crate::decision::{Arbiter, Decision, InterfaceResolver};
pub use crate::models::{Health, Latest, State};

/// requests taking longer than this are answered with 408
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiRunner drop called");
        self.task_handle.abort();
    }
}

/// Answers VIP decisions from the registry and reports the health
/// notifications it is sent over HTTP
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Notification>,
    rx: mpsc::Receiver<Notification>,
    addr: SocketAddr,
    state: State,
    latest: Latest,
    arbiter: Arc<Arbiter>,
    cfg: Arc<ArbiterConfig>,
}

impl ExternalApi {
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr, cfg: Arc<ArbiterConfig>, arbiter: Arbiter) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        Self {
            tx,
            rx,
            addr,
            state: models::blank_health(),
            latest: Latest::default(),
            arbiter: Arc::new(arbiter),
            cfg,
        }
    }

    /// clone the notification sender, subscribe it to the bus
    pub fn sender(&self) -> mpsc::Sender<Notification> {
        self.tx.clone()
    }

    /// Listen to notifications over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(notification) = self.rx.recv().await {
            models::apply(&self.state, &self.latest, notification);
        }
        info!("listen status exited-- nothing listening");
        Ok(())
    }

    /// serve the HTTP external api
    async fn run(
        addr: SocketAddr,
        state: State,
        latest: Latest,
        arbiter: Arc<Arbiter>,
        cfg: Arc<ArbiterConfig>,
    ) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = router(state, latest, arbiter, cfg);

        tracing::debug!("external API listening on {}", addr);

        axum::serve(tcp, app).await?;
        bail!("external API returned-- should not happen")
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self) -> JoinHandle<()> {
        let state = self.state.clone();
        let latest = self.latest.clone();
        let arbiter = self.arbiter.clone();
        let addr = self.addr;
        let cfg = self.cfg.clone();
        // if tx is not cloned, listen_status will never update since ExternalApi is owner

        tokio::spawn(async move {
            if let Err(err) = tokio::try_join!(
                ExternalApi::run(addr, state, latest, arbiter, cfg),
                self.listen_status()
            ) {
                error!(?err, "external api task returning, this should not happen")
            }
        })
    }

    /// Start the `ExternalApiRunner`
    pub fn serve(self) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(),
        }
    }
}

/// Build the routes:
/// /check
/// /health
/// /ping
/// /status
/// /config
/// /metrics
/// /metrics-text
pub fn router(state: State, latest: Latest, arbiter: Arc<Arbiter>, cfg: Arc<ArbiterConfig>) -> Router {
    Router::new()
        .route("/check", routing::get(handlers::check))
        .route("/health", routing::get(handlers::ok))
        .route("/ping", routing::get(handlers::ping))
        .route("/status", routing::get(handlers::status))
        .route("/config", routing::get(handlers::config))
        .route("/metrics", routing::get(handlers::metrics))
        .route("/metrics-text", routing::get(handlers::metrics_text))
        .layer(Extension(state))
        .layer(Extension(latest))
        .layer(Extension(arbiter))
        .layer(Extension(cfg))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
}

mod handlers {

    use std::{sync::Arc, time::Instant};

    use anyhow::Context;
    use arbiter_core::metrics::{CHECK_REQUEST_DURATION, START_TIME, UPTIME};
    use axum::{
        Json,
        body::Body,
        extract::Extension,
        http::{HeaderMap, Response, StatusCode, header},
        response::IntoResponse,
    };
    use config::ArbiterConfig;
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;

    use crate::{
        decision::{Arbiter, LOCAL_HEADER, VIP_HEADER},
        models::{Health, Latest, ServerResult, State, StatusReport},
    };

    fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub(crate) async fn check(
        Extension(arbiter): Extension<Arc<Arbiter>>,
        headers: HeaderMap,
    ) -> StatusCode {
        let start = Instant::now();
        let code = arbiter
            .decide(header(&headers, LOCAL_HEADER), header(&headers, VIP_HEADER))
            .await
            .status();
        CHECK_REQUEST_DURATION
            .with_label_values(&[code.as_str(), "GET"])
            .observe(start.elapsed().as_secs_f64());
        code
    }

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn status(
        Extension(state): Extension<State>,
        Extension(latest): Extension<Latest>,
    ) -> ServerResult<impl IntoResponse> {
        let health = *state.lock();
        let latest = latest.lock().clone();
        Ok(Json(StatusReport {
            health,
            checks: latest.status,
            availability: latest.availability,
        }))
    }

    pub(crate) async fn config(
        Extension(cfg): Extension<Arc<ArbiterConfig>>,
    ) -> ServerResult<impl IntoResponse> {
        // the validated config drops defaults and comments, show the file
        let path = cfg.path().context("no path specified for config")?;
        let cfg = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to find config at {}", path.display()))?;
        Ok(([(header::CONTENT_TYPE, "application/yaml")], cfg))
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use arbiter_core::{AggregatedStatus, AvailabilityChange, Notification};
    use axum::response::IntoResponse;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};
    use tracing::{info, warn};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// the last notifications received
    pub type Latest = Arc<Mutex<Snapshot>>;

    #[derive(Debug, Clone, Default)]
    pub struct Snapshot {
        pub status: Option<AggregatedStatus>,
        pub availability: Option<AvailabilityChange>,
    }

    /// body of `/status`
    #[derive(Debug, Serialize)]
    pub struct StatusReport {
        pub health: Health,
        pub checks: Option<AggregatedStatus>,
        pub availability: Option<AvailabilityChange>,
    }

    /// fold one bus notification into the served state
    pub(crate) fn apply(state: &State, latest: &Latest, notification: Notification) {
        match notification {
            Notification::Status(status) => {
                let health = if status.all_ok() {
                    Health::Good
                } else {
                    Health::Bad
                };
                {
                    let mut guard = state.lock();
                    if *guard != health {
                        info!(%health, "health changed");
                        *guard = health;
                    }
                }
                latest.lock().status = Some(status);
            }
            Notification::Availability(change) => {
                if change.available {
                    info!(disabled_nodes = ?change.disabled_nodes, "cluster power cache available");
                } else {
                    warn!(disabled_nodes = ?change.disabled_nodes, "cluster power cache unavailable");
                }
                latest.lock().availability = Some(change);
            }
        }
    }

    // error type
    /// Make our own error that wraps `anyhow::Error`.
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use arbiter_core::{AggregatedStatus, AvailabilityChange, StatusAction};
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use coordination::{CoordinationStore, KeyLayout, memory::MemoryStore};
    use tower::ServiceExt;

    use super::*;

    const VIP: &str = "10.0.0.100";

    fn node_x() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    fn node_y() -> IpAddr {
        "10.0.0.2".parse().unwrap()
    }

    fn cfg() -> Arc<ArbiterConfig> {
        Arc::new(
            ArbiterConfig::parse_str(
                r#"
interface: eth0
local_addr: 10.0.0.1
etcd: ["http://127.0.0.1:2379"]
instances_count: 2
instances:
  - name: VI_1
    vips:
      - {vip: 10.0.0.100, priority: 10}
"#,
            )
            .unwrap(),
        )
    }

    struct Harness {
        app: Router,
        state: State,
        latest: Latest,
    }

    fn harness(store: Arc<MemoryStore>) -> Harness {
        let resolver = InterfaceResolver::new()
            .pin("ethX", node_x())
            .pin("ethY", node_y());
        let arbiter = Arbiter::new(
            store,
            KeyLayout::default(),
            resolver,
            Duration::from_secs(1),
        );
        let state = models::blank_health();
        let latest = Latest::default();
        let app = router(state.clone(), latest.clone(), Arc::new(arbiter), cfg());
        Harness { app, state, latest }
    }

    async fn register(store: &MemoryStore, addr: IpAddr, priority: &str) {
        store
            .put(&KeyLayout::default().presence_key(VIP, addr), priority, None)
            .await
            .unwrap();
    }

    async fn check(app: &Router, local: Option<&str>, vip: Option<&str>) -> StatusCode {
        let mut req = Request::builder().uri("/check");
        if let Some(local) = local {
            req = req.header("Local", local);
        }
        if let Some(vip) = vip {
            req = req.header("Vip", vip);
        }
        app.clone()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn highest_priority_node_holds_the_vip() {
        let store = Arc::new(MemoryStore::new());
        register(&store, node_x(), "10").await;
        register(&store, node_y(), "20").await;
        let h = harness(store);

        assert_eq!(check(&h.app, Some("ethX"), Some(VIP)).await, StatusCode::FORBIDDEN);
        assert_eq!(check(&h.app, Some("ethY"), Some(VIP)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn unregistered_node_is_denied() {
        let store = Arc::new(MemoryStore::new());
        register(&store, node_y(), "20").await;
        let h = harness(store);
        assert_eq!(check(&h.app, Some("ethX"), Some(VIP)).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn empty_registry_is_a_server_error() {
        let h = harness(Arc::new(MemoryStore::new()));
        assert_eq!(
            check(&h.app, Some("ethX"), Some(VIP)).await,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn store_outage_is_a_server_error() {
        let store = Arc::new(MemoryStore::new());
        register(&store, node_x(), "10").await;
        store.set_available(false);
        let h = harness(store);
        assert_eq!(
            check(&h.app, Some("ethX"), Some(VIP)).await,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn missing_headers_never_reach_the_store() {
        let store = Arc::new(MemoryStore::new());
        register(&store, node_x(), "10").await;
        // a query would answer 500
        store.set_available(false);
        let h = harness(store);

        assert_eq!(check(&h.app, Some("ethX"), None).await, StatusCode::BAD_REQUEST);
        assert_eq!(check(&h.app, None, Some(VIP)).await, StatusCode::BAD_REQUEST);
        assert_eq!(check(&h.app, None, None).await, StatusCode::BAD_REQUEST);
        assert_eq!(check(&h.app, Some(" "), Some(VIP)).await, StatusCode::BAD_REQUEST);
        assert_eq!(
            check(&h.app, Some("does-not-exist0"), Some(VIP)).await,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn health_follows_aggregated_status() {
        let h = harness(Arc::new(MemoryStore::new()));
        assert_eq!(get(&h.app, "/health").await.0, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(get(&h.app, "/ping").await.0, StatusCode::OK);

        models::apply(
            &h.state,
            &h.latest,
            Notification::Status(AggregatedStatus(vec![StatusAction::ok("keepalived")])),
        );
        assert_eq!(get(&h.app, "/health").await.0, StatusCode::OK);

        models::apply(
            &h.state,
            &h.latest,
            Notification::Status(AggregatedStatus(vec![
                StatusAction::ok("keepalived"),
                StatusAction::failed("nfs", "has no nfsd process"),
            ])),
        );
        assert_eq!(get(&h.app, "/health").await.0, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn status_reports_latest_notifications() {
        let h = harness(Arc::new(MemoryStore::new()));
        models::apply(
            &h.state,
            &h.latest,
            Notification::Status(AggregatedStatus(vec![StatusAction::failed(
                "nas",
                "connection refused",
            )])),
        );
        models::apply(
            &h.state,
            &h.latest,
            Notification::Availability(AvailabilityChange {
                disabled_nodes: Some(2),
                instances: 2,
                available: false,
            }),
        );

        let (code, body) = get(&h.app, "/status").await;
        assert_eq!(code, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["health"], "BAD");
        assert_eq!(json["checks"][0]["name"], "nas");
        assert_eq!(json["checks"][0]["detail"], "connection refused");
        assert_eq!(json["availability"]["available"], false);
        assert_eq!(json["availability"]["disabled_nodes"], 2);
    }

    #[tokio::test]
    async fn config_without_a_file_is_an_error() {
        let h = harness(Arc::new(MemoryStore::new()));
        assert_eq!(
            get(&h.app, "/config").await.0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn metrics_text_includes_check_requests() {
        let h = harness(Arc::new(MemoryStore::new()));
        check(&h.app, None, None).await;
        let (code, body) = get(&h.app, "/metrics-text").await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.contains("check_requests"), "{body}");
    }

    #[tokio::test]
    async fn notifications_sent_to_the_api_update_health() {
        let api = ExternalApi::new(
            "127.0.0.1:0".parse().unwrap(),
            cfg(),
            Arbiter::new(
                Arc::new(MemoryStore::new()),
                KeyLayout::default(),
                InterfaceResolver::new(),
                Duration::from_secs(1),
            ),
        );
        let state = api.state.clone();
        let tx = api.sender();
        let _guard = api.serve();

        tx.send(Notification::Status(AggregatedStatus::default()))
            .await
            .unwrap();
        for _ in 0..100 {
            if *state.lock() == Health::Good {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*state.lock(), Health::Good);
    }
}
