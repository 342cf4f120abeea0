#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result};

mod startup_health;

use arbiter_core::{
    Notification, PubSub,
    config::{
        cli::{self, Parser},
        trace,
    },
    tokio::{
        self,
        runtime::Builder,
        signal::{
            self,
            unix::{SignalKind, signal},
        },
    },
    tracing::*,
};
use config::ArbiterConfig;
use coordination::{
    CoordinationStore, EtcdClient, EtcdConfig, KeyLayout, LeaseManager, StepDownController,
};
use external_api::{Arbiter, ExternalApi, InterfaceResolver};
use health_check::{Aggregator, CheckContext, CheckRegistry};
use startup_health::{verify_startup_subsystems, wind_down};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    if config.support {
        for name in CheckRegistry::default().supported() {
            println!("{name}");
        }
        return Ok(());
    }
    let trace_config = trace::Config::parse(&config.arbiter_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start arbiter"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing arbiter config");
    let cfg = Arc::new(ArbiterConfig::parse(&config.config_path)?);
    let local_addr = cfg
        .local_addr()
        .context("failed to determine the local address")?;
    info!(%local_addr, interface = cfg.interface(), "using local address");
    let keys = KeyLayout::from(cfg.prefixes());

    info!(endpoints = ?cfg.etcd(), "connecting to etcd");
    let client = EtcdClient::connect(EtcdConfig::from_config(&cfg))
        .await
        .context("failed to connect to etcd")?;
    let store: Arc<dyn CoordinationStore> = Arc::new(client);

    let token = CancellationToken::new();
    let bus = PubSub::new();

    debug!("building health checks");
    let ctx = CheckContext::new(
        &cfg,
        local_addr,
        Arc::clone(&store),
        bus.clone(),
        token.clone(),
    );
    let checks = CheckRegistry::default().build(&ctx, cfg.checks())?;
    let aggregator = Aggregator::new(checks, bus.clone());
    let check_names = aggregator.names();

    let manager = Arc::new(LeaseManager::from_config(
        Arc::clone(&store),
        &cfg,
        local_addr,
        &keys,
    ));
    let controller = StepDownController::new(Arc::clone(&manager), bus.clone());

    // the configured interface answers with the address the entries are registered under
    let resolver = InterfaceResolver::new().pin(cfg.interface(), local_addr);
    let api = ExternalApi::new(
        config.external_api,
        Arc::clone(&cfg),
        Arbiter::new(Arc::clone(&store), keys, resolver, cfg.ttl()),
    );
    bus.subscribe(
        api.sender(),
        token.clone().cancelled_owned(),
        |_: &Notification| true,
    );
    let mut api_task = api.start();

    let mut controller_task = tokio::spawn(controller.run(token.clone()));
    let mut aggregator_task = tokio::spawn(aggregator.run(token.clone()));

    if let Err(err) =
        verify_startup_subsystems(&mut api_task, &mut controller_task, &mut aggregator_task).await
    {
        // every request is bounded by the ttl, unregister makes two of them
        wind_down(&token, &mut controller_task, cfg.ttl() * 3).await;
        aggregator_task.abort();
        api_task.abort();
        return Err(err);
    }
    info!(checks = ?check_names, vips = cfg.vips().len(), addr = %config.external_api, "vip arbiter serving");

    tokio::spawn(shutdown_signal(token.clone()));

    // returns once every entry was withdrawn
    if let Err(err) = controller_task.await {
        error!(?err, "step down controller failed");
    }
    if let Err(err) = aggregator_task.await {
        error!(?err, "aggregator failed");
    }
    for entry in manager.snapshots() {
        debug!(vip = %entry.vip, key = %entry.key, state = ?entry.state, residual = entry.residual, "entry at shutdown");
    }
    api_task.abort();
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(?err, "failed to listen for SIGTERM");
            return;
        }
    };
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = term.recv() => {}
    }
    info!("shutting down, withdrawing registry entries");
    token.cancel();
}
