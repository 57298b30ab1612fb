#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result};

mod health;
mod startup;

use config::NetworkConfig;
use discovery::ArpDiscovery;
use gatekeeper_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    tokio::{self, runtime::Builder, signal, task::JoinHandle},
    tracing::*,
    Register, Server,
};
use health::{verify_background_task_running, verify_server_task_running};
use ip_manager::Allocator;
use leases::Leases;
use message_type::MsgType;
use registry::{DeviceRegistry, MemoryStore, SqliteStore, Storage, SubnetPolicy};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.gatekeeper_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start server"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing network config");
    let cfg = Arc::new(NetworkConfig::parse(&config.config_path)?);
    info!(
        ungated = %cfg.ungated(),
        gated = %cfg.gated(),
        default_policy = %cfg.default_policy(),
        "subnets configured"
    );

    if config.in_memory() {
        warn!("records are kept in memory only and will be lost on exit");
        run(config, cfg, MemoryStore::new()).await
    } else {
        info!(database_url = ?config.database_url, "using record store at path");
        let store = SqliteStore::new(&config.database_url)
            .await
            .context("failed to open record store")?;
        run(config, cfg, store).await
    }
}

async fn run<S: Storage>(config: cli::Config, cfg: Arc<NetworkConfig>, store: S) -> Result<()> {
    let store = Arc::new(store);
    let deadline = config.registry_timeout();
    let registry = Arc::new(DeviceRegistry::new(Arc::clone(&store), deadline));
    let policy = Arc::new(SubnetPolicy::new(Arc::clone(&store), deadline, &cfg));
    let allocator = Arc::new(Allocator::new(
        Arc::clone(&registry),
        cfg.subnets(),
        cfg.pool(),
        cfg.lease_time(),
    ));

    let pinned =
        startup::bootstrap_infrastructure(&cfg, &registry, &ArpDiscovery::default()).await?;
    debug!(?pinned, "infrastructure bootstrap done");

    let devices = registry.all().await.context("failed to list stored devices")?;
    startup::set_device_gauges(&devices, cfg.gated());
    let loaded = allocator
        .load(devices)
        .await
        .context("stored devices do not fit the configured subnets")?;
    info!(loaded, pool = ?cfg.pool(), "address tables loaded");

    let token = CancellationToken::new();
    let mut event_logger = startup::spawn_event_logger(&registry, cfg.gated(), token.clone());

    debug!("starting v4 server");
    let mut v4 = Server::new(config.clone(), cfg.interfaces().to_owned())?;
    debug!("starting v4 plugins");
    MsgType::new(Arc::clone(&cfg))?.register(&mut v4);
    Leases::new(Arc::clone(&cfg), registry, policy, allocator).register(&mut v4);

    let mut v4_task = tokio::spawn(v4.start(shutdown_signal(token.clone())));

    if let Err(err) = verify_server_task_running("dhcpv4 server", &mut v4_task).await {
        token.cancel();
        return Err(err);
    }
    if let Err(err) = verify_background_task_running("device event logger", &mut event_logger).await
    {
        token.cancel();
        return Err(err);
    }
    info!("gatekeeper started");

    let server_result = flatten(v4_task).await;
    token.cancel();
    if let Err(err) = event_logger.await {
        error!(?err, "error waiting for device event logger");
    }
    server_result
}

async fn flatten<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(err).context("handling failed"),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = tokio::select! {
        res = signal::ctrl_c() => res.map_err(|err| err.into()),
        _ = token.cancelled() => Ok(()),
    };
    token.cancel();
    ret
}
