//! Pattern server binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pattern_core::cluster::build_coordination;
use pattern_core::{CatalogSource, Coordinator};
use pattern_server::{AppState, PatternService, ServerConfig, build_blob_stores, rpc_router, status_router};
use pattern_storage::{PatternStore, StoreCatalogSource};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Serves mined behavioral patterns for the projects this node owns
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// TOML file merged over the built-in defaults
    #[arg(short, long, env = "PATTERN_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// development, staging or production
    #[arg(long)]
    env: Option<String>,

    /// Address to bind and advertise
    #[arg(long)]
    ip: Option<String>,

    /// JSON-RPC port
    #[arg(long)]
    port: Option<u16>,

    /// Status port
    #[arg(long)]
    http_port: Option<u16>,

    /// Local disk tier directory
    #[arg(long)]
    disk_dir: Option<String>,

    /// Cloud bucket, or its local directory in development
    #[arg(long)]
    bucket: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(env) = &self.env {
            config.env.clone_from(env);
        }
        if let Some(ip) = &self.ip {
            config.ip.clone_from(ip);
        }
        if let Some(port) = self.port {
            config.rpc_port = port;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(dir) = &self.disk_dir {
            config.disk_dir.clone_from(dir);
        }
        if let Some(bucket) = &self.bucket {
            config.storage.bucket.clone_from(bucket);
        }
    }
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let level = match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let builder = FmtSubscriber::builder().with_max_level(level);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

async fn shutdown_signal(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    let env = config.validate().context("Invalid configuration")?;
    init_logging(&cli.log_level, !env.is_development())?;

    let rpc_addr = config.rpc_addr()?;
    let http_addr = config.http_addr()?;
    let advertise = config.advertise_addr();
    info!(env = %env, rpc = %rpc_addr, http = %http_addr, "starting pattern server");

    let (disk, cloud) = build_blob_stores(&config, env).context("Failed to build storage tiers")?;
    let catalogs: Arc<dyn CatalogSource> = Arc::new(StoreCatalogSource::new(Arc::clone(&disk), Arc::clone(&cloud)));
    let store = Arc::new(PatternStore::new(disk, cloud, &config.cache));

    let coordination = build_coordination(&config.cluster.coordination)
        .await
        .context("Failed to connect to the coordination service")?;
    let coordinator = Coordinator::start(coordination, catalogs, config.cluster.clone(), advertise)
        .await
        .context("Failed to join the cluster")?;
    let keep_alive = coordinator.spawn_keep_alive();
    let watcher = coordinator.spawn_watch();

    let service = Arc::new(PatternService::new(
        store,
        coordinator.handle(),
        config.index.clone(),
        config.index_cache_size,
    ));
    let state = AppState::new(service);

    let rpc_listener = TcpListener::bind(rpc_addr)
        .await
        .with_context(|| format!("Failed to bind rpc port {rpc_addr}"))?;
    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind status port {http_addr}"))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let rpc_server = axum::serve(rpc_listener, rpc_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal(stop_rx.clone()));
    let http_server = axum::serve(http_listener, status_router(state))
        .with_graceful_shutdown(shutdown_signal(stop_rx));
    let rpc_task = tokio::spawn(async move { rpc_server.await });
    let http_task = tokio::spawn(async move { http_server.await });
    info!(rpc = %rpc_addr, http = %http_addr, "pattern server ready");

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    stop_tx.send_replace(true);

    if let Err(err) = coordinator.shutdown().await {
        error!(error = %err, "failed to deregister from the cluster");
    }
    keep_alive.abort();
    watcher.abort();

    rpc_task.await?.context("rpc server failed")?;
    http_task.await?.context("status server failed")?;
    info!("pattern server stopped");
    Ok(())
}
