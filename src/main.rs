//! `aion`: a peer-to-peer distributed cron. No leader, no shared storage;
//! task ownership per firing is decided by consistent hashing over the
//! live membership view.
//!
//! Init order is fixed: config, then LTS open, then CS create, then gossip
//! create, then ring built from initial members, then CS.LoadAll, then HTTP
//! serve. Teardown runs the reverse: stop HTTP, drain the scheduler, then
//! announce a gossip leave, so peers don't have to wait out a full mdns
//! expiry to notice this node is gone.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use aion_gossip::GossipConfig;
use aion_manager::Manager;
use aion_ring::{NodeName, Ring, SharedRing};
use aion_scheduler::Scheduler;
use aion_store::Store;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// A peer-to-peer distributed cron.
#[derive(Parser, Debug)]
#[command(name = "aion", version, about)]
struct Cli {
    /// Path to the configuration file. Defaults to `$HOME/.aion.<ext>`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unused placeholder flag, carried over from the original CLI surface.
    #[arg(short, long)]
    toggle: bool,
}

#[derive(Debug, Deserialize)]
struct HttpSettings {
    interface: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct LocalSettings {
    gossip: u16,
    http: HttpSettings,
}

#[derive(Debug, Deserialize)]
struct DbSettings {
    file: String,
}

#[derive(Debug, Deserialize)]
struct AppConfig {
    db: DbSettings,
    local: LocalSettings,
    #[serde(default)]
    members: Vec<String>,
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut builder = config::Config::builder()
        .set_default("local.gossip", 7946)?
        .set_default("local.http.interface", "0.0.0.0")?
        .set_default("local.http.port", 8080)?
        .set_default("db.file", "aion.db")?;

    builder = match &cli.config {
        Some(path) => builder.add_source(config::File::from(path.clone())),
        None => {
            let home = std::env::var("HOME").context("HOME is not set")?;
            builder.add_source(
                config::File::with_name(&format!("{home}/.aion")).required(false),
            )
        }
    };

    let settings = builder
        .add_source(config::Environment::default().separator("."))
        .build()
        .context("failed to load configuration")?;

    settings
        .try_deserialize()
        .context("failed to parse configuration")
}

fn node_name() -> NodeName {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    NodeName::new(format!("{hostname}-{}", uuid::Uuid::new_v4()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let local_name = node_name();
    tracing::info!(node = %local_name, "starting aion");

    let store = Arc::new(Store::open(&config.db.file).context("failed to open local task store")?);

    let scheduler = Arc::new(
        Scheduler::start()
            .await
            .context("failed to start cron scheduler")?,
    );

    // Seed with just this node; the gossip layer rebuilds the full view
    // (including any configured bootstrap members) as soon as it identifies
    // its first peer, so firings are never stuck against a permanently
    // empty ring even before that first handshake completes.
    let ring = Arc::new(SharedRing::new(Ring::from_members([local_name.clone()])));

    let manager = Arc::new(Manager::new(
        store.clone(),
        scheduler.clone(),
        ring.clone(),
        local_name.clone(),
    ));

    manager
        .load_all()
        .await
        .context("a persisted task has an invalid cron definition")?;

    let gossip_config = GossipConfig {
        node_name: local_name.clone(),
        bind_port: config.local.gossip,
        bootstrap_members: config.members.clone(),
    };
    let (gossip_handle, gossip_events) = aion_gossip::spawn(
        gossip_config,
        Manager::snapshot_source(store.clone()),
    )
    .await
    .context("failed to start gossip transport")?;
    manager.attach_gossip(gossip_handle.clone());

    let ready = Arc::new(AtomicBool::new(false));

    let driver_manager = manager.clone();
    let gossip_driver = tokio::spawn(async move {
        driver_manager.drive_gossip_events(gossip_events).await;
    });

    ready.store(true, std::sync::atomic::Ordering::Relaxed);

    let interface: IpAddr = config
        .local
        .http
        .interface
        .parse()
        .context("local.http.interface is not a valid IP address")?;
    let addr = SocketAddr::new(interface, config.local.http.port);
    let router = aion_http::router(manager.clone(), ready);

    tracing::info!(%addr, "HTTP control plane listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP interface {addr}"))?;

    let shutdown = shutdown_signal();
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    tracing::info!("HTTP control plane stopped, shutting down");
    gossip_driver.abort();
    let _ = gossip_driver.await;

    drop(manager);
    match Arc::try_unwrap(scheduler) {
        Ok(scheduler) => scheduler.shutdown().await.context("scheduler shutdown failed")?,
        Err(_) => tracing::warn!("scheduler still referenced elsewhere, skipping graceful drain"),
    }

    gossip_handle.leave();

    tracing::info!("aion stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
