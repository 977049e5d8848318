//! beacond: the Beacon daemon.
//!
//! One binary, three roles:
//! - `serve`: host the coordination and cache store over HTTP and sweep
//!   expired records in the background
//! - `register`: publish one service instance under a renewed lease
//! - `watch`: resolve a service and log every address-set change
//!
//! # Usage
//!
//! ```text
//! beacond serve --listen 0.0.0.0:2379 --data-dir /var/lib/beacon
//! beacond register --service user --address 10.0.0.1:50051
//! beacond watch --service user
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use beacon_api::RemoteStore;
use beacon_core::{BeaconConfig, ServiceAddress};
use beacon_discovery::{Registrar, RegistrarConfig, Resolver, ResolverConfig};
use beacon_state::{StateStore, Sweeper};

const DEFAULT_FILTER: &str = "info,beacond=debug,beacon=debug";

#[derive(Parser)]
#[command(name = "beacond", about = "Beacon service discovery daemon")]
struct Cli {
    /// Path to beacon.toml. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the store server and the expiry sweeper.
    Serve {
        /// Address to listen on (overrides `store.listen`).
        #[arg(long)]
        listen: Option<String>,

        /// Data directory for persistent state (overrides `store.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep all state in memory; nothing survives a restart.
        #[arg(long)]
        in_memory: bool,

        /// Sweep interval, e.g. `1s` (overrides `store.sweep_interval`).
        #[arg(long)]
        sweep_interval: Option<String>,
    },

    /// Register a service instance and keep it alive until Ctrl-C.
    Register {
        /// Service name, e.g. `user`.
        #[arg(long)]
        service: String,

        /// Instance address as `host:port`.
        #[arg(long)]
        address: String,

        /// Store server URL (overrides `store.endpoint`).
        #[arg(long)]
        endpoint: Option<String>,

        /// Lease TTL, e.g. `10s` (overrides `registrar.ttl`).
        #[arg(long)]
        ttl: Option<String>,
    },

    /// Resolve a service and log each address-set change until Ctrl-C.
    Watch {
        /// Service name, e.g. `user`.
        #[arg(long)]
        service: String,

        /// Store server URL (overrides `store.endpoint`).
        #[arg(long)]
        endpoint: Option<String>,

        /// Poll interval, e.g. `10s` (overrides `resolver.poll_interval`).
        #[arg(long)]
        poll_interval: Option<String>,

        /// Rely on polling only; do not subscribe to store changes.
        #[arg(long)]
        no_watch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve {
            listen,
            data_dir,
            in_memory,
            sweep_interval,
        } => {
            if let Some(listen) = listen {
                config.store.listen = listen;
            }
            if let Some(dir) = data_dir {
                config.store.data_dir = dir;
            }
            if let Some(interval) = sweep_interval {
                config.store.sweep_interval = interval;
            }
            config.validate()?;
            run_serve(config, in_memory).await
        }
        Command::Register {
            service,
            address,
            endpoint,
            ttl,
        } => {
            if let Some(endpoint) = endpoint {
                config.store.endpoint = endpoint;
            }
            if let Some(ttl) = ttl {
                config.registrar.ttl = ttl;
            }
            config.validate()?;
            let address: ServiceAddress = address
                .parse()
                .with_context(|| format!("invalid --address `{address}`"))?;
            run_register(config, service, address).await
        }
        Command::Watch {
            service,
            endpoint,
            poll_interval,
            no_watch,
        } => {
            if let Some(endpoint) = endpoint {
                config.store.endpoint = endpoint;
            }
            if let Some(interval) = poll_interval {
                config.resolver.poll_interval = interval;
            }
            if no_watch {
                config.resolver.watch = false;
            }
            config.validate()?;
            run_watch(config, service).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<BeaconConfig> {
    match path {
        Some(path) => {
            let config = BeaconConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(BeaconConfig::default()),
    }
}

fn remote_store(config: &BeaconConfig) -> anyhow::Result<RemoteStore> {
    let store = RemoteStore::new(&config.store.endpoint, config.store.request_timeout()?)
        .with_watch_timeout(config.store.watch_timeout()?);
    info!(endpoint = store.endpoint(), "using remote store");
    Ok(store)
}

async fn run_serve(config: BeaconConfig, in_memory: bool) -> anyhow::Result<()> {
    info!("Beacon daemon starting");

    let store = if in_memory {
        info!("state store running in memory");
        StateStore::open_in_memory()?
    } else {
        std::fs::create_dir_all(&config.store.data_dir).with_context(|| {
            format!("creating data dir {}", config.store.data_dir.display())
        })?;
        let db_path = config.store.data_dir.join("beacon.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        store
    };

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Expiry sweeper ─────────────────────────────────────────

    let sweeper = Sweeper::new(store.clone(), config.store.sweep_interval()?);
    let sweeper_handle = tokio::spawn(async move {
        sweeper.run(shutdown_rx).await;
    });

    // ── API server ─────────────────────────────────────────────

    let router = beacon_api::build_router(store, config.store.watch_timeout()?);
    let listener = tokio::net::TcpListener::bind(&config.store.listen)
        .await
        .with_context(|| format!("binding {}", config.store.listen))?;
    info!(addr = %listener.local_addr()?, "API server starting");

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = sweeper_handle.await;

    info!("Beacon daemon stopped");
    Ok(())
}

async fn run_register(
    config: BeaconConfig,
    service: String,
    address: ServiceAddress,
) -> anyhow::Result<()> {
    let store = Arc::new(remote_store(&config)?);
    let registrar = Registrar::new(store, RegistrarConfig::try_from(&config.registrar)?);

    let handle = registrar.start(&service, &address).await?;
    info!(key = handle.key(), lease = %handle.lease_id(), "registered, press Ctrl-C to deregister");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    handle.stop().await;
    info!(%service, %address, "deregistered");
    Ok(())
}

async fn run_watch(config: BeaconConfig, service: String) -> anyhow::Result<()> {
    let store = Arc::new(remote_store(&config)?);
    let resolver = Resolver::new(store, ResolverConfig::try_from(&config.resolver)?);

    let mut handle = resolver.watch(&service).await;
    let mut stream = handle.stream();

    loop {
        tokio::select! {
            update = stream.next() => match update {
                Some(Ok(set)) => info!(
                    %service,
                    count = set.len(),
                    endpoints = ?set.endpoints(),
                    "address set updated"
                ),
                Some(Err(e)) => warn!(%service, error = %e, "resolution degraded"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    handle.close().await;
    Ok(())
}
