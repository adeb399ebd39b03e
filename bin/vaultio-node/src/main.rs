//! Vaultio Node - storage node daemon
//!
//! Boots one erasure set over the configured drives, serves the peer
//! lock protocol, and exposes a health endpoint. The S3 front-end is a
//! separate service consuming the object layer.
//!
//! The erasure self-test gates startup: a codec that cannot reproduce
//! its reference digests must never serve data.

use anyhow::Result;
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vaultio_common::{LockConfig, SetConfig};
use vaultio_disk::{Drive, LocalDrive};
use vaultio_lock::{lock_router, HttpLocker, LockServer, LockServerConfig, Locker};
use vaultio_object::ErasureSet;

#[derive(Parser, Debug)]
#[command(name = "vaultio-node")]
#[command(about = "Vaultio storage node daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/vaultio/node.toml")]
    config: String,

    /// Listen address for the lock/health service
    #[arg(short, long)]
    listen: Option<String>,

    /// Drive root directories for this node
    #[arg(long)]
    drives: Vec<String>,

    /// Peer lock endpoints (http://host:port), this node included
    #[arg(long)]
    peers: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    node: NodeConfig,
    #[serde(default)]
    set: Option<SetConfig>,
    #[serde(default)]
    lock: LockConfig,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default)]
    drives: Vec<String>,
    #[serde(default)]
    peers: Vec<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            drives: Vec::new(),
            peers: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9010".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    // CLI flags win over the config file.
    let listen = args.listen.unwrap_or(config.node.listen);
    let drives = if args.drives.is_empty() {
        config.node.drives
    } else {
        args.drives
    };
    let peers = if args.peers.is_empty() {
        config.node.peers
    } else {
        args.peers
    };
    let log_level = if args.log_level != "info" {
        args.log_level
    } else {
        config.node.log_level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting vaultio node");
    info!("Config file: {}", args.config);
    info!("Drives: {drives:?}");

    // Fatal gate: never serve with a codec that fails its reference
    // vectors.
    if let Err(e) = vaultio_erasure::self_test() {
        error!("{e}");
        std::process::exit(1);
    }
    info!("Erasure self-test passed");

    // Peer lock service backed by this node's table.
    let lock_server = LockServer::start(LockServerConfig { lock: config.lock });
    let local_locker = lock_server.locker();

    // Assemble the object layer when drives are configured; a node can
    // also run as a dedicated lock peer. The set stays alive for the
    // process lifetime; the front-end consumes it in-process.
    let mut object_layer: Option<ErasureSet> = None;
    if !drives.is_empty() {
        let set_config = match config.set {
            Some(cfg) => cfg,
            None => {
                let total = drives.len();
                SetConfig::new(total - total / 2, total / 2).unwrap_or_default()
            }
        };

        let mut drive_handles: Vec<Arc<dyn Drive>> = Vec::with_capacity(drives.len());
        for root in &drives {
            match LocalDrive::open(root).await {
                Ok(drive) => drive_handles.push(Arc::new(drive)),
                Err(e) => {
                    error!("Failed to open drive {root}: {e}");
                    std::process::exit(1);
                }
            }
        }

        let mut lockers: Vec<Arc<dyn Locker>> = Vec::new();
        if peers.is_empty() {
            lockers.push(local_locker.clone() as Arc<dyn Locker>);
        } else {
            for peer in &peers {
                match HttpLocker::new(peer.clone(), config.lock.call_timeout()) {
                    Ok(locker) => lockers.push(Arc::new(locker)),
                    Err(e) => {
                        error!("Failed to configure lock peer {peer}: {e}");
                        std::process::exit(1);
                    }
                }
            }
        }

        match ErasureSet::new(drive_handles, lockers, set_config, config.lock, listen.clone())
            .await
        {
            Ok(set) => {
                info!(
                    "Erasure set online: {} drives, EC {}:{}",
                    set.config().drive_count(),
                    set.config().data_blocks,
                    set.config().parity_blocks
                );
                object_layer = Some(set);
            }
            Err(e) => {
                error!("Failed to assemble erasure set: {e}");
                std::process::exit(1);
            }
        }
    } else {
        info!("No drives configured; running as a lock peer only");
    }

    let app = Router::new()
        .route("/health", get(health_handler))
        .merge(lock_router(local_locker));

    let addr: std::net::SocketAddr = listen.parse()?;
    info!("Serving lock/health on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    lock_server.stop();
    drop(object_layer);
    info!("Node shut down gracefully");
    Ok(())
}
