//! kestreld - Kestrel IRC Daemon
//!
//! A federated IRC server speaking the P10 server-to-server protocol
//! with an IRCv3.2+ client capability engine.

mod client;
mod config;
mod engine;
mod error;
mod handlers;
mod history;
mod network;
mod services;
mod state;
mod store;
mod tagging;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::Config;
use crate::engine::{Engine, Event};
use crate::store::{Kv, MemoryStore, RedbStore};

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path, falling
/// back to `config.toml`.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);
    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {flag}");
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "config.toml".to_string(),
    };
    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path();
    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: Failed to load config from {config_path}: {e}");
        e
    })?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.server.log_format {
        config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    info!(
        server = %config.server.name,
        network = %config.server.network,
        numeric = %config.server.numeric,
        "Starting kestreld"
    );

    // Persistent KV store for history, metadata, read markers and push
    // subscriptions.
    let kv: Arc<dyn Kv> = match config.history.store.as_str() {
        "redb" => {
            info!(path = %config.history.path, "Opening redb store");
            Arc::new(RedbStore::open(&config.history.path)?)
        }
        _ => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let (events_tx, events_rx) = mpsc::channel::<Event>(4096);
    let engine = Engine::new(config.clone(), kv, events_tx.clone())?;
    info!("Engine initialized");

    // Housekeeping tick.
    {
        let events = events_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if events.send(Event::Tick).await.is_err() {
                    break;
                }
            }
        });
    }

    // Client listeners (TCP, TLS, WebSocket).
    network::gateway::start(&config, events_tx.clone()).await?;

    // Inbound S2S listener.
    if let Some(addr) = config.s2s.listen.clone() {
        let tls = match &config.tls {
            Some(tls) => Some(network::gateway::load_tls(tls)?),
            None => None,
        };
        network::link::spawn_inbound_listener(events_tx.clone(), addr, tls);
    }

    // Outbound links.
    for link in &config.links {
        if link.autoconnect {
            network::link::spawn_outbound(events_tx.clone(), link.clone());
        }
    }

    // Drive the engine until shutdown.
    tokio::select! {
        _ = engine.run(events_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT - shutting down");
        }
    }

    // Give connection tasks a moment to flush.
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    Ok(())
}
