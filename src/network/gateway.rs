//! The gateway: binds every configured client listener and hands
//! accepted connections to their transport loops.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::{Config, TlsConfig};
use crate::engine::Event;

use super::{connection, websocket};

/// Build a TLS acceptor from PEM material.
pub fn load_tls(tls: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(&tls.cert)?))
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("cannot read certificates: {e}"))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&tls.key)?))
        .map_err(|e| anyhow::anyhow!("cannot read private key: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", tls.key))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("bad TLS material: {e}"))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Bind every client listener and start accepting.
pub async fn start(config: &Config, events: mpsc::Sender<Event>) -> anyhow::Result<()> {
    let tls = match &config.tls {
        Some(tls) => Some(load_tls(tls)?),
        None => None,
    };

    for addr in &config.listen.client {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "client listener up");
        let events = events.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    continue;
                };
                tokio::spawn(connection::serve_client(stream, peer, false, events.clone()));
            }
        });
    }

    for addr in &config.listen.client_tls {
        let Some(acceptor) = tls.clone() else {
            warn!(addr = %addr, "TLS listener skipped: no [tls] section");
            continue;
        };
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "TLS client listener up");
        let events = events.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    continue;
                };
                let acceptor = acceptor.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            connection::serve_client(tls_stream, peer, true, events).await;
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "TLS accept failed"),
                    }
                });
            }
        });
    }

    if let Some(ws) = &config.websocket {
        let listener = TcpListener::bind(&ws.listen).await?;
        info!(addr = %ws.listen, "websocket listener up");
        let origins = ws.origins.clone();
        let events = events.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    continue;
                };
                tokio::spawn(websocket::serve_websocket(
                    stream,
                    peer,
                    origins.clone(),
                    false,
                    events.clone(),
                ));
            }
        });
    }

    Ok(())
}
