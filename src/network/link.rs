//! Server-link transport: outbound connectors with reconnect, the
//! inbound S2S listener, and the shared line loop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use kestrel_p10::LineCodec;

use crate::config::LinkBlock;
use crate::engine::Event;

use super::{next_id, WRITE_QUEUE};

/// Drive one established server link.
pub async fn serve_link<S>(stream: S, outbound: Option<LinkBlock>, events: mpsc::Sender<Event>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let link = next_id();
    let mut framed = Framed::new(stream, LineCodec::new());
    let (tx, mut rx) = mpsc::channel::<String>(WRITE_QUEUE);

    if events
        .send(Event::LinkOpened { link, tx, outbound })
        .await
        .is_err()
    {
        return;
    }

    let reason = loop {
        tokio::select! {
            inbound = framed.next() => match inbound {
                Some(Ok(line)) => {
                    if events.send(Event::LinkLine { link, line }).await.is_err() {
                        break "Server shutting down".to_owned();
                    }
                }
                Some(Err(e)) => break format!("Protocol error: {e}"),
                None => break "Connection closed".to_owned(),
            },
            outbound = rx.recv() => match outbound {
                Some(line) => {
                    if let Err(e) = framed.send(line).await {
                        break format!("Write error: {e}");
                    }
                }
                None => break "Link dropped".to_owned(),
            },
        }
    };

    info!(link, reason = %reason, "server link ended");
    let _ = events.send(Event::LinkClosed { link, reason }).await;
}

/// Connect to a configured peer, reconnecting with bounded backoff for
/// autoconnect links.
pub fn spawn_outbound(events: mpsc::Sender<Event>, block: LinkBlock) {
    tokio::spawn(async move {
        let mut delay = Duration::from_secs(5);
        loop {
            info!(peer = %block.name, address = %block.address, "connecting to peer");
            match TcpStream::connect(&block.address).await {
                Ok(stream) => {
                    delay = Duration::from_secs(5);
                    if block.tls {
                        match tls_connect(stream, &block).await {
                            Ok(tls) => {
                                serve_link(tls, Some(block.clone()), events.clone()).await;
                            }
                            Err(e) => warn!(peer = %block.name, error = %e, "TLS link failed"),
                        }
                    } else {
                        serve_link(stream, Some(block.clone()), events.clone()).await;
                    }
                }
                Err(e) => {
                    warn!(peer = %block.name, error = %e, "connect failed");
                }
            }
            if !block.autoconnect {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(300));
        }
    });
}

async fn tls_connect(
    stream: TcpStream,
    block: &LinkBlock,
) -> anyhow::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let config = tokio_rustls::rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(block.name.clone())
        .map_err(|e| anyhow::anyhow!("bad server name: {e}"))?;
    Ok(connector.connect(name, stream).await?)
}

/// Accept the inbound S2S listener.
pub fn spawn_inbound_listener(
    events: mpsc::Sender<Event>,
    addr: String,
    tls: Option<tokio_rustls::TlsAcceptor>,
) {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(addr = %addr, error = %e, "cannot bind S2S listener");
                return;
            }
        };
        info!(addr = %addr, tls = tls.is_some(), "S2S listener up");
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                continue;
            };
            info!(peer = %peer, "inbound server connection");
            let events = events.clone();
            match &tls {
                Some(acceptor) => {
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve_link(tls_stream, None, events).await,
                            Err(e) => warn!(peer = %peer, error = %e, "S2S TLS accept failed"),
                        }
                    });
                }
                None => {
                    tokio::spawn(serve_link(stream, None, events));
                }
            }
        }
    });
}

/// Certificate verifier for links pinned by password rather than PKI.
/// Self-signed link certificates are the norm on private S2S meshes.
#[derive(Debug)]
struct AcceptAnyCert;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA512,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}
