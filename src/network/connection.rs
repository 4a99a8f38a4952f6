//! Client connection plumbing: frame bytes into lines, shuttle them to
//! the engine, drain the write queue.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::debug;

use kestrel_p10::numeric::encode_ip;
use kestrel_p10::LineCodec;

use crate::engine::Event;

use super::{next_id, WRITE_QUEUE};

/// Drive one client connection until either side closes.
pub async fn serve_client<S>(
    stream: S,
    peer: SocketAddr,
    secure: bool,
    events: mpsc::Sender<Event>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn = next_id();
    let mut framed = Framed::new(stream, LineCodec::new());
    let (tx, mut rx) = mpsc::channel::<String>(WRITE_QUEUE);

    if events
        .send(Event::ClientConnected {
            conn,
            tx,
            host: peer.ip().to_string(),
            ip: encode_ip(peer.ip()),
            secure,
        })
        .await
        .is_err()
    {
        return;
    }

    let reason = loop {
        tokio::select! {
            inbound = framed.next() => match inbound {
                Some(Ok(line)) => {
                    if events.send(Event::ClientLine { conn, line }).await.is_err() {
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
                // The engine dropped the session handle.
                None => break "Connection closed".to_owned(),
            },
        }
    };

    debug!(conn, peer = %peer, reason = %reason, "client connection ended");
    let _ = events.send(Event::ClientClosed { conn, reason }).await;
}
