//! WebSocket client transport (RFC 6455).
//!
//! The handshake validates the `Origin` header against configuration;
//! tungstenite reassembles fragmented messages and surfaces control
//! frames, so a PING is answered without disturbing an in-flight
//! fragment sequence.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use kestrel_p10::numeric::encode_ip;

use crate::engine::Event;

use super::{next_id, WRITE_QUEUE};

/// Accept and drive one WebSocket client.
pub async fn serve_websocket(
    stream: TcpStream,
    peer: SocketAddr,
    origins: Vec<String>,
    secure: bool,
    events: mpsc::Sender<Event>,
) {
    let origin_check = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if origins.is_empty() {
            return Ok(response);
        }
        let origin = request
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if origins.iter().any(|allowed| allowed == origin) {
            Ok(response)
        } else {
            warn!(peer = %peer, origin = %origin, "websocket origin rejected");
            Err(ErrorResponse::new(Some("Origin not allowed".to_owned())))
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, origin_check).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    info!(peer = %peer, "websocket client accepted");

    let conn = next_id();
    let (mut sink, mut source) = ws.split();
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
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    // One IRC line per message; tolerate trailing CRLF.
                    let line = text.trim_end_matches(['\r', '\n']).to_owned();
                    if events.send(Event::ClientLine { conn, line }).await.is_err() {
                        break "Server shutting down".to_owned();
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    match String::from_utf8(bytes) {
                        Ok(text) => {
                            let line = text.trim_end_matches(['\r', '\n']).to_owned();
                            if events.send(Event::ClientLine { conn, line }).await.is_err() {
                                break "Server shutting down".to_owned();
                            }
                        }
                        Err(_) => break "Malformed UTF-8".to_owned(),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break "Write error".to_owned();
                    }
                }
                Some(Ok(Message::Close(_))) | None => break "Connection closed".to_owned(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("WebSocket error: {e}"),
            },
            outbound = rx.recv() => match outbound {
                Some(line) => {
                    if sink.send(Message::Text(line)).await.is_err() {
                        break "Write error".to_owned();
                    }
                }
                None => break "Connection closed".to_owned(),
            },
        }
    };

    debug!(conn, reason = %reason, "websocket connection ended");
    let _ = events.send(Event::ClientClosed { conn, reason }).await;
}
