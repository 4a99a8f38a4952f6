//! Transports: client listeners (TCP, TLS, WebSocket) and server
//! links. Connection tasks only frame bytes; every decision happens on
//! the engine task.

pub mod connection;
pub mod gateway;
pub mod link;
pub mod websocket;

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection/link id.
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Outbound write-queue depth per connection; overflow kills the
/// connection.
pub const WRITE_QUEUE: usize = 512;
