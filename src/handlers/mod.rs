//! Protocol handlers, one module per token family.

pub mod batch;
pub mod channel;
pub mod chathistory;
pub mod markread;
pub mod message;
pub mod metadata;
pub mod multiline;
pub mod nick;
pub mod redact;
pub mod registration;
pub mod rename;
pub mod sasl;
pub mod server;
pub mod setname;
pub mod user;
pub mod webpush;

use kestrel_p10::reply::{codes, StandardReply};

use crate::engine::Engine;
use crate::state::PendingKind;

/// Sweep the pending-request table; every expired entry gets a terminal
/// `TEMPORARILY_UNAVAILABLE` to its origin.
pub fn expire_pending(engine: &mut Engine, now: i64) {
    for request in engine.pending.expire(now) {
        let command = request.kind.command();
        let reply = match &request.kind {
            PendingKind::Metadata { target, key } => {
                StandardReply::fail(command, codes::TEMPORARILY_UNAVAILABLE, "Request timed out")
                    .with_context(target.clone())
                    .with_context(key.clone())
            }
            PendingKind::History { target, .. } => {
                StandardReply::fail(command, codes::TEMPORARILY_UNAVAILABLE, "Request timed out")
                    .with_context(target.clone())
            }
            PendingKind::Register { account } | PendingKind::Verify { account } => {
                StandardReply::fail(command, codes::TEMPORARILY_UNAVAILABLE, "Services unavailable")
                    .with_context(account.clone())
            }
            PendingKind::MarkRead { target } => {
                StandardReply::fail(command, codes::TEMPORARILY_UNAVAILABLE, "Request timed out")
                    .with_context(target.clone())
            }
            PendingKind::Sasl => {
                if let Some(session) = engine.clients.get_mut(&request.conn) {
                    session.sasl.abort();
                }
                StandardReply::fail(command, codes::TEMPORARILY_UNAVAILABLE, "SASL timed out")
            }
        };
        engine.send_reply(request.conn, &reply);
    }
}
