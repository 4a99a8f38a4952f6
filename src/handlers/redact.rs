//! `RD` - message redaction.
//!
//! Authorization for local requests: the author within the configured
//! window, a channel operator on the target, or a network operator
//! (operator windows default to unbounded).

use tracing::debug;

use kestrel_p10::reply::{codes, StandardReply};
use kestrel_p10::{casefold, Capability, Frame, UserNumeric};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::history;
use crate::state::{ConnId, LinkId};
use crate::store::ns;
use crate::tagging::ClientMsg;

/// Dispatch entry for `RD`.
pub fn handle(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let origin = frame
        .origin
        .as_deref()
        .ok_or_else(|| HandlerError::InvalidParams("missing origin".to_owned()))?;
    let sender: UserNumeric = origin
        .parse()
        .map_err(|_| HandlerError::UnknownOrigin(origin.to_owned()))?;
    let target = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let msgid = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let reason = frame.trailing.clone().unwrap_or_default();

    // Remote servers already authorized their own users.
    let (sender_mask, sender_nick) = match engine.net.users.get(&sender) {
        Some(user) => (user.hostmask(), user.nick.clone()),
        None => return Err(HandlerError::UnknownOrigin(origin.to_owned())),
    };
    apply_redact(engine, &sender_mask, &sender_nick, &target, &msgid, &reason);
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// Remove the row and notify capable local clients.
pub fn apply_redact(
    engine: &mut Engine,
    sender_mask: &str,
    sender_nick: &str,
    target: &str,
    msgid: &str,
    reason: &str,
) {
    let storage = storage_target(sender_nick, target);
    if let Some(key) = find_row_key(engine, &storage, msgid) {
        if let Err(e) = engine.kv.delete(&key) {
            debug!(error = %e, "redact delete failed");
        }
    }

    let mut msg = ClientMsg::new(sender_mask.to_owned(), "REDACT")
        .with_param(target.to_owned())
        .with_param(msgid.to_owned());
    if !reason.is_empty() {
        msg = msg.with_trailing(reason.to_owned());
    }
    if target.starts_with('#') || target.starts_with('&') {
        engine.fanout_channel(
            &casefold(target),
            &msg,
            None,
            Some(Capability::MessageRedaction),
        );
    } else if let Some(conn) = engine.net.user_by_nick(target).and_then(|u| u.conn) {
        if engine.caps_of(conn).contains(Capability::MessageRedaction) {
            engine.send_msg(conn, &msg);
        }
    }
}

/// A local client's REDACT command.
pub fn client_request(
    engine: &mut Engine,
    conn: ConnId,
    sender: UserNumeric,
    target: &str,
    msgid: &str,
    reason: &str,
) {
    let sender_nick = match engine.net.users.get(&sender) {
        Some(user) => user.nick.clone(),
        None => return,
    };
    let storage = storage_target(&sender_nick, target);
    let rows = history::load(engine.kv.as_ref(), &storage);
    let Some(row) = rows.iter().find(|r| r.msgid == msgid) else {
        let reply = StandardReply::fail("REDACT", codes::UNKNOWN_MSGID, "Unknown message")
            .with_context(target.to_owned())
            .with_context(msgid.to_owned());
        engine.send_reply(conn, &reply);
        return;
    };

    let (sender_mask, is_oper) = match engine.net.users.get(&sender) {
        Some(user) => (user.hostmask(), user.modes.flags.oper),
        None => return,
    };
    let is_author = row.sender == sender_mask;
    let is_chanop = (target.starts_with('#') || target.starts_with('&'))
        && engine
            .net
            .channels
            .get(&casefold(target))
            .is_some_and(|c| c.is_op(sender));

    let now_ms = engine.now_ms();
    let age_secs = (now_ms - row.ts_ms) / 1000;
    let allowed = if is_oper {
        let window = engine.config.redact.oper_window_secs as i64;
        window == 0 || age_secs <= window
    } else if is_chanop {
        true
    } else if is_author {
        let window = engine.config.redact.window_secs as i64;
        if window != 0 && age_secs > window {
            let reply = StandardReply::fail(
                "REDACT",
                codes::REDACT_WINDOW_EXPIRED,
                "Too late to redact this message",
            )
            .with_context(target.to_owned())
            .with_context(msgid.to_owned());
            engine.send_reply(conn, &reply);
            return;
        }
        true
    } else {
        false
    };
    if !allowed {
        let reply = StandardReply::fail(
            "REDACT",
            codes::REDACT_FORBIDDEN,
            "You may not redact this message",
        )
        .with_context(target.to_owned())
        .with_context(msgid.to_owned());
        engine.send_reply(conn, &reply);
        return;
    }

    apply_redact(engine, &sender_mask, &sender_nick, target, msgid, reason);
    let frame = Frame::new("RD")
        .with_origin(sender.to_string())
        .with_param(target.to_owned())
        .with_param(msgid.to_owned())
        .with_trailing(reason.to_owned());
    engine.broadcast_frame(&frame, None);
}

fn storage_target(sender_nick: &str, target: &str) -> String {
    if target.starts_with('#') || target.starts_with('&') {
        casefold(target)
    } else {
        // DM redaction keys on the conversation pair.
        history::dm_target(sender_nick, target)
    }
}

fn find_row_key(engine: &Engine, storage: &str, msgid: &str) -> Option<String> {
    engine
        .kv
        .scan(&ns::hist_prefix(storage))
        .ok()?
        .into_iter()
        .find(|(key, _)| key.ends_with(&format!(":{msgid}")))
        .map(|(key, _)| key)
}
