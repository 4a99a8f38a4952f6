//! `MR` - read markers.
//!
//! `S`/`G` travel toward services, `R` answers a get, and the bare
//! form is the services broadcast that fans a new marker out to every
//! session of the account. Stored timestamps are monotonically
//! non-decreasing per (account, target); stale sets answer with the
//! current value.

use tracing::debug;

use kestrel_p10::reply::{codes, StandardReply};
use kestrel_p10::{Capability, Frame, ServerNumeric, UserNumeric};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::state::{ConnId, LinkId, PendingKind};
use crate::store::ns;
use crate::tagging::{format_server_time, ClientMsg};

/// Dispatch entry for `MR`.
pub fn handle(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    match frame.param(0) {
        Some("S") | Some("G") => {
            // In transit toward services; we only forward.
            if !engine.send_to_services(frame.clone()) {
                debug!("markread request with no services peer dropped");
            }
            Ok(())
        }
        Some("R") => handle_reply(engine, frame),
        _ => handle_broadcast(engine, link, frame),
    }
}

/// `MR R <server> <user> <target> <ts>` - services answers a get.
fn handle_reply(engine: &mut Engine, frame: &Frame) -> HandlerResult {
    if frame.params.len() < 5 {
        return Err(HandlerError::NeedMoreParams);
    }
    let server: ServerNumeric = frame.params[1]
        .parse()
        .map_err(|e| HandlerError::InvalidParams(format!("bad server: {e}")))?;
    if server != engine.net.me {
        engine.send_to_server(server, frame);
        return Ok(());
    }
    let user: UserNumeric = frame.params[2]
        .parse()
        .map_err(|e| HandlerError::InvalidParams(format!("bad user: {e}")))?;
    let target = frame.params[3].clone();
    let ts_ms: i64 = frame.params[4]
        .parse()
        .map_err(|_| HandlerError::InvalidParams("bad timestamp".to_owned()))?;

    let Some(conn) = engine.net.users.get(&user).and_then(|u| u.conn) else {
        return Ok(());
    };
    let resolved = engine.pending.take_match(|r| {
        r.conn == conn && matches!(&r.kind, PendingKind::MarkRead { target: t } if *t == target)
    });
    if resolved.is_none() {
        debug!(target = %target, "late markread reply dropped");
        return Ok(());
    }

    // Refresh the cache with the authoritative value.
    if let Some(account) = engine.net.users.get(&user).and_then(|u| u.account().map(str::to_owned)) {
        store_marker(engine, &account, &target, ts_ms);
    }
    send_marker(engine, conn, &target, Some(ts_ms));
    Ok(())
}

/// Bare `MR <account> <target> <ts>` - services broadcast.
fn handle_broadcast(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    if frame.params.len() < 3 {
        return Err(HandlerError::NeedMoreParams);
    }
    let account = frame.params[0].clone();
    let target = frame.params[1].clone();
    let ts_ms: i64 = frame.params[2]
        .parse()
        .map_err(|_| HandlerError::InvalidParams("bad timestamp".to_owned()))?;

    let stored = stored_marker(engine, &account, &target);
    if stored.is_some_and(|s| ts_ms <= s) {
        // Already at or past this marker; nothing to fan out.
        return Ok(());
    }
    store_marker(engine, &account, &target, ts_ms);

    let conns: Vec<ConnId> = engine
        .net
        .account_conns(&account)
        .into_iter()
        .map(|(_, conn)| conn)
        .collect();
    for conn in conns {
        if engine.caps_of(conn).contains(Capability::ReadMarker) {
            send_marker(engine, conn, &target, Some(ts_ms));
        }
    }
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// Client `MARKREAD <target> timestamp=<ts>` - a set.
pub fn client_set(engine: &mut Engine, conn: ConnId, target: &str, ts_ms: i64) {
    let Some(account) = account_of(engine, conn) else {
        let reply = StandardReply::fail("MARKREAD", codes::NEED_MORE_PARAMS, "Not logged in")
            .with_context(target.to_owned());
        engine.send_reply(conn, &reply);
        return;
    };

    let stored = stored_marker(engine, &account, target);
    if stored.is_some_and(|s| ts_ms < s) {
        // Stale set: answer with the current value, change nothing.
        send_marker(engine, conn, target, stored);
        return;
    }
    store_marker(engine, &account, target, ts_ms);
    send_marker(engine, conn, target, Some(ts_ms));

    // Other sessions of the account hear it immediately; services keep
    // the authoritative copy.
    let conns: Vec<ConnId> = engine
        .net
        .account_conns(&account)
        .into_iter()
        .map(|(_, c)| c)
        .filter(|c| *c != conn)
        .collect();
    for other in conns {
        if engine.caps_of(other).contains(Capability::ReadMarker) {
            send_marker(engine, other, target, Some(ts_ms));
        }
    }

    let user = engine.clients.get(&conn).and_then(|s| s.user);
    if let Some(user) = user {
        let set = Frame::new("MR")
            .with_origin(engine.me_str())
            .with_param("S")
            .with_param(user.to_string())
            .with_param(target.to_owned())
            .with_param(ts_ms.to_string());
        if !engine.send_to_services(set) {
            debug!("markread set queued nowhere: services down");
        }
    }
}

/// Client `MARKREAD <target>` - a get.
pub fn client_get(engine: &mut Engine, conn: ConnId, target: &str) {
    let Some(account) = account_of(engine, conn) else {
        send_marker(engine, conn, target, None);
        return;
    };
    if let Some(ts) = stored_marker(engine, &account, target) {
        send_marker(engine, conn, target, Some(ts));
        return;
    }
    let Some(user) = engine.clients.get(&conn).and_then(|s| s.user) else {
        return;
    };
    if !engine.services.available() {
        send_marker(engine, conn, target, None);
        return;
    }
    let timeout = engine.config.metadata.services_timeout_secs as i64;
    let now = engine.now();
    engine.pending.create(
        conn,
        PendingKind::MarkRead {
            target: target.to_owned(),
        },
        now,
        timeout,
    );
    let get = Frame::new("MR")
        .with_origin(engine.me_str())
        .with_param("G")
        .with_param(user.to_string())
        .with_param(target.to_owned());
    engine.send_to_services(get);
}

fn account_of(engine: &Engine, conn: ConnId) -> Option<String> {
    engine
        .clients
        .get(&conn)
        .and_then(|s| s.user)
        .and_then(|u| engine.net.users.get(&u))
        .and_then(|u| u.account().map(str::to_owned))
}

fn stored_marker(engine: &Engine, account: &str, target: &str) -> Option<i64> {
    engine
        .kv
        .get(&ns::markread(account, target))
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
}

fn store_marker(engine: &mut Engine, account: &str, target: &str, ts_ms: i64) {
    if let Err(e) = engine
        .kv
        .put(&ns::markread(account, target), &ts_ms.to_string(), None)
    {
        debug!(error = %e, "markread store failed");
    }
}

fn send_marker(engine: &mut Engine, conn: ConnId, target: &str, ts_ms: Option<i64>) {
    let value = match ts_ms {
        Some(ts) => format!("timestamp={}", format_server_time(ts)),
        None => "*".to_owned(),
    };
    let msg = ClientMsg::new(engine.server_name(), "MARKREAD")
        .with_param(target.to_owned())
        .with_param(value);
    engine.send_labeled(conn, &msg);
}
