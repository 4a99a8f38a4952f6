//! `MD`/`MDQ` - metadata set, clear and query.
//!
//! Services hold the authoritative store; this side keeps the TTL
//! cache, persists through the KV, and relays queries. Values flagged
//! `Z` are compressed pass-through: stored exactly as received and
//! decompressed only when a client reads them.

use tracing::{debug, warn};

use kestrel_p10::reply::{codes, StandardReply};
use kestrel_p10::{casefold, Capability, Frame, UserNumeric};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::services::metadata::{maybe_compress, MetaEntry, Visibility};
use crate::state::{ConnId, LinkId, PendingKind};
use crate::store::ns;
use crate::tagging::ClientMsg;

/// Build an `MD` set frame for a cached entry.
pub fn md_frame(me: &str, target: &str, key: &str, entry: &MetaEntry) -> Frame {
    let mut frame = Frame::new("MD")
        .with_origin(me.to_owned())
        .with_param(target.to_owned())
        .with_param(key.to_owned())
        .with_param(entry.visibility.wire());
    if entry.compressed {
        frame = frame.with_param("Z");
    }
    frame.with_trailing(entry.value.clone())
}

/// `MD <target> <key> <vis> [Z] :<value>` sets; `MD <target> <key>`
/// clears.
pub fn handle_md(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let target = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let key = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();

    if frame.params.len() == 2 && frame.trailing.is_none() {
        apply_clear(engine, &target, &key);
        engine.broadcast_frame(frame, Some(link));
        return Ok(());
    }

    let vis = frame
        .param(2)
        .and_then(Visibility::parse)
        .ok_or_else(|| HandlerError::InvalidParams("bad visibility".to_owned()))?;
    let compressed = frame.param(3) == Some("Z");
    let value = frame.trailing.clone().ok_or(HandlerError::NeedMoreParams)?;

    let entry = MetaEntry {
        value,
        visibility: vis,
        compressed,
        stored_at: engine.now(),
    };

    // An answer to an outstanding query resumes the waiting client.
    let pending = engine.pending.take_match(|r| {
        matches!(&r.kind, PendingKind::Metadata { target: t, key: k }
            if casefold(t) == casefold(&target) && (*k == key || k == "*"))
    });
    if let Some(request) = pending {
        reply_value(engine, request.conn, &target, &key, &entry);
    }

    apply_set(engine, &target, &key, entry);
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// `MDQ <target> <key|*>` - someone wants the authoritative value; we
/// answer from cache or pass it along to services.
pub fn handle_mdq(engine: &mut Engine, _link: LinkId, frame: &Frame) -> HandlerResult {
    let origin = super::server::origin_server(engine, frame)?;
    let target = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let key = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();

    let now = engine.now();
    if key != "*" {
        if let Some(entry) = engine.metadata.get(&target, &key, now).cloned() {
            let reply = md_frame(&engine.me_str(), &target, &key, &entry);
            engine.send_to_server(origin, &reply);
            return Ok(());
        }
    }
    if !engine.send_to_services(frame.clone()) {
        debug!(target = %target, key = %key, "metadata query with no services peer");
    }
    Ok(())
}

/// Store a set locally and notify watching clients.
pub fn apply_set(engine: &mut Engine, target: &str, key: &str, entry: MetaEntry) {
    let changed = engine.metadata.insert(target, key, entry.clone());
    if let Err(e) = engine.kv.put(&ns::meta(target, key), &entry.encode(), None) {
        warn!(error = %e, "metadata persist failed");
    }
    if !changed {
        // Idempotent rewrite: one observable broadcast on first write.
        return;
    }
    notify_watchers(engine, target, key, Some(&entry));
}

/// Clear locally and notify.
pub fn apply_clear(engine: &mut Engine, target: &str, key: &str) {
    let removed = engine.metadata.clear(target, key);
    let _ = engine.kv.delete(&ns::meta(target, key));
    if removed {
        notify_watchers(engine, target, key, None);
    }
}

/// Deliver a `METADATA` change notification to clients that can see
/// the target: channel members for channels, the user and those
/// sharing a channel otherwise. Private values reach the owner only.
fn notify_watchers(engine: &mut Engine, target: &str, key: &str, entry: Option<&MetaEntry>) {
    let value = match entry {
        Some(e) => match e.plaintext() {
            Ok(v) => Some(v),
            Err(err) => {
                warn!(error = %err, target = %target, key = %key, "undecodable metadata value");
                return;
            }
        },
        None => None,
    };
    let vis = entry.map(|e| e.visibility).unwrap_or(Visibility::Public);

    let mut msg = ClientMsg::new(engine.server_name(), "METADATA")
        .with_param(target.to_owned())
        .with_param(key.to_owned())
        .with_param(vis.wire());
    if let Some(value) = value {
        msg = msg.with_trailing(value);
    }

    if target.starts_with('#') || target.starts_with('&') {
        let conns: Vec<(UserNumeric, ConnId)> = engine.net.local_members(&casefold(target));
        for (member, conn) in conns {
            if !engine.caps_of(conn).contains(Capability::Metadata2) {
                continue;
            }
            if vis == Visibility::Private {
                let privileged = engine
                    .net
                    .channels
                    .get(&casefold(target))
                    .is_some_and(|c| c.is_op(member));
                if !privileged {
                    continue;
                }
            }
            engine.send_msg(conn, &msg);
        }
    } else if let Some(user) = engine.net.user_by_nick(target) {
        let numeric = user.numeric;
        if let Some(conn) = user.conn {
            if engine.caps_of(conn).contains(Capability::Metadata2) {
                engine.send_msg(conn, &msg);
            }
        }
        if vis == Visibility::Public {
            engine.fanout_common(numeric, &msg, Some(Capability::Metadata2));
        }
    }
}

/// Reply one value to a client in the `METADATA <target> KEY` form.
fn reply_value(engine: &mut Engine, conn: ConnId, target: &str, key: &str, entry: &MetaEntry) {
    match entry.plaintext() {
        Ok(value) => {
            let msg = ClientMsg::new(engine.server_name(), "METADATA")
                .with_param(target.to_owned())
                .with_param("KEY")
                .with_param(key.to_owned())
                .with_param(entry.visibility.wire())
                .with_trailing(value);
            engine.send_labeled(conn, &msg);
        }
        Err(err) => {
            warn!(error = %err, "metadata value failed to decode");
            let reply = StandardReply::fail("METADATA", codes::INVALID_PARAMS, "Undecodable value")
                .with_context(target.to_owned())
                .with_context(key.to_owned());
            engine.send_reply(conn, &reply);
        }
    }
}

/// Client `METADATA <target> GET <key>`.
pub fn client_get(engine: &mut Engine, conn: ConnId, target: &str, key: &str) {
    let now = engine.now();
    if let Some(entry) = engine.metadata.get(target, key, now).cloned() {
        if can_read(engine, conn, target, &entry) {
            reply_value(engine, conn, target, key, &entry);
        } else {
            let reply = StandardReply::fail("METADATA", codes::KEY_NO_PERMISSION, "Private key")
                .with_context(target.to_owned())
                .with_context(key.to_owned());
            engine.send_reply(conn, &reply);
        }
        return;
    }

    // Cold cache: persisted copies count before we go to services.
    if let Ok(Some(raw)) = engine.kv.get(&ns::meta(target, key)) {
        if let Some(entry) = MetaEntry::decode(&raw, now) {
            engine.metadata.insert(target, key, entry.clone());
            reply_value(engine, conn, target, key, &entry);
            return;
        }
    }

    if !engine.services.available() {
        let reply = StandardReply::fail(
            "METADATA",
            codes::TEMPORARILY_UNAVAILABLE,
            "Metadata service unavailable",
        )
        .with_context(target.to_owned())
        .with_context(key.to_owned());
        engine.send_reply(conn, &reply);
        return;
    }

    let timeout = engine.config.metadata.services_timeout_secs as i64;
    engine.pending.create(
        conn,
        PendingKind::Metadata {
            target: target.to_owned(),
            key: key.to_owned(),
        },
        now,
        timeout,
    );
    let query = Frame::new("MDQ")
        .with_origin(engine.me_str())
        .with_param(target.to_owned())
        .with_param(key.to_owned());
    engine.send_to_services(query);
}

/// Client `METADATA <target> SET <key> [:<value>]`.
pub fn client_set(
    engine: &mut Engine,
    conn: ConnId,
    target: &str,
    key: &str,
    value: Option<&str>,
    visibility: Visibility,
) {
    if !can_write(engine, conn, target) {
        let reply = StandardReply::fail("METADATA", codes::KEY_NO_PERMISSION, "Not your target")
            .with_context(target.to_owned())
            .with_context(key.to_owned());
        engine.send_reply(conn, &reply);
        return;
    }

    let me = engine.me_str();
    match value {
        None => {
            apply_clear(engine, target, key);
            let clear = Frame::new("MD")
                .with_origin(me)
                .with_param(target.to_owned())
                .with_param(key.to_owned());
            forward_write(engine, clear);
        }
        Some(value) => {
            let (wire_value, compressed) = maybe_compress(
                value,
                engine.config.metadata.compress_threshold,
                engine.config.metadata.compress_level,
            );
            let entry = MetaEntry {
                value: wire_value,
                visibility,
                compressed,
                stored_at: engine.now(),
            };
            let set = md_frame(&me, target, key, &entry);
            apply_set(engine, target, key, entry.clone());
            reply_value(engine, conn, target, key, &entry);
            forward_write(engine, set);
        }
    }
}

/// Client `METADATA <target> LIST`.
pub fn client_list(engine: &mut Engine, conn: ConnId, target: &str) {
    let now = engine.now();
    let entries = engine.metadata.all_for(target, now);
    for (key, entry) in entries {
        if can_read(engine, conn, target, &entry) {
            reply_value(engine, conn, target, &key, &entry);
        }
    }
    let done = ClientMsg::new(engine.server_name(), "METADATA")
        .with_param(target.to_owned())
        .with_param("END")
        .with_trailing("end of metadata");
    engine.send_labeled(conn, &done);
}

/// Writes go to peers; when services are down they queue for replay.
fn forward_write(engine: &mut Engine, frame: Frame) {
    if engine.services.available() {
        engine.broadcast_frame(&frame, None);
    } else {
        debug!(queued = engine.services.queued() + 1, "metadata write parked");
        engine.services.enqueue(frame);
    }
}

fn can_read(engine: &Engine, conn: ConnId, target: &str, entry: &MetaEntry) -> bool {
    if entry.visibility == Visibility::Public {
        return true;
    }
    let Some(session) = engine.clients.get(&conn) else {
        return false;
    };
    let Some(numeric) = session.user else {
        return false;
    };
    if target.starts_with('#') || target.starts_with('&') {
        return engine
            .net
            .channels
            .get(&casefold(target))
            .is_some_and(|c| c.is_op(numeric));
    }
    let user = engine.net.users.get(&numeric);
    user.is_some_and(|u| {
        u.modes.flags.oper
            || casefold(&u.nick) == casefold(target)
            || u.account().is_some_and(|a| casefold(a) == casefold(target))
    })
}

fn can_write(engine: &Engine, conn: ConnId, target: &str) -> bool {
    let Some(numeric) = engine.clients.get(&conn).and_then(|s| s.user) else {
        return false;
    };
    if target.starts_with('#') || target.starts_with('&') {
        return engine
            .net
            .channels
            .get(&casefold(target))
            .is_some_and(|c| c.can_moderate(numeric));
    }
    let user = engine.net.users.get(&numeric);
    user.is_some_and(|u| {
        u.modes.flags.oper
            || casefold(&u.nick) == casefold(target)
            || u.account().is_some_and(|a| casefold(a) == casefold(target))
    })
}
