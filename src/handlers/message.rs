//! Message routing: `P`, `O`, `TM`, and the local send path the client
//! commands share.

use tracing::debug;

use kestrel_p10::reply::numerics;
use kestrel_p10::{casefold, Capability, Frame, Tag, UserNumeric};

use crate::config::PmConsent;
use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::history::{self, MessageKind, StoredMessage};
use crate::state::LinkId;
use crate::tagging::{self, ClientMsg};

/// `P` - privmsg from a peer.
pub fn handle_privmsg(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    route_remote(engine, link, frame, MessageKind::Privmsg)
}

/// `O` - notice from a peer.
pub fn handle_notice(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    route_remote(engine, link, frame, MessageKind::Notice)
}

/// `TM` - tag-only message from a peer.
pub fn handle_tagmsg(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    route_remote(engine, link, frame, MessageKind::Tagmsg)
}

fn route_remote(
    engine: &mut Engine,
    link: LinkId,
    frame: &Frame,
    kind: MessageKind,
) -> HandlerResult {
    let origin = frame
        .origin
        .as_deref()
        .ok_or_else(|| HandlerError::InvalidParams("missing origin".to_owned()))?;
    let sender: UserNumeric = origin
        .parse()
        .map_err(|_| HandlerError::UnknownOrigin(origin.to_owned()))?;
    if !engine.net.users.contains_key(&sender) {
        return Err(HandlerError::UnknownOrigin(origin.to_owned()));
    }
    let target = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let text = frame.trailing.clone().unwrap_or_default();

    // Preserve inbound time/msgid; generate what is absent.
    let time = frame
        .tag_value("time")
        .map(str::to_owned)
        .unwrap_or_else(tagging::server_time_now);
    let msgid = frame
        .tag_value("msgid")
        .map(str::to_owned)
        .unwrap_or_else(|| engine.msgids.next());
    let client_tags: Vec<Tag> = frame
        .tags
        .iter()
        .filter(|t| t.is_client_only())
        .cloned()
        .collect();

    deliver(
        engine,
        sender,
        &target,
        kind,
        &text,
        client_tags,
        time,
        msgid,
        Some(link),
        None,
    )
}

/// The shared delivery path. Local client sends enter here with
/// `from_link = None`; `echo_conn` is the sender's connection when
/// `echo-message` applies.
#[allow(clippy::too_many_arguments)]
pub fn deliver(
    engine: &mut Engine,
    sender: UserNumeric,
    target: &str,
    kind: MessageKind,
    text: &str,
    client_tags: Vec<Tag>,
    time: String,
    msgid: String,
    from_link: Option<LinkId>,
    echo_conn: Option<crate::state::ConnId>,
) -> HandlerResult {
    let (hostmask, sender_account) = match engine.net.users.get(&sender) {
        Some(user) => (user.hostmask(), user.account().map(str::to_owned)),
        None => return Err(HandlerError::UnknownOrigin(sender.to_string())),
    };

    let mut msg = ClientMsg::new(hostmask.clone(), kind.command()).with_param(target.to_owned());
    if kind != MessageKind::Tagmsg {
        msg = msg.with_trailing(text.to_owned());
    }
    msg.tags.push(Tag::new("time", time.clone()));
    msg.tags.push(Tag::new("msgid", msgid.clone()));
    if let Some(account) = &sender_account {
        msg.tags.push(Tag::new("account", account.clone()));
    }
    for tag in &client_tags {
        msg.tags.push(tag.clone());
    }

    let ts_ms = engine.now_ms();
    let is_channel = target.starts_with('#') || target.starts_with('&');

    if is_channel {
        let folded = casefold(target);
        if !engine.net.channels.contains_key(&folded) {
            return Err(HandlerError::UnknownTarget(target.to_owned()));
        }
        let require = (kind == MessageKind::Tagmsg).then_some(Capability::MessageTags);
        let exclude = engine.net.users.get(&sender).and_then(|u| u.conn);
        for (_, conn) in engine.net.local_members(&folded) {
            if Some(conn) == exclude {
                continue;
            }
            if let Some(cap) = require {
                if !engine.caps_of(conn).contains(cap) {
                    continue;
                }
            }
            engine.send_msg(conn, &msg);
        }
        if let Some(conn) = echo_conn {
            if engine.caps_of(conn).contains(Capability::EchoMessage) {
                engine.send_msg(conn, &msg);
            }
        }

        store_row(
            engine,
            &folded,
            &msgid,
            ts_ms,
            &hostmask,
            sender_account.as_deref(),
            kind,
            text,
        );
        propagate(engine, sender, target, kind, text, &client_tags, &time, &msgid, from_link, None);
    } else {
        // Direct message: the target is a nick locally, a numeric on
        // the wire.
        let recipient = target
            .parse::<UserNumeric>()
            .ok()
            .filter(|n| engine.net.users.contains_key(n))
            .or_else(|| engine.net.numeric_by_nick(target));
        let Some(recipient) = recipient else {
            return Err(HandlerError::UnknownTarget(target.to_owned()));
        };
        let (recipient_conn, recipient_nick, recipient_server) = {
            let user = &engine.net.users[&recipient];
            (user.conn, user.nick.clone(), user.numeric.server)
        };

        // Local display uses the nick, not the numeric.
        let mut direct = msg.clone();
        direct.params[0] = recipient_nick.clone();

        if let Some(conn) = recipient_conn {
            if kind != MessageKind::Tagmsg
                || engine.caps_of(conn).contains(Capability::MessageTags)
            {
                engine.send_msg(conn, &direct);
            }
        }
        if let Some(conn) = echo_conn {
            if engine.caps_of(conn).contains(Capability::EchoMessage) {
                engine.send_msg(conn, &direct);
            }
        }

        if dm_storage_allowed(engine, sender, recipient) {
            let sender_nick = engine
                .net
                .users
                .get(&sender)
                .map(|u| u.nick.clone())
                .unwrap_or_default();
            let dm = history::dm_target(&sender_nick, &recipient_nick);
            store_row(
                engine,
                &dm,
                &msgid,
                ts_ms,
                &hostmask,
                sender_account.as_deref(),
                kind,
                text,
            );
        }

        if recipient_conn.is_none() {
            propagate(
                engine,
                sender,
                &recipient.to_string(),
                kind,
                text,
                &client_tags,
                &time,
                &msgid,
                from_link,
                Some(recipient_server),
            );
        }
    }
    Ok(())
}

/// Consent policy for storing private messages: `multi` requires every
/// local party to have opted in via `draft/chathistory`; remote parties
/// are taken at their server's word.
fn dm_storage_allowed(engine: &Engine, a: UserNumeric, b: UserNumeric) -> bool {
    match engine.config.history.pm_consent {
        PmConsent::Global => true,
        PmConsent::Single => [a, b].iter().any(|n| endpoint_consents(engine, *n)),
        PmConsent::Multi => [a, b]
            .iter()
            .all(|n| !is_local(engine, *n) || endpoint_consents(engine, *n)),
    }
}

fn is_local(engine: &Engine, n: UserNumeric) -> bool {
    engine.net.users.get(&n).is_some_and(|u| u.is_local())
}

fn endpoint_consents(engine: &Engine, n: UserNumeric) -> bool {
    match engine.net.users.get(&n).and_then(|u| u.conn) {
        Some(conn) => engine.caps_of(conn).contains(Capability::Chathistory),
        None => true,
    }
}

#[allow(clippy::too_many_arguments)]
fn store_row(
    engine: &mut Engine,
    target: &str,
    msgid: &str,
    ts_ms: i64,
    sender: &str,
    account: Option<&str>,
    kind: MessageKind,
    text: &str,
) {
    if engine.config.history.store == "none" {
        return;
    }
    let retention =
        std::time::Duration::from_secs(engine.config.history.retention_days as u64 * 86_400);
    let row = StoredMessage {
        msgid: msgid.to_owned(),
        ts_ms,
        target: target.to_owned(),
        sender: sender.to_owned(),
        account: account.map(str::to_owned),
        kind,
        text: text.to_owned(),
    };
    history::append(engine.kv.as_ref(), retention, &row);
}

#[allow(clippy::too_many_arguments)]
fn propagate(
    engine: &mut Engine,
    sender: UserNumeric,
    target: &str,
    kind: MessageKind,
    text: &str,
    client_tags: &[Tag],
    time: &str,
    msgid: &str,
    from_link: Option<LinkId>,
    to_server: Option<kestrel_p10::ServerNumeric>,
) {
    let token = match kind {
        MessageKind::Privmsg => "P",
        MessageKind::Notice => "O",
        MessageKind::Tagmsg => "TM",
    };
    let mut frame = Frame::new(token)
        .with_origin(sender.to_string())
        .with_param(target.to_owned());
    if kind != MessageKind::Tagmsg {
        frame = frame.with_trailing(text.to_owned());
    }
    frame.tags.push(Tag::new("time", time.to_owned()));
    frame.tags.push(Tag::new("msgid", msgid.to_owned()));
    for tag in client_tags {
        frame.tags.push(tag.clone());
    }
    frame.tags = tagging::s2s_tags(&frame.tags);

    match to_server {
        Some(server) if server != engine.net.me => engine.send_to_server(server, &frame),
        Some(_) => {}
        None => engine.broadcast_frame(&frame, from_link),
    }
    debug!(token, target = %target, "message propagated");
}

/// Permission checks for a local sender; returns the numeric error to
/// send when the message is not allowed.
pub fn local_send_allowed(engine: &Engine, sender: UserNumeric, target: &str) -> Result<(), u16> {
    if !(target.starts_with('#') || target.starts_with('&')) {
        return Ok(());
    }
    let folded = casefold(target);
    let Some(channel) = engine.net.channels.get(&folded) else {
        return Err(numerics::ERR_NOSUCHCHANNEL);
    };
    let member = channel.member(sender);
    if member.is_none() && channel.modes.no_external {
        return Err(numerics::ERR_CANNOTSENDTOCHAN);
    }
    if channel.modes.moderated && !member.is_some_and(|m| m.op || m.halfop || m.voice) {
        return Err(numerics::ERR_CANNOTSENDTOCHAN);
    }
    Ok(())
}
