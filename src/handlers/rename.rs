//! `RN` - channel rename.
//!
//! The transition is atomic: memberships, modes, topic and lists all
//! migrate under the new name. Clients with `draft/channel-rename` see
//! a `RENAME`; everyone else gets the PART/JOIN emulation with state
//! resent.

use tracing::info;

use kestrel_p10::reply::{codes, numerics, StandardReply};
use kestrel_p10::{casefold, Capability, Frame, UserNumeric};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::state::{ConnId, LinkId};
use crate::tagging::ClientMsg;

/// Dispatch entry for `RN`.
pub fn handle(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let old = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let new = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let reason = frame.trailing.clone().unwrap_or_default();

    let old_folded = casefold(&old);
    if !engine.net.channels.contains_key(&old_folded) {
        return Err(HandlerError::UnknownTarget(old));
    }
    if engine.net.channels.contains_key(&casefold(&new)) {
        // Concurrent rename from the far side of a split: reject.
        return Err(HandlerError::InvalidParams(format!(
            "rename target {new} already exists"
        )));
    }

    let source = super::channel::source_name(engine, frame);
    apply_rename(engine, &source, &old_folded, &new, &reason);
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// A local channel operator's RENAME command.
pub fn client_request(
    engine: &mut Engine,
    conn: ConnId,
    sender: UserNumeric,
    old: &str,
    new: &str,
    reason: &str,
) {
    let old_folded = casefold(old);
    let Some(channel) = engine.net.channels.get(&old_folded) else {
        engine.send_numeric(conn, numerics::ERR_NOSUCHCHANNEL, &[old], "No such channel");
        return;
    };
    if !channel.is_op(sender) {
        engine.send_numeric(
            conn,
            numerics::ERR_CHANOPRIVSNEEDED,
            &[old],
            "You're not channel operator",
        );
        return;
    }
    if !(new.starts_with('#') || new.starts_with('&'))
        || new.len() > engine.config.server.channellen
        || new.contains(' ')
        || new.contains(',')
    {
        let reply = StandardReply::fail("RENAME", codes::CANNOT_RENAME, "Invalid channel name")
            .with_context(old.to_owned())
            .with_context(new.to_owned());
        engine.send_reply(conn, &reply);
        return;
    }
    if engine.net.channels.contains_key(&casefold(new)) {
        let reply = StandardReply::fail(
            "RENAME",
            codes::CHANNEL_NAME_IN_USE,
            "Channel name already in use",
        )
        .with_context(old.to_owned())
        .with_context(new.to_owned());
        engine.send_reply(conn, &reply);
        return;
    }

    let source = engine
        .net
        .users
        .get(&sender)
        .map(|u| u.hostmask())
        .unwrap_or_default();
    apply_rename(engine, &source, &old_folded, new, reason);

    let frame = Frame::new("RN")
        .with_origin(sender.to_string())
        .with_param(old.to_owned())
        .with_param(new.to_owned())
        .with_trailing(reason.to_owned());
    engine.broadcast_frame(&frame, None);
}

/// Migrate the channel record and notify local members.
fn apply_rename(engine: &mut Engine, source: &str, old_folded: &str, new: &str, reason: &str) {
    let Some(mut channel) = engine.net.channels.remove(old_folded) else {
        return;
    };
    let old_display = channel.name.clone();
    let new_folded = casefold(new);
    channel.name = new.to_owned();

    // Re-point every member's channel set.
    let members: Vec<UserNumeric> = channel.members.keys().copied().collect();
    for numeric in &members {
        if let Some(user) = engine.net.users.get_mut(numeric) {
            user.channels.remove(old_folded);
            user.channels.insert(new_folded.clone());
        }
    }
    let topic = channel.topic.clone();
    engine.net.channels.insert(new_folded.clone(), channel);
    info!(old = %old_display, new = %new, "channel renamed");

    let rename = ClientMsg::new(source.to_owned(), "RENAME")
        .with_param(old_display.clone())
        .with_param(new.to_owned())
        .with_trailing(reason.to_owned());

    for (member, conn) in engine.net.local_members(&new_folded) {
        if engine.caps_of(conn).contains(Capability::ChannelRename) {
            engine.send_msg(conn, &rename);
            continue;
        }
        // Emulation: leave the old name, arrive at the new one, then
        // resend what the client would have learned on a fresh join.
        let hostmask = engine
            .net
            .users
            .get(&member)
            .map(|u| u.hostmask())
            .unwrap_or_default();
        let part = ClientMsg::new(hostmask.clone(), "PART")
            .with_param(old_display.clone())
            .with_trailing(format!("Channel renamed to {new}"));
        engine.send_msg(conn, &part);
        let join = ClientMsg::new(hostmask, "JOIN").with_param(new.to_owned());
        engine.send_msg(conn, &join);
        if let Some(topic) = &topic {
            engine.send_numeric(conn, numerics::RPL_TOPIC, &[new], &topic.text);
        }
        let names = member_names(engine, &new_folded);
        engine.send_numeric(conn, numerics::RPL_NAMREPLY, &["=", new], &names);
        engine.send_numeric(conn, numerics::RPL_ENDOFNAMES, &[new], "End of /NAMES list");
    }
}

fn member_names(engine: &Engine, folded: &str) -> String {
    let Some(channel) = engine.net.channels.get(folded) else {
        return String::new();
    };
    let mut names: Vec<String> = channel
        .members
        .iter()
        .filter_map(|(numeric, modes)| {
            engine.net.users.get(numeric).map(|u| {
                let mut s = String::new();
                if let Some(prefix) = modes.prefix_char() {
                    s.push(prefix);
                }
                s.push_str(&u.nick);
                s
            })
        })
        .collect();
    names.sort();
    names.join(" ")
}
