//! User-state tokens: `Q`, `AC`, `FA`, `I`, `A`, plus presence
//! aggregation plumbing.

use tracing::debug;

use kestrel_p10::{casefold, Capability, Frame, UserNumeric};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::services::metadata::{MetaEntry, Visibility};
use crate::state::{AwayState, EffectivePresence, LinkId, PresenceTracker};
use crate::tagging::ClientMsg;

/// `Q` - a remote user quits.
pub fn handle_quit(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let who = origin_user(engine, frame)?;
    let reason = frame.trailing.clone().unwrap_or_default();
    engine.quit_user(who, &reason, false, None);
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// `AC` - account set/unset with register/modify/unregister subtypes.
pub fn handle_account(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let target: UserNumeric = frame
        .param(0)
        .ok_or(HandlerError::NeedMoreParams)?
        .parse()
        .map_err(|e| HandlerError::InvalidParams(format!("bad numeric: {e}")))?;
    if !engine.net.users.contains_key(&target) {
        return Err(HandlerError::UnknownTarget(target.to_string()));
    }

    // `AC <user> R|M <account>` sets, `AC <user> U` clears; a bare
    // `AC <user> <account>` is the legacy spelling of a set.
    let account = match (frame.param(1), frame.param(2)) {
        (Some("R") | Some("M"), Some(account)) => Some(account.to_owned()),
        (Some("U"), _) => None,
        (Some(account), None) => Some(account.to_owned()),
        _ => return Err(HandlerError::NeedMoreParams),
    };

    apply_account(engine, target, account.as_deref());
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// Apply an account change and notify `account-notify` watchers.
pub fn apply_account(engine: &mut Engine, target: UserNumeric, account: Option<&str>) {
    let (hostmask, previous) = match engine.net.users.get_mut(&target) {
        Some(user) => {
            let previous = user.modes.account.take();
            user.modes.account = account.map(str::to_owned);
            (user.hostmask(), previous)
        }
        None => return,
    };
    debug!(user = %target, account = ?account, "account change");

    let display = account.unwrap_or("*").to_owned();
    let msg = ClientMsg::new(hostmask, "ACCOUNT").with_param(display);
    engine.fanout_common(target, &msg, Some(Capability::AccountNotify));
    if let Some(conn) = engine.net.users.get(&target).and_then(|u| u.conn) {
        engine.send_msg(conn, &msg);
    }

    for name in [previous.as_deref(), account].into_iter().flatten() {
        refresh_presence(engine, name);
    }
}

/// `FA` - fakehost assignment.
pub fn handle_fakehost(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let target: UserNumeric = frame
        .param(0)
        .ok_or(HandlerError::NeedMoreParams)?
        .parse()
        .map_err(|e| HandlerError::InvalidParams(format!("bad numeric: {e}")))?;
    let fakehost = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();

    let (old_mask, ident) = match engine.net.users.get_mut(&target) {
        Some(user) => {
            let mask = user.hostmask();
            user.modes.fakehost = Some(fakehost.clone());
            (mask, user.ident.clone())
        }
        None => return Err(HandlerError::UnknownTarget(target.to_string())),
    };
    debug!(user = %target, fakehost = %fakehost, "fakehost set");

    let msg = ClientMsg::new(old_mask, "CHGHOST")
        .with_param(ident)
        .with_param(fakehost);
    engine.fanout_common(target, &msg, Some(Capability::Chghost));
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// `I` - invite.
pub fn handle_invite(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let inviter = origin_user(engine, frame)?;
    let target_param = frame.param(0).ok_or(HandlerError::NeedMoreParams)?;
    let channel = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();

    let target = target_param
        .parse::<UserNumeric>()
        .ok()
        .filter(|n| engine.net.users.contains_key(n))
        .or_else(|| engine.net.numeric_by_nick(target_param))
        .ok_or_else(|| HandlerError::UnknownTarget(target_param.to_owned()))?;

    deliver_invite(engine, inviter, target, &channel);
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// Record and deliver an invite; shared with the client INVITE command.
pub fn deliver_invite(engine: &mut Engine, inviter: UserNumeric, target: UserNumeric, channel: &str) {
    let folded = casefold(channel);
    if let Some(chan) = engine.net.channels.get_mut(&folded) {
        chan.invites.insert(target);
    }
    let inviter_mask = engine
        .net
        .users
        .get(&inviter)
        .map(|u| u.hostmask())
        .unwrap_or_default();
    let (target_nick, target_conn) = match engine.net.users.get(&target) {
        Some(user) => (user.nick.clone(), user.conn),
        None => return,
    };

    if let Some(conn) = target_conn {
        let msg = ClientMsg::new(inviter_mask.clone(), "INVITE")
            .with_param(target_nick.clone())
            .with_param(channel.to_owned());
        engine.send_msg(conn, &msg);
    }

    // invite-notify goes to members who can see it happen.
    let notify = ClientMsg::new(inviter_mask, "INVITE")
        .with_param(target_nick)
        .with_param(channel.to_owned());
    engine.fanout_channel(&folded, &notify, target_conn, Some(Capability::InviteNotify));
}

/// `A` - away state: a message, empty (present), or the literal `*`.
pub fn handle_away(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let who = origin_user(engine, frame)?;
    let state = match frame.trailing.as_deref() {
        None | Some("") => AwayState::Present,
        Some("*") => AwayState::AwayStar,
        Some(msg) => AwayState::Away(msg.to_owned()),
    };
    apply_away(engine, who, state);
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// Apply an away change; with aggregation enabled only effective
/// transitions broadcast, otherwise every flip does.
pub fn apply_away(engine: &mut Engine, who: UserNumeric, state: AwayState) {
    let (hostmask, account) = match engine.net.users.get_mut(&who) {
        Some(user) => {
            user.away = state.clone();
            (user.hostmask(), user.account().map(str::to_owned))
        }
        None => return,
    };

    let aggregated = engine.config.presence.aggregation
        && account.is_some()
        && engine.net.users.get(&who).is_some_and(|u| u.is_local());
    if aggregated {
        if let Some(account) = account {
            refresh_presence(engine, &account);
        }
        return;
    }

    broadcast_away(engine, who, &hostmask, &state);
}

fn broadcast_away(engine: &mut Engine, who: UserNumeric, hostmask: &str, state: &AwayState) {
    let msg = match state {
        AwayState::Present => ClientMsg::new(hostmask.to_owned(), "AWAY"),
        AwayState::Away(text) => {
            ClientMsg::new(hostmask.to_owned(), "AWAY").with_trailing(text.clone())
        }
        AwayState::AwayStar => ClientMsg::new(hostmask.to_owned(), "AWAY")
            .with_trailing(engine.config.presence.away_star_msg.clone()),
    };
    engine.fanout_common(who, &msg, Some(Capability::AwayNotify));
}

/// Recompute an account's effective presence and broadcast on change.
pub fn refresh_presence(engine: &mut Engine, account: &str) {
    if !engine.config.presence.aggregation {
        return;
    }
    let now = engine.now();
    let connections: Vec<UserNumeric> = engine
        .net
        .account_conns(account)
        .into_iter()
        .map(|(n, _)| n)
        .collect();

    if connections.is_empty() {
        engine.presence.forget(account);
        return;
    }

    let effective = {
        let users = connections.iter().filter_map(|n| engine.net.users.get(n));
        PresenceTracker::compute(users, &engine.config.presence.away_star_msg)
    };
    let Some(effective) = effective else {
        return;
    };

    let Some(changed) = engine.presence.transition(account, effective, now) else {
        return;
    };
    let throttle = engine.config.presence.away_throttle_secs as i64;
    if !engine.presence.may_broadcast(account, now, throttle) {
        return;
    }

    // Broadcast the effective state from each of the account's
    // connections, and mirror it into the virtual metadata keys.
    let state = match &changed {
        EffectivePresence::Present => AwayState::Present,
        EffectivePresence::Away(msg) => AwayState::Away(msg.clone()),
        EffectivePresence::Hidden => AwayState::AwayStar,
    };
    for numeric in &connections {
        let hostmask = match engine.net.users.get(numeric) {
            Some(u) => u.hostmask(),
            None => continue,
        };
        broadcast_away(engine, *numeric, &hostmask, &state);
    }
    if let Some(first) = connections.first() {
        let frame = match &state {
            AwayState::Present => Frame::new("A").with_origin(first.to_string()),
            AwayState::Away(msg) => Frame::new("A")
                .with_origin(first.to_string())
                .with_trailing(msg.clone()),
            AwayState::AwayStar => Frame::new("A")
                .with_origin(first.to_string())
                .with_trailing("*"),
        };
        engine.broadcast_frame(&frame, None);
    }

    engine.metadata.insert(
        account,
        "$presence",
        MetaEntry {
            value: changed.as_metadata().to_owned(),
            visibility: Visibility::Public,
            compressed: false,
            stored_at: now,
        },
    );
    if let Some(last) = engine.presence.last_present(account) {
        engine.metadata.insert(
            account,
            "$last_present",
            MetaEntry {
                value: last.to_string(),
                visibility: Visibility::Public,
                compressed: false,
                stored_at: now,
            },
        );
    }
}

fn origin_user(engine: &Engine, frame: &Frame) -> Result<UserNumeric, HandlerError> {
    let origin = frame
        .origin
        .as_deref()
        .ok_or_else(|| HandlerError::InvalidParams("missing origin".to_owned()))?;
    let numeric: UserNumeric = origin
        .parse()
        .map_err(|_| HandlerError::UnknownOrigin(origin.to_owned()))?;
    if engine.net.users.contains_key(&numeric) {
        Ok(numeric)
    } else {
        Err(HandlerError::UnknownOrigin(origin.to_owned()))
    }
}
