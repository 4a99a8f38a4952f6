//! Channel tokens: `J`, `L`, `K`, `M`, and the `B` burst with its
//! timestamp merge.

use tracing::{debug, info};

use kestrel_p10::mode::{parse_channel_delta, ChannelModes, MemberModes, ModeChange};
use kestrel_p10::{casefold, Capability, Frame, ServerNumeric, Tag, UserNumeric};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::state::{Channel, LinkId};
use crate::tagging::{server_time_now, ClientMsg};

/// `J` - a remote user joins a channel.
pub fn handle_join(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let who = origin_user(engine, frame)?;
    let name = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();

    if name == "0" {
        // Part-all form.
        let channels: Vec<String> = engine
            .net
            .users
            .get(&who)
            .map(|u| u.channels.iter().cloned().collect())
            .unwrap_or_default();
        for folded in channels {
            remove_membership(engine, who, &folded, None);
        }
        engine.broadcast_frame(frame, Some(link));
        return Ok(());
    }

    let ts: i64 = frame
        .param(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(|| engine.now());
    add_membership(engine, who, &name, ts, MemberModes::default());
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// `L` - part.
pub fn handle_part(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let who = origin_user(engine, frame)?;
    let name = frame.param(0).ok_or(HandlerError::NeedMoreParams)?;
    let folded = casefold(name);
    let reason = frame.trailing.clone();
    remove_membership(engine, who, &folded, reason.as_deref());
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// `K` - kick when the first parameter is a channel; otherwise an
/// inbound kill from collision handling.
pub fn handle_kick(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let first = frame.param(0).ok_or(HandlerError::NeedMoreParams)?;
    if first.starts_with('#') || first.starts_with('&') {
        let folded = super::server::require_channel(engine, first)?;
        let target: UserNumeric = frame
            .param(1)
            .ok_or(HandlerError::NeedMoreParams)?
            .parse()
            .map_err(|e| HandlerError::InvalidParams(format!("bad target numeric: {e}")))?;
        let reason = frame.trailing.clone().unwrap_or_default();
        let kicker = source_name(engine, frame);

        let (target_nick, target_is_member) = match engine.net.users.get(&target) {
            Some(user) => (user.nick.clone(), user.channels.contains(&folded)),
            None => return Err(HandlerError::UnknownTarget(target.to_string())),
        };
        if !target_is_member {
            return Err(HandlerError::InvalidParams("target not on channel".to_owned()));
        }

        let display = engine
            .net
            .channels
            .get(&folded)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| first.to_owned());
        let msg = ClientMsg::new(kicker, "KICK")
            .with_param(display)
            .with_param(target_nick)
            .with_trailing(reason);
        engine.fanout_channel(&folded, &msg, None, None);

        detach_member(engine, target, &folded);
        engine.broadcast_frame(frame, Some(link));
        Ok(())
    } else {
        // Kill form: K <user-numeric> :<reason>
        let target: UserNumeric = first
            .parse()
            .map_err(|e| HandlerError::InvalidParams(format!("bad kill target: {e}")))?;
        if !engine.net.users.contains_key(&target) {
            return Err(HandlerError::UnknownTarget(first.to_owned()));
        }
        let reason = frame.trailing.clone().unwrap_or_else(|| "Killed".to_owned());
        info!(target = %target, reason = %reason, "inbound kill");
        super::nick::kill_user(engine, target, &reason, Some(link));
        Ok(())
    }
}

/// `M` - mode change on a channel or a user.
pub fn handle_mode(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let target = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let modestr = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let args: Vec<String> = frame.params.iter().skip(2).cloned().collect();

    if target.starts_with('#') || target.starts_with('&') {
        let folded = super::server::require_channel(engine, &target)?;
        let changes = parse_channel_delta(&modestr, &args)
            .map_err(|e| HandlerError::InvalidParams(e.to_string()))?;
        let source = source_name(engine, frame);
        apply_channel_modes(engine, &folded, &changes, &source);
        engine.broadcast_frame(frame, Some(link));
        Ok(())
    } else {
        // User mode change: the origin adjusts its own boolean flags.
        let who = origin_user(engine, frame)?;
        if let Some(user) = engine.net.users.get_mut(&who) {
            let mut adding = true;
            for c in modestr.chars() {
                match c {
                    '+' => adding = true,
                    '-' => adding = false,
                    'i' => user.modes.flags.invisible = adding,
                    'w' => user.modes.flags.wallops = adding,
                    'o' => user.modes.flags.oper = adding,
                    'd' => user.modes.flags.deaf = adding,
                    'x' => user.modes.flags.hidden_host = adding,
                    _ => {}
                }
            }
        }
        engine.broadcast_frame(frame, Some(link));
        Ok(())
    }
}

/// Apply parsed channel mode changes to state and echo them to local
/// members with nicks substituted for numerics.
pub fn apply_channel_modes(
    engine: &mut Engine,
    folded: &str,
    changes: &[ModeChange],
    source: &str,
) {
    let mut display_args: Vec<String> = Vec::new();
    let mut modestr = String::new();
    let mut sign: Option<bool> = None;

    for change in changes {
        let mut display_arg = change.arg.clone();
        {
            let Some(channel) = engine.net.channels.get_mut(folded) else {
                return;
            };
            match change.mode {
                'n' => channel.modes.no_external = change.adding,
                't' => channel.modes.topic_lock = change.adding,
                'p' => channel.modes.private = change.adding,
                's' => channel.modes.secret = change.adding,
                'm' => channel.modes.moderated = change.adding,
                'i' => channel.modes.invite_only = change.adding,
                'k' => {
                    channel.modes.key = if change.adding {
                        change.arg.clone()
                    } else {
                        None
                    };
                }
                'l' => {
                    channel.modes.limit = if change.adding {
                        change.arg.as_deref().and_then(|a| a.parse().ok())
                    } else {
                        None
                    };
                }
                'b' => {
                    if let Some(mask) = &change.arg {
                        if change.adding {
                            channel.add_ban(mask.clone());
                        } else {
                            channel.bans.retain(|b| b != mask);
                        }
                    }
                }
                'o' | 'h' | 'v' => {
                    let Some(arg) = &change.arg else { continue };
                    let member = arg
                        .parse::<UserNumeric>()
                        .ok()
                        .filter(|n| channel.members.contains_key(n));
                    let Some(member) = member else { continue };
                    if let Some(modes) = channel.members.get_mut(&member) {
                        match change.mode {
                            'o' => modes.op = change.adding,
                            'h' => modes.halfop = change.adding,
                            _ => modes.voice = change.adding,
                        }
                    }
                    display_arg = None; // substituted below
                    if let Some(user) = engine.net.users.get(&member) {
                        display_arg = Some(user.nick.clone());
                    }
                }
                _ => continue,
            }
        }

        if sign != Some(change.adding) {
            modestr.push(if change.adding { '+' } else { '-' });
            sign = Some(change.adding);
        }
        modestr.push(change.mode);
        if let Some(arg) = display_arg {
            display_args.push(arg);
        }
    }

    if modestr.is_empty() {
        return;
    }
    let display = engine
        .net
        .channels
        .get(folded)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| folded.to_owned());
    let mut msg = ClientMsg::new(source, "MODE")
        .with_param(display)
        .with_param(modestr);
    for arg in display_args {
        msg = msg.with_param(arg);
    }
    engine.fanout_channel(folded, &msg, None, None);
}

/// `B` - channel burst with the timestamp merge.
pub fn handle_burst(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let origin = super::server::origin_server(engine, frame)?;
    let name = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let remote_ts: i64 = frame
        .param(1)
        .ok_or(HandlerError::NeedMoreParams)?
        .parse()
        .map_err(|_| HandlerError::InvalidParams("bad channel timestamp".to_owned()))?;

    // Optional mode block, then an optional member list.
    let mut idx = 2;
    let mut remote_modes = ChannelModes::default();
    if let Some(modestr) = frame.params.get(idx).filter(|p| p.starts_with('+')) {
        let mut carrier = frame.params[idx + 1..].iter().map(String::as_str);
        remote_modes = ChannelModes::parse_burst(modestr, &mut carrier)
            .map_err(|e| HandlerError::InvalidParams(e.to_string()))?;
        idx += 1;
        if remote_modes.key.is_some() {
            idx += 1;
        }
        if remote_modes.limit.is_some() {
            idx += 1;
        }
    }
    let members = frame
        .params
        .get(idx)
        .map(|list| parse_member_list(list))
        .unwrap_or_default();
    let bans: Vec<String> = frame
        .trailing
        .as_deref()
        .and_then(|t| t.strip_prefix('%'))
        .map(|t| t.split(' ').filter(|s| !s.is_empty()).map(str::to_owned).collect())
        .unwrap_or_default();

    let folded = casefold(&name);
    let is_new = !engine.net.channels.contains_key(&folded);
    if is_new {
        engine
            .net
            .channels
            .insert(folded.clone(), Channel::new(name.clone(), remote_ts));
    }

    enum MergeMode {
        AdoptRemote,
        Union,
        KeepLocal,
    }
    let merge = {
        let channel = engine.net.channels.get_mut(&folded).ok_or_else(|| {
            HandlerError::Internal("channel vanished during burst".to_owned())
        })?;
        if is_new || remote_ts < channel.ts {
            // Remote is older: it wins wholesale.
            channel.clear_status();
            channel.ts = remote_ts;
            channel.modes = remote_modes.clone();
            for ban in &bans {
                channel.add_ban(ban.clone());
            }
            MergeMode::AdoptRemote
        } else if remote_ts == channel.ts {
            channel.modes.union(&remote_modes);
            for ban in &bans {
                channel.add_ban(ban.clone());
            }
            MergeMode::Union
        } else {
            MergeMode::KeepLocal
        }
    };

    let batch = engine
        .net
        .servers
        .get(&origin)
        .and_then(|s| s.batch_id.clone());
    for (numeric, modes) in members {
        if !engine.net.users.contains_key(&numeric) {
            debug!(numeric = %numeric, channel = %name, "burst member unknown, skipped");
            continue;
        }
        let effective = match merge {
            MergeMode::AdoptRemote | MergeMode::Union => modes,
            MergeMode::KeepLocal => MemberModes::default(),
        };
        let already = engine
            .net
            .channels
            .get(&folded)
            .is_some_and(|c| c.members.contains_key(&numeric));
        if already {
            if let Some(channel) = engine.net.channels.get_mut(&folded) {
                if let Some(existing) = channel.members.get_mut(&numeric) {
                    match merge {
                        MergeMode::AdoptRemote => *existing = effective,
                        MergeMode::Union => existing.union(effective),
                        MergeMode::KeepLocal => {}
                    }
                }
            }
        } else {
            add_membership_with_batch(engine, numeric, &folded, effective, batch.clone());
        }
    }

    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

fn parse_member_list(list: &str) -> Vec<(UserNumeric, MemberModes)> {
    list.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|item| {
            let (numeric, modes) = match item.split_once(':') {
                Some((n, suffix)) => (n, MemberModes::parse_suffix(suffix)),
                None => (item, MemberModes::default()),
            };
            numeric.parse().ok().map(|n| (n, modes))
        })
        .collect()
}

/// The burst frame describing a channel.
pub fn burst_frame(channel: &Channel) -> Frame {
    let mut frame = Frame::new("B")
        .with_param(channel.name.clone())
        .with_param(channel.ts.to_string());
    if !channel.modes.is_empty() {
        let (modestr, args) = channel.modes.to_wire();
        frame = frame.with_param(modestr);
        for arg in args {
            frame = frame.with_param(arg);
        }
    }
    if !channel.members.is_empty() {
        let mut members: Vec<(&UserNumeric, &MemberModes)> = channel.members.iter().collect();
        members.sort_by_key(|(n, _)| **n);
        let list = members
            .iter()
            .map(|(n, m)| {
                let suffix = m.to_suffix();
                if suffix.is_empty() {
                    n.to_string()
                } else {
                    format!("{n}:{suffix}")
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        frame = frame.with_param(list);
    }
    if !channel.bans.is_empty() {
        frame = frame.with_trailing(format!("%{}", channel.bans.join(" ")));
    }
    frame
}

// ----------------------------------------------------------------------
// Membership plumbing shared with the client layer
// ----------------------------------------------------------------------

/// Add a membership, creating the channel at `ts` when absent, and fan
/// the JOIN out to local members.
pub fn add_membership(
    engine: &mut Engine,
    who: UserNumeric,
    name: &str,
    ts: i64,
    modes: MemberModes,
) {
    let folded = casefold(name);
    engine.net.channel_entry(name, ts);
    let batch = engine
        .net
        .servers
        .get(&who.server)
        .and_then(|s| s.batch_id.clone());
    add_membership_with_batch(engine, who, &folded, modes, batch);
}

fn add_membership_with_batch(
    engine: &mut Engine,
    who: UserNumeric,
    folded: &str,
    modes: MemberModes,
    batch: Option<String>,
) {
    let (hostmask, account, realname) = match engine.net.users.get(&who) {
        Some(user) => (
            user.hostmask(),
            user.account().unwrap_or("*").to_owned(),
            user.realname.clone(),
        ),
        None => return,
    };
    if let Some(channel) = engine.net.channels.get_mut(folded) {
        channel.members.insert(who, modes);
    }
    if let Some(user) = engine.net.users.get_mut(&who) {
        user.channels.insert(folded.to_owned());
    }

    let display = engine
        .net
        .channels
        .get(folded)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| folded.to_owned());

    // Plain JOIN and the extended-join variant, selected per recipient.
    let mut plain = ClientMsg::new(hostmask.clone(), "JOIN").with_param(display.clone());
    let mut extended = ClientMsg::new(hostmask, "JOIN")
        .with_param(display)
        .with_param(account)
        .with_trailing(realname);
    plain.tags.push(Tag::new("time", server_time_now()));
    extended.tags.push(Tag::new("time", server_time_now()));
    if let Some(id) = batch {
        plain.tags.push(Tag::new("batch", id.clone()));
        extended.tags.push(Tag::new("batch", id));
    }

    let own_conn = engine.net.users.get(&who).and_then(|u| u.conn);
    for (member, conn) in engine.net.local_members(folded) {
        if Some(conn) == own_conn && member == who {
            continue;
        }
        if engine.caps_of(conn).contains(Capability::ExtendedJoin) {
            engine.send_msg(conn, &extended);
        } else {
            engine.send_msg(conn, &plain);
        }
    }
}

/// Remove a membership, fan the PART out, and drop the channel when it
/// empties.
pub fn remove_membership(engine: &mut Engine, who: UserNumeric, folded: &str, reason: Option<&str>) {
    let Some(user) = engine.net.users.get(&who) else {
        return;
    };
    if !user.channels.contains(folded) {
        return;
    }
    let hostmask = user.hostmask();
    let display = engine
        .net
        .channels
        .get(folded)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| folded.to_owned());
    let mut msg = ClientMsg::new(hostmask, "PART").with_param(display);
    if let Some(reason) = reason {
        msg = msg.with_trailing(reason.to_owned());
    }
    engine.fanout_channel(folded, &msg, None, None);
    detach_member(engine, who, folded);
}

/// State-only removal shared by PART, KICK and RENAME emulation.
pub fn detach_member(engine: &mut Engine, who: UserNumeric, folded: &str) {
    if let Some(user) = engine.net.users.get_mut(&who) {
        user.channels.remove(folded);
    }
    let empty = if let Some(channel) = engine.net.channels.get_mut(folded) {
        channel.members.remove(&who);
        channel.members.is_empty()
    } else {
        false
    };
    if empty {
        engine.net.channels.remove(folded);
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

/// Human-readable source for client-bound lines: hostmask for users,
/// server name for servers.
pub fn source_name(engine: &Engine, frame: &Frame) -> String {
    match frame.origin.as_deref() {
        Some(origin) => {
            if let Ok(user) = origin.parse::<UserNumeric>() {
                if let Some(u) = engine.net.users.get(&user) {
                    return u.hostmask();
                }
            }
            if let Ok(server) = origin.parse::<ServerNumeric>() {
                if let Some(s) = engine.net.servers.get(&server) {
                    return s.name.clone();
                }
            }
            origin.to_owned()
        }
        None => engine.config.server.name.clone(),
    }
}
