//! Client command dispatch: the registration pipeline and the
//! post-registration command surface.

use tracing::debug;

use kestrel_p10::reply::{codes, numerics, StandardReply};
use kestrel_p10::{casefold, Capability, Frame, MsgRef, OriginMode, Tag, UserNumeric};

use crate::engine::Engine;
use crate::handlers;
use crate::history::{self, HistorySelect, MessageKind, StoredMessage};
use crate::services::metadata::Visibility;
use crate::state::{AwayState, ConnId, User};
use crate::tagging::{self, ClientMsg};

use super::batch::{BatchLine, ClientBatch};
use super::{cap, RegState};

/// Client batches expire after this many seconds unclosed.
const BATCH_TIMEOUT: i64 = 60;

/// Handle one raw line from a client connection.
pub fn handle_line(engine: &mut Engine, conn: ConnId, line: &str) {
    let frame = match Frame::parse(line, OriginMode::Client) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(conn, error = %e, "client protocol error");
            let msg = format!("Protocol error: {e}");
            if let Some(session) = engine.clients.get(&conn) {
                let _ = session.tx.try_send(format!("ERROR :{msg}"));
            }
            engine.teardown_client(conn, &msg);
            return;
        }
    };

    let command = frame.token.to_uppercase();

    // Labeled-response bookkeeping for this command.
    let label = frame
        .tag_value("label")
        .filter(|_| engine.caps_of(conn).contains(Capability::LabeledResponse))
        .map(str::to_owned);
    if let Some(session) = engine.clients.get_mut(&conn) {
        session.active_label = label.clone();
        session.wrote = false;
    }

    let registered = engine
        .clients
        .get(&conn)
        .is_some_and(|s| s.state == RegState::Registered);
    if registered {
        dispatch_registered(engine, conn, &command, &frame);
    } else {
        dispatch_prereg(engine, conn, &command, &frame);
    }

    // A labeled command that produced nothing closes with ACK.
    let needs_ack = engine
        .clients
        .get(&conn)
        .is_some_and(|s| s.active_label.is_some() && !s.wrote);
    if needs_ack {
        let msg = ClientMsg::new(engine.server_name(), "ACK");
        engine.send_labeled(conn, &msg);
    }
    if let Some(session) = engine.clients.get_mut(&conn) {
        session.active_label = None;
    }
}

// ----------------------------------------------------------------------
// Registration pipeline
// ----------------------------------------------------------------------

fn dispatch_prereg(engine: &mut Engine, conn: ConnId, command: &str, frame: &Frame) {
    match command {
        "CAP" => cap::handle(engine, conn, &frame.params, frame.trailing.as_deref()),
        "NICK" => handle_nick(engine, conn, frame),
        "USER" => handle_user(engine, conn, frame),
        "PASS" => {}
        "AUTHENTICATE" => {
            let arg = frame.param(0).unwrap_or("*").to_owned();
            handlers::sasl::client_authenticate(engine, conn, &arg);
        }
        "REGISTER" => {
            // before-connect registration is part of the capability.
            handle_register_cmd(engine, conn, frame);
        }
        "VERIFY" => handle_verify_cmd(engine, conn, frame),
        "AWAY" => {
            if engine.caps_of(conn).contains(Capability::PreAway) {
                let state = away_state_from(frame);
                if let Some(session) = engine.clients.get_mut(&conn) {
                    session.pre_away = Some(state);
                }
            }
        }
        "PING" => handle_ping(engine, conn, frame),
        "QUIT" => {
            let reason = frame.trailing.clone().unwrap_or_else(|| "Quit".to_owned());
            if let Some(session) = engine.clients.get(&conn) {
                let _ = session.tx.try_send(format!("ERROR :Closing link ({reason})"));
            }
            engine.teardown_client(conn, &reason);
        }
        _ => {
            engine.send_numeric(
                conn,
                numerics::ERR_NOTREGISTERED,
                &[],
                "You have not registered",
            );
        }
    }
}

fn handle_nick(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(nick) = frame
        .param(0)
        .or(frame.trailing.as_deref())
        .map(str::to_owned)
    else {
        engine.send_numeric(conn, numerics::ERR_NEEDMOREPARAMS, &["NICK"], "Not enough parameters");
        return;
    };
    if !handlers::nick::valid_nick(&nick, engine.config.server.nicklen) {
        engine.send_numeric(
            conn,
            numerics::ERR_ERRONEUSNICKNAME,
            &[&nick],
            "Erroneous nickname",
        );
        return;
    }

    let registered = engine
        .clients
        .get(&conn)
        .is_some_and(|s| s.state == RegState::Registered);
    let own_numeric = engine.clients.get(&conn).and_then(|s| s.user);

    // In-use check, allowing a case-only change of one's own nick.
    if let Some(holder) = engine.net.numeric_by_nick(&nick) {
        if Some(holder) != own_numeric {
            engine.send_numeric(
                conn,
                numerics::ERR_NICKNAMEINUSE,
                &[&nick],
                "Nickname is already in use",
            );
            return;
        }
    }

    if registered {
        let Some(numeric) = own_numeric else { return };
        let ts = engine.now();
        handlers::nick::apply_nick_change(engine, numeric, &nick, ts);
        let frame = Frame::new("N")
            .with_origin(numeric.to_string())
            .with_param(nick)
            .with_param(ts.to_string());
        engine.broadcast_frame(&frame, None);
    } else {
        let ready = {
            let Some(session) = engine.clients.get_mut(&conn) else {
                return;
            };
            session.nick = Some(nick);
            session.ready_to_register()
        };
        if ready {
            complete_registration(engine, conn);
        }
    }
}

fn handle_user(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let registered = engine
        .clients
        .get(&conn)
        .is_some_and(|s| s.state == RegState::Registered);
    if registered {
        engine.send_numeric(
            conn,
            numerics::ERR_ALREADYREGISTERED,
            &[],
            "You may not reregister",
        );
        return;
    }
    let Some(ident) = frame.param(0).map(str::to_owned) else {
        engine.send_numeric(conn, numerics::ERR_NEEDMOREPARAMS, &["USER"], "Not enough parameters");
        return;
    };
    let realname = frame
        .trailing
        .clone()
        .unwrap_or_else(|| ident.clone());
    let ready = {
        let Some(session) = engine.clients.get_mut(&conn) else {
            return;
        };
        session.ident = Some(ident);
        session.realname = Some(User::clamp_realname(&realname));
        session.ready_to_register()
    };
    if ready {
        complete_registration(engine, conn);
    }
}

/// Finish registration: create the user, welcome the client, and
/// introduce them to the network.
pub fn complete_registration(engine: &mut Engine, conn: ConnId) {
    let now = engine.now();
    let numeric = engine.numerics.next();
    let (nick, ident, realname, host, ip, account, pre_away) = {
        let Some(session) = engine.clients.get_mut(&conn) else {
            return;
        };
        session.state = RegState::Registered;
        session.user = Some(numeric);
        (
            session.nick.clone().unwrap_or_default(),
            session.ident.clone().unwrap_or_default(),
            session.realname.clone().unwrap_or_default(),
            session.host.clone(),
            session.ip.clone(),
            session.account.clone(),
            session.pre_away.take(),
        )
    };

    let mut user = User {
        numeric,
        nick: nick.clone(),
        ident,
        host,
        realname,
        nick_ts: now,
        connect_ts: now,
        ip,
        modes: Default::default(),
        channels: Default::default(),
        away: AwayState::Present,
        conn: Some(conn),
    };
    user.modes.flags.invisible = true;
    user.modes.account = account.clone();
    engine.net.insert_user(user);

    // Welcome numerics.
    let network = engine.config.server.network.clone();
    let server = engine.server_name().to_owned();
    engine.send_numeric(
        conn,
        numerics::RPL_WELCOME,
        &[],
        &format!("Welcome to the {network} IRC Network {nick}"),
    );
    engine.send_numeric(
        conn,
        numerics::RPL_YOURHOST,
        &[],
        &format!("Your host is {server}, running kestreld"),
    );
    engine.send_numeric(conn, numerics::RPL_CREATED, &[], "This server was created recently");
    engine.send_numeric(
        conn,
        numerics::RPL_MYINFO,
        &[&server, "kestreld", "iwodx", "ntpsmiklbohv"],
        "are supported by this server",
    );
    for line in isupport_lines(engine) {
        let mut params: Vec<&str> = line.split(' ').collect();
        let trailing = "are supported by this server";
        let msg = {
            let mut m = ClientMsg::new(engine.server_name(), "005");
            m = m.with_param(nick.clone());
            for p in params.drain(..) {
                m = m.with_param(p);
            }
            m.with_trailing(trailing)
        };
        engine.send_msg(conn, &msg);
    }

    // Introduce to peers.
    let intro = engine
        .net
        .users
        .get(&numeric)
        .map(handlers::nick::introduction_frame);
    if let Some(intro) = intro {
        engine.broadcast_frame(&intro, None);
    }
    if let Some(account) = account {
        handlers::user::apply_account(engine, numeric, Some(&account));
        let frame = Frame::new("AC")
            .with_origin(engine.me_str())
            .with_param(numeric.to_string())
            .with_param("R")
            .with_param(account);
        engine.broadcast_frame(&frame, None);
    }
    if let Some(state) = pre_away {
        handlers::user::apply_away(engine, numeric, state.clone());
        let away = match &state {
            AwayState::Present => Frame::new("A").with_origin(numeric.to_string()),
            AwayState::Away(msg) => Frame::new("A")
                .with_origin(numeric.to_string())
                .with_trailing(msg.clone()),
            AwayState::AwayStar => Frame::new("A")
                .with_origin(numeric.to_string())
                .with_trailing("*"),
        };
        engine.broadcast_frame(&away, None);
    }
    debug!(conn, numeric = %numeric, nick = %nick, "client registered");
}

fn isupport_lines(engine: &Engine) -> Vec<String> {
    let mut isupport = kestrel_p10::isupport::Isupport::new();
    isupport
        .set("NETWORK", engine.config.server.network.clone())
        .set("NICKLEN", engine.config.server.nicklen.to_string())
        .set("CHANNELLEN", engine.config.server.channellen.to_string())
        .set("PREFIX", "(ohv)@%+")
        .set("MODES", "6")
        .set("MAXTARGETS", "4")
        .set("CHATHISTORY", engine.config.history.max.to_string())
        .set("MSGREFTYPES", "timestamp,msgid")
        .set("ACCOUNTEXTBAN", "a,R");
    if let Some(vapid) = &engine.services.vapid {
        isupport.set("VAPID", vapid.clone());
    }
    isupport.lines()
}

// ----------------------------------------------------------------------
// Post-registration dispatch
// ----------------------------------------------------------------------

fn dispatch_registered(engine: &mut Engine, conn: ConnId, command: &str, frame: &Frame) {
    // Messages carrying @batch feed an open batch instead of the
    // normal path.
    if matches!(command, "PRIVMSG" | "NOTICE") {
        if let Some(batch_id) = frame.tag_value("batch").map(str::to_owned) {
            batched_message(engine, conn, &batch_id, command, frame);
            return;
        }
    }

    match command {
        "PING" => handle_ping(engine, conn, frame),
        "PONG" => {}
        "CAP" => cap::handle(engine, conn, &frame.params, frame.trailing.as_deref()),
        "NICK" => handle_nick(engine, conn, frame),
        "USER" => handle_user(engine, conn, frame),
        "QUIT" => {
            let reason = frame.trailing.clone().unwrap_or_else(|| "Quit".to_owned());
            if let Some(session) = engine.clients.get(&conn) {
                let _ = session.tx.try_send(format!("ERROR :Closing link ({reason})"));
            }
            engine.teardown_client(conn, &reason);
        }
        "JOIN" => handle_join(engine, conn, frame),
        "PART" => handle_part(engine, conn, frame),
        "PRIVMSG" => handle_message(engine, conn, frame, MessageKind::Privmsg),
        "NOTICE" => handle_message(engine, conn, frame, MessageKind::Notice),
        "TAGMSG" => handle_message(engine, conn, frame, MessageKind::Tagmsg),
        "MODE" => handle_mode(engine, conn, frame),
        "TOPIC" => handle_topic(engine, conn, frame),
        "KICK" => handle_kick(engine, conn, frame),
        "INVITE" => handle_invite(engine, conn, frame),
        "AWAY" => handle_away(engine, conn, frame),
        "BATCH" => handle_batch_cmd(engine, conn, frame),
        "AUTHENTICATE" => {
            let arg = frame.param(0).unwrap_or("*").to_owned();
            handlers::sasl::client_authenticate(engine, conn, &arg);
        }
        "CHATHISTORY" => handle_chathistory(engine, conn, frame),
        "METADATA" => handle_metadata(engine, conn, frame),
        "MARKREAD" => handle_markread(engine, conn, frame),
        "REGISTER" => handle_register_cmd(engine, conn, frame),
        "VERIFY" => handle_verify_cmd(engine, conn, frame),
        "SETNAME" => handle_setname(engine, conn, frame),
        "RENAME" => handle_rename(engine, conn, frame),
        "REDACT" => handle_redact(engine, conn, frame),
        "WEBPUSH" => handle_webpush(engine, conn, frame),
        other => {
            engine.send_numeric(conn, numerics::ERR_UNKNOWNCOMMAND, &[other], "Unknown command");
        }
    }
}

fn handle_ping(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let token = frame
        .param(0)
        .or(frame.trailing.as_deref())
        .unwrap_or("")
        .to_owned();
    let server = engine.server_name().to_owned();
    let msg = ClientMsg::new(server.clone(), "PONG")
        .with_param(server)
        .with_trailing(token);
    engine.send_labeled(conn, &msg);
}

fn session_user(engine: &Engine, conn: ConnId) -> Option<UserNumeric> {
    engine.clients.get(&conn).and_then(|s| s.user)
}

// ----------------------------------------------------------------------
// Channels
// ----------------------------------------------------------------------

fn handle_join(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let Some(channels) = frame.param(0).map(str::to_owned) else {
        engine.send_numeric(conn, numerics::ERR_NEEDMOREPARAMS, &["JOIN"], "Not enough parameters");
        return;
    };
    let keys: Vec<&str> = frame.param(1).map(|k| k.split(',').collect()).unwrap_or_default();

    for (i, name) in channels.split(',').filter(|s| !s.is_empty()).enumerate() {
        if name == "0" {
            let parts: Vec<String> = engine
                .net
                .users
                .get(&numeric)
                .map(|u| u.channels.iter().cloned().collect())
                .unwrap_or_default();
            for folded in parts {
                handlers::channel::remove_membership(engine, numeric, &folded, Some("Leaving"));
                let frame = Frame::new("L")
                    .with_origin(numeric.to_string())
                    .with_param(folded);
                engine.broadcast_frame(&frame, None);
            }
            continue;
        }
        if !(name.starts_with('#') || name.starts_with('&'))
            || name.len() > engine.config.server.channellen
        {
            engine.send_numeric(conn, numerics::ERR_NOSUCHCHANNEL, &[name], "No such channel");
            continue;
        }
        join_one(engine, conn, numeric, name, keys.get(i).copied());
    }
}

fn join_one(engine: &mut Engine, conn: ConnId, numeric: UserNumeric, name: &str, key: Option<&str>) {
    let folded = casefold(name);
    let now = engine.now();
    let existing = engine.net.channels.get(&folded);

    if let Some(channel) = existing {
        if channel.members.contains_key(&numeric) {
            return;
        }
        let invited = channel.invites.contains(&numeric);
        if channel.modes.invite_only && !invited {
            engine.send_numeric(conn, numerics::ERR_INVITEONLYCHAN, &[name], "Cannot join channel (+i)");
            return;
        }
        if let Some(required) = &channel.modes.key {
            if key != Some(required.as_str()) {
                engine.send_numeric(conn, numerics::ERR_BADCHANNELKEY, &[name], "Cannot join channel (+k)");
                return;
            }
        }
        if let Some(limit) = channel.modes.limit {
            if channel.members.len() >= limit as usize {
                engine.send_numeric(conn, numerics::ERR_CHANNELISFULL, &[name], "Cannot join channel (+l)");
                return;
            }
        }
        let mask = engine
            .net
            .users
            .get(&numeric)
            .map(|u| u.hostmask())
            .unwrap_or_default();
        let banned = channel.bans.iter().any(|b| mask_match(b, &mask)) && !invited;
        if banned {
            engine.send_numeric(conn, numerics::ERR_BANNEDFROMCHAN, &[name], "Cannot join channel (+b)");
            return;
        }
    }

    let creating = existing.is_none();
    let modes = kestrel_p10::mode::MemberModes {
        op: creating,
        ..Default::default()
    };
    handlers::channel::add_membership(engine, numeric, name, now, modes);
    if let Some(channel) = engine.net.channels.get_mut(&folded) {
        channel.invites.remove(&numeric);
    }

    // Echo the join to the joining client.
    let (hostmask, account, realname) = match engine.net.users.get(&numeric) {
        Some(u) => (u.hostmask(), u.account().unwrap_or("*").to_owned(), u.realname.clone()),
        None => return,
    };
    let display = engine
        .net
        .channels
        .get(&folded)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| name.to_owned());
    let join = if engine.caps_of(conn).contains(Capability::ExtendedJoin) {
        ClientMsg::new(hostmask, "JOIN")
            .with_param(display.clone())
            .with_param(account)
            .with_trailing(realname)
    } else {
        ClientMsg::new(hostmask, "JOIN").with_param(display.clone())
    };
    engine.send_labeled(conn, &join);

    // Topic and names, unless implicit names are suppressed.
    let topic = engine.net.channels.get(&folded).and_then(|c| c.topic.clone());
    if let Some(topic) = topic {
        engine.send_numeric(conn, numerics::RPL_TOPIC, &[&display], &topic.text);
    }
    if !engine.caps_of(conn).contains(Capability::NoImplicitNames) {
        send_names(engine, conn, &folded, &display);
    }

    // Cascade: fresh channels travel as a burst, existing ones as a
    // join.
    if creating {
        let mut burst = engine
            .net
            .channels
            .get(&folded)
            .map(handlers::channel::burst_frame);
        if let Some(frame) = burst.as_mut() {
            frame.origin = Some(engine.me_str());
            engine.broadcast_frame(frame, None);
        }
    } else {
        let frame = Frame::new("J")
            .with_origin(numeric.to_string())
            .with_param(display)
            .with_param(now.to_string());
        engine.broadcast_frame(&frame, None);
    }
}

fn send_names(engine: &mut Engine, conn: ConnId, folded: &str, display: &str) {
    let multi_prefix = engine.caps_of(conn).contains(Capability::MultiPrefix);
    let userhost = engine.caps_of(conn).contains(Capability::UserhostInNames);
    let names = {
        let Some(channel) = engine.net.channels.get(folded) else {
            return;
        };
        let mut names: Vec<String> = channel
            .members
            .iter()
            .filter_map(|(n, modes)| {
                engine.net.users.get(n).map(|u| {
                    let prefix = if multi_prefix {
                        modes.all_prefix_chars()
                    } else {
                        modes.prefix_char().map(String::from).unwrap_or_default()
                    };
                    let who = if userhost { u.hostmask() } else { u.nick.clone() };
                    format!("{prefix}{who}")
                })
            })
            .collect();
        names.sort();
        names.join(" ")
    };
    engine.send_numeric(conn, numerics::RPL_NAMREPLY, &["=", display], &names);
    engine.send_numeric(conn, numerics::RPL_ENDOFNAMES, &[display], "End of /NAMES list");
}

fn handle_part(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let Some(channels) = frame.param(0).map(str::to_owned) else {
        engine.send_numeric(conn, numerics::ERR_NEEDMOREPARAMS, &["PART"], "Not enough parameters");
        return;
    };
    let reason = frame.trailing.clone();
    for name in channels.split(',').filter(|s| !s.is_empty()) {
        let folded = casefold(name);
        let on_channel = engine
            .net
            .users
            .get(&numeric)
            .is_some_and(|u| u.channels.contains(&folded));
        if !on_channel {
            engine.send_numeric(conn, numerics::ERR_NOTONCHANNEL, &[name], "You're not on that channel");
            continue;
        }
        handlers::channel::remove_membership(engine, numeric, &folded, reason.as_deref());
        let mut out = Frame::new("L")
            .with_origin(numeric.to_string())
            .with_param(name.to_owned());
        if let Some(reason) = &reason {
            out = out.with_trailing(reason.clone());
        }
        engine.broadcast_frame(&out, None);
    }
}

fn handle_message(engine: &mut Engine, conn: ConnId, frame: &Frame, kind: MessageKind) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let Some(target) = frame.param(0).map(str::to_owned) else {
        engine.send_numeric(conn, numerics::ERR_NEEDMOREPARAMS, &[frame.token.as_str()], "Not enough parameters");
        return;
    };
    let text = frame.trailing.clone().unwrap_or_default();
    if kind != MessageKind::Tagmsg && text.is_empty() {
        engine.send_numeric(conn, 412, &[], "No text to send");
        return;
    }
    if let Err(code) = handlers::message::local_send_allowed(engine, numeric, &target) {
        engine.send_numeric(conn, code, &[&target], "Cannot send to channel");
        return;
    }
    let client_tags: Vec<Tag> = frame
        .tags
        .iter()
        .filter(|t| t.is_client_only())
        .cloned()
        .collect();
    let msgid = engine.msgids.next();
    let result = handlers::message::deliver(
        engine,
        numeric,
        &target,
        kind,
        &text,
        client_tags,
        tagging::server_time_now(),
        msgid,
        None,
        Some(conn),
    );
    if let Err(e) = result {
        if let Some(reply) = e.to_standard_reply(&frame.token.to_uppercase()) {
            engine.send_reply(conn, &reply);
        }
    }
}

fn handle_mode(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let Some(target) = frame.param(0).map(str::to_owned) else {
        engine.send_numeric(conn, numerics::ERR_NEEDMOREPARAMS, &["MODE"], "Not enough parameters");
        return;
    };
    if !(target.starts_with('#') || target.starts_with('&')) {
        // Own user modes only.
        let Some(modestr) = frame.param(1) else {
            let modes = engine
                .net
                .users
                .get(&numeric)
                .map(|u| u.modes.to_wire().0)
                .unwrap_or_default();
            engine.send_numeric(conn, numerics::RPL_UMODEIS, &[&modes], "");
            return;
        };
        let out = Frame::new("M")
            .with_origin(numeric.to_string())
            .with_param(target)
            .with_param(modestr.to_owned());
        // Reuse the link path so state and propagation stay aligned.
        let mut adding = true;
        if let Some(user) = engine.net.users.get_mut(&numeric) {
            for c in modestr.chars() {
                match c {
                    '+' => adding = true,
                    '-' => adding = false,
                    'i' => user.modes.flags.invisible = adding,
                    'w' => user.modes.flags.wallops = adding,
                    'd' => user.modes.flags.deaf = adding,
                    'x' => user.modes.flags.hidden_host = adding,
                    _ => {}
                }
            }
        }
        engine.broadcast_frame(&out, None);
        return;
    }

    let folded = casefold(&target);
    let Some(channel) = engine.net.channels.get(&folded) else {
        engine.send_numeric(conn, numerics::ERR_NOSUCHCHANNEL, &[&target], "No such channel");
        return;
    };
    let Some(modestr) = frame.param(1).map(str::to_owned) else {
        let modes = channel.modes.to_wire().0;
        engine.send_numeric(conn, numerics::RPL_CHANNELMODEIS, &[&target, &modes], "");
        return;
    };
    if modestr == "+b" || modestr == "b" {
        let bans = channel.bans.clone();
        for ban in bans {
            engine.send_numeric(conn, numerics::RPL_BANLIST, &[&target, &ban], "");
        }
        engine.send_numeric(conn, numerics::RPL_ENDOFBANLIST, &[&target], "End of channel ban list");
        return;
    }
    if !channel.can_moderate(numeric) {
        engine.send_numeric(
            conn,
            numerics::ERR_CHANOPRIVSNEEDED,
            &[&target],
            "You're not channel operator",
        );
        return;
    }

    // Client args use nicks; the wire uses numerics.
    let raw_args: Vec<String> = frame.params.iter().skip(2).cloned().collect();
    let mut wire_args = Vec::with_capacity(raw_args.len());
    for arg in &raw_args {
        match engine.net.numeric_by_nick(arg) {
            Some(n) => wire_args.push(n.to_string()),
            None => wire_args.push(arg.clone()),
        }
    }
    let changes = match kestrel_p10::mode::parse_channel_delta(&modestr, &wire_args) {
        Ok(changes) => changes,
        Err(e) => {
            let reply = StandardReply::fail("MODE", codes::INVALID_PARAMS, e.to_string())
                .with_context(target.clone());
            engine.send_reply(conn, &reply);
            return;
        }
    };
    let source = engine
        .net
        .users
        .get(&numeric)
        .map(|u| u.hostmask())
        .unwrap_or_default();
    handlers::channel::apply_channel_modes(engine, &folded, &changes, &source);

    let (wire_modes, args) = kestrel_p10::mode::format_changes(&changes);
    let mut out = Frame::new("M")
        .with_origin(numeric.to_string())
        .with_param(target)
        .with_param(wire_modes);
    for arg in args {
        out = out.with_param(arg);
    }
    engine.broadcast_frame(&out, None);
}

fn handle_topic(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let Some(target) = frame.param(0).map(str::to_owned) else {
        engine.send_numeric(conn, numerics::ERR_NEEDMOREPARAMS, &["TOPIC"], "Not enough parameters");
        return;
    };
    let folded = casefold(&target);
    let Some(channel) = engine.net.channels.get(&folded) else {
        engine.send_numeric(conn, numerics::ERR_NOSUCHCHANNEL, &[&target], "No such channel");
        return;
    };
    match &frame.trailing {
        None => match &channel.topic {
            Some(topic) => {
                let text = topic.text.clone();
                engine.send_numeric(conn, numerics::RPL_TOPIC, &[&target], &text);
            }
            None => {
                engine.send_numeric(conn, numerics::RPL_NOTOPIC, &[&target], "No topic is set");
            }
        },
        Some(text) => {
            if channel.modes.topic_lock && !channel.can_moderate(numeric) {
                engine.send_numeric(
                    conn,
                    numerics::ERR_CHANOPRIVSNEEDED,
                    &[&target],
                    "You're not channel operator",
                );
                return;
            }
            let setter = engine
                .net
                .users
                .get(&numeric)
                .map(|u| u.hostmask())
                .unwrap_or_default();
            let now = engine.now();
            if let Some(channel) = engine.net.channels.get_mut(&folded) {
                channel.topic = Some(crate::state::Topic {
                    text: text.clone(),
                    set_by: setter.clone(),
                    ts: now,
                });
            }
            let msg = ClientMsg::new(setter, "TOPIC")
                .with_param(target)
                .with_trailing(text.clone());
            engine.fanout_channel(&folded, &msg, None, None);
        }
    }
}

fn handle_kick(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let (Some(target), Some(victim)) = (frame.param(0).map(str::to_owned), frame.param(1).map(str::to_owned))
    else {
        engine.send_numeric(conn, numerics::ERR_NEEDMOREPARAMS, &["KICK"], "Not enough parameters");
        return;
    };
    let folded = casefold(&target);
    let Some(channel) = engine.net.channels.get(&folded) else {
        engine.send_numeric(conn, numerics::ERR_NOSUCHCHANNEL, &[&target], "No such channel");
        return;
    };
    if !channel.can_moderate(numeric) {
        engine.send_numeric(
            conn,
            numerics::ERR_CHANOPRIVSNEEDED,
            &[&target],
            "You're not channel operator",
        );
        return;
    }
    let Some(victim_numeric) = engine.net.numeric_by_nick(&victim) else {
        engine.send_numeric(conn, numerics::ERR_NOSUCHNICK, &[&victim], "No such nick");
        return;
    };
    if !engine
        .net
        .channels
        .get(&folded)
        .is_some_and(|c| c.members.contains_key(&victim_numeric))
    {
        engine.send_numeric(
            conn,
            numerics::ERR_USERNOTINCHANNEL,
            &[&victim, &target],
            "They aren't on that channel",
        );
        return;
    }
    let reason = frame.trailing.clone().unwrap_or_else(|| victim.clone());

    let kicker = engine
        .net
        .users
        .get(&numeric)
        .map(|u| u.hostmask())
        .unwrap_or_default();
    let msg = ClientMsg::new(kicker, "KICK")
        .with_param(target.clone())
        .with_param(victim)
        .with_trailing(reason.clone());
    engine.fanout_channel(&folded, &msg, None, None);
    handlers::channel::detach_member(engine, victim_numeric, &folded);

    let out = Frame::new("K")
        .with_origin(numeric.to_string())
        .with_param(target)
        .with_param(victim_numeric.to_string())
        .with_trailing(reason);
    engine.broadcast_frame(&out, None);
}

fn handle_invite(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let (Some(nick), Some(target)) = (frame.param(0).map(str::to_owned), frame.param(1).map(str::to_owned))
    else {
        engine.send_numeric(conn, numerics::ERR_NEEDMOREPARAMS, &["INVITE"], "Not enough parameters");
        return;
    };
    let folded = casefold(&target);
    let Some(channel) = engine.net.channels.get(&folded) else {
        engine.send_numeric(conn, numerics::ERR_NOSUCHCHANNEL, &[&target], "No such channel");
        return;
    };
    if !channel.members.contains_key(&numeric) {
        engine.send_numeric(conn, numerics::ERR_NOTONCHANNEL, &[&target], "You're not on that channel");
        return;
    }
    if channel.modes.invite_only && !channel.can_moderate(numeric) {
        engine.send_numeric(
            conn,
            numerics::ERR_CHANOPRIVSNEEDED,
            &[&target],
            "You're not channel operator",
        );
        return;
    }
    let Some(invitee) = engine.net.numeric_by_nick(&nick) else {
        engine.send_numeric(conn, numerics::ERR_NOSUCHNICK, &[&nick], "No such nick");
        return;
    };
    handlers::user::deliver_invite(engine, numeric, invitee, &target);
    engine.send_numeric(conn, numerics::RPL_INVITING, &[&nick, &target], "");
    let out = Frame::new("I")
        .with_origin(numeric.to_string())
        .with_param(invitee.to_string())
        .with_param(target);
    engine.broadcast_frame(&out, None);
}

fn away_state_from(frame: &Frame) -> AwayState {
    match frame.trailing.as_deref().or(frame.param(0)) {
        None | Some("") => AwayState::Present,
        Some("*") => AwayState::AwayStar,
        Some(msg) => AwayState::Away(msg.to_owned()),
    }
}

fn handle_away(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let state = away_state_from(frame);
    match &state {
        AwayState::Present => {
            engine.send_numeric(conn, numerics::RPL_UNAWAY, &[], "You are no longer marked as being away");
        }
        _ => {
            engine.send_numeric(conn, numerics::RPL_NOWAWAY, &[], "You have been marked as being away");
        }
    }
    handlers::user::apply_away(engine, numeric, state.clone());
    let out = match &state {
        AwayState::Present => Frame::new("A").with_origin(numeric.to_string()),
        AwayState::Away(msg) => Frame::new("A")
            .with_origin(numeric.to_string())
            .with_trailing(msg.clone()),
        AwayState::AwayStar => Frame::new("A")
            .with_origin(numeric.to_string())
            .with_trailing("*"),
    };
    engine.broadcast_frame(&out, None);
}

// ----------------------------------------------------------------------
// Batches and multiline
// ----------------------------------------------------------------------

fn handle_batch_cmd(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(marker) = frame.param(0).map(str::to_owned) else {
        let reply = StandardReply::fail("BATCH", codes::NEED_MORE_PARAMS, "Not enough parameters");
        engine.send_reply(conn, &reply);
        return;
    };

    if let Some(id) = marker.strip_prefix('+') {
        let Some(batch_type) = frame.param(1).map(str::to_owned) else {
            let reply =
                StandardReply::fail("BATCH", codes::NEED_MORE_PARAMS, "Missing batch type");
            engine.send_reply(conn, &reply);
            return;
        };
        if batch_type != "draft/multiline" {
            let reply = StandardReply::fail("BATCH", codes::UNSUPPORTED_TYPE, "Unsupported batch type")
                .with_context(batch_type);
            engine.send_reply(conn, &reply);
            return;
        }
        let Some(target) = frame.param(2).map(str::to_owned) else {
            let reply =
                StandardReply::fail("BATCH", codes::NEED_MORE_PARAMS, "Missing batch target");
            engine.send_reply(conn, &reply);
            return;
        };
        let target_ok = if target.starts_with('#') || target.starts_with('&') {
            engine.net.channels.contains_key(&casefold(&target))
        } else {
            engine.net.numeric_by_nick(&target).is_some()
        };
        if !target_ok {
            let reply = StandardReply::fail(
                "BATCH",
                codes::MULTILINE_INVALID_TARGET,
                "No such target",
            )
            .with_context(target);
            engine.send_reply(conn, &reply);
            return;
        }

        let now = engine.now();
        let label = engine
            .clients
            .get(&conn)
            .and_then(|s| s.active_label.clone());
        let open_tags: Vec<Tag> = frame
            .tags
            .iter()
            .filter(|t| t.is_client_only())
            .cloned()
            .collect();
        let duplicate = engine
            .clients
            .get(&conn)
            .is_some_and(|s| s.batches.contains_key(id));
        if duplicate {
            let reply = StandardReply::fail("BATCH", codes::BATCH_ALREADY_OPEN, "Batch already open")
                .with_context(id.to_owned());
            engine.send_reply(conn, &reply);
            return;
        }
        let mut batch = ClientBatch::new(id.to_owned(), batch_type, target, now);
        batch.label = label;
        batch.open_tags = open_tags;
        if let Some(session) = engine.clients.get_mut(&conn) {
            session.batches.insert(id.to_owned(), batch);
        }
    } else if let Some(id) = marker.strip_prefix('-') {
        let Some(batch) = engine
            .clients
            .get_mut(&conn)
            .and_then(|s| s.batches.remove(id))
        else {
            let reply = StandardReply::fail("BATCH", codes::BATCH_ID_MISMATCH, "No such open batch")
                .with_context(id.to_owned());
            engine.send_reply(conn, &reply);
            return;
        };
        close_multiline_batch(engine, conn, batch);
    } else {
        let reply = StandardReply::fail("BATCH", codes::INVALID_PARAMS, "Bad batch marker");
        engine.send_reply(conn, &reply);
    }
}

fn batched_message(engine: &mut Engine, conn: ConnId, batch_id: &str, command: &str, frame: &Frame) {
    let target = frame.param(0).unwrap_or("").to_owned();
    let text = frame.trailing.clone().unwrap_or_default();
    let concat = frame.tags.iter().any(|t| t.key == "draft/multiline-concat");
    let client_tags: Vec<Tag> = frame
        .tags
        .iter()
        .filter(|t| t.is_client_only())
        .cloned()
        .collect();

    let max_bytes = engine.config.multiline.max_bytes;
    let max_lines = engine.config.multiline.max_lines;

    enum Violation {
        UnknownId,
        Target,
        Command,
        Bytes,
        Lines,
    }
    let violation = {
        let Some(session) = engine.clients.get_mut(&conn) else {
            return;
        };
        match session.batches.get_mut(batch_id) {
            None => Some(Violation::UnknownId),
            Some(batch) => {
                if casefold(&batch.target) != casefold(&target) {
                    Some(Violation::Target)
                } else if batch
                    .command
                    .as_deref()
                    .is_some_and(|c| !c.eq_ignore_ascii_case(command))
                {
                    Some(Violation::Command)
                } else if batch.bytes + text.len() > max_bytes {
                    Some(Violation::Bytes)
                } else if batch.lines.len() + 1 > max_lines {
                    Some(Violation::Lines)
                } else {
                    batch.command.get_or_insert_with(|| command.to_owned());
                    batch.bytes += text.len();
                    batch.lines.push(BatchLine {
                        text,
                        concat,
                        client_tags,
                    });
                    None
                }
            }
        }
    };

    let Some(violation) = violation else { return };
    let (code, description): (&'static str, &str) = match violation {
        Violation::UnknownId => (codes::INVALID_BATCH_ID, "Unknown batch id"),
        Violation::Target => (codes::MULTILINE_INVALID_TARGET, "Target does not match batch"),
        Violation::Command => (codes::MULTILINE_INVALID, "Mixed commands in batch"),
        Violation::Bytes => (codes::MULTILINE_MAX_BYTES, "Batch byte limit exceeded"),
        Violation::Lines => (codes::MULTILINE_MAX_LINES, "Batch line limit exceeded"),
    };
    // Limit violations void the whole batch.
    if matches!(violation, Violation::Bytes | Violation::Lines) {
        if let Some(session) = engine.clients.get_mut(&conn) {
            session.batches.remove(batch_id);
        }
    }
    let reply =
        StandardReply::fail("BATCH", code, description).with_context(batch_id.to_owned());
    engine.send_reply(conn, &reply);
}

fn close_multiline_batch(engine: &mut Engine, conn: ConnId, batch: ClientBatch) {
    if batch.lines.is_empty() {
        let reply = StandardReply::fail("BATCH", codes::MULTILINE_INVALID, "Empty batch")
            .with_context(batch.id);
        engine.send_reply(conn, &reply);
        return;
    }
    let Some(numeric) = session_user(engine, conn) else { return };

    let msgid = engine.msgids.next();
    let opened_at = batch.opened_at;
    let target = batch.target.clone();

    // Local fanout, excluding the sender unless echo-message applies.
    let echo = engine.caps_of(conn).contains(Capability::EchoMessage);
    handlers::multiline::fanout_local(
        engine,
        numeric,
        &target,
        &batch.lines,
        &msgid,
        (!echo).then_some(conn),
    );

    // Store the reassembled text as one history row.
    let storage = if target.starts_with('#') || target.starts_with('&') {
        Some(casefold(&target))
    } else {
        engine
            .net
            .users
            .get(&numeric)
            .map(|u| history::dm_target(&u.nick, &target))
    };
    if let (Some(storage), true) = (storage, engine.config.history.store != "none") {
        let sender = engine
            .net
            .users
            .get(&numeric)
            .map(|u| u.hostmask())
            .unwrap_or_default();
        let account = engine
            .net
            .users
            .get(&numeric)
            .and_then(|u| u.account().map(str::to_owned));
        let retention = std::time::Duration::from_secs(
            engine.config.history.retention_days as u64 * 86_400,
        );
        history::append(
            engine.kv.as_ref(),
            retention,
            &StoredMessage {
                msgid: msgid.clone(),
                ts_ms: engine.now_ms(),
                target: storage,
                sender,
                account,
                kind: MessageKind::Privmsg,
                text: batch.reassemble(),
            },
        );
    }

    handlers::multiline::emit_s2s(engine, numeric, &target, &batch.lines, opened_at);
}

/// Expire unclosed client batches and stalled inbound assemblies.
pub fn expire_batches(engine: &mut Engine, now: i64) {
    let mut expired: Vec<(ConnId, String)> = Vec::new();
    for session in engine.clients.values() {
        for batch in session.batches.values() {
            if now - batch.opened_at > BATCH_TIMEOUT {
                expired.push((session.conn, batch.id.clone()));
            }
        }
    }
    for (conn, id) in expired {
        if let Some(session) = engine.clients.get_mut(&conn) {
            session.batches.remove(&id);
        }
        let reply = StandardReply::fail("BATCH", codes::MULTILINE_INVALID, "Batch timed out")
            .with_context(id);
        engine.send_reply(conn, &reply);
    }
    handlers::multiline::expire(engine, now, BATCH_TIMEOUT);
}

// ----------------------------------------------------------------------
// IRCv3 command surface
// ----------------------------------------------------------------------

fn handle_chathistory(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let Some(sub) = frame.param(0).map(|s| s.to_uppercase()) else {
        let reply = StandardReply::fail("CHATHISTORY", codes::NEED_MORE_PARAMS, "Not enough parameters");
        engine.send_reply(conn, &reply);
        return;
    };

    if sub == "TARGETS" {
        handle_chathistory_targets(engine, conn, numeric, frame);
        return;
    }

    let Some(target) = frame.param(1).map(str::to_owned) else {
        let reply = StandardReply::fail("CHATHISTORY", codes::NEED_MORE_PARAMS, "Missing target");
        engine.send_reply(conn, &reply);
        return;
    };

    let parse_ref = |arg: Option<&str>| -> Result<MsgRef, ()> {
        arg.and_then(MsgRef::parse_client).ok_or(())
    };
    let (select, limit_at) = match sub.as_str() {
        "LATEST" => match frame.param(2) {
            Some("*") => (HistorySelect::Latest, 3),
            other => match parse_ref(other) {
                Ok(reference) => (HistorySelect::After(reference), 3),
                Err(()) => {
                    invalid_ref(engine, conn, &target);
                    return;
                }
            },
        },
        "BEFORE" => match parse_ref(frame.param(2)) {
            Ok(reference) => (HistorySelect::Before(reference), 3),
            Err(()) => {
                invalid_ref(engine, conn, &target);
                return;
            }
        },
        "AFTER" => match parse_ref(frame.param(2)) {
            Ok(reference) => (HistorySelect::After(reference), 3),
            Err(()) => {
                invalid_ref(engine, conn, &target);
                return;
            }
        },
        "AROUND" => match parse_ref(frame.param(2)) {
            Ok(reference) => (HistorySelect::Around(reference), 3),
            Err(()) => {
                invalid_ref(engine, conn, &target);
                return;
            }
        },
        "BETWEEN" => match (parse_ref(frame.param(2)), parse_ref(frame.param(3))) {
            (Ok(a), Ok(b)) => (HistorySelect::Between(a, b), 4),
            _ => {
                invalid_ref(engine, conn, &target);
                return;
            }
        },
        _ => {
            let reply = StandardReply::fail("CHATHISTORY", codes::INVALID_PARAMS, "Unknown subcommand")
                .with_context(sub);
            engine.send_reply(conn, &reply);
            return;
        }
    };
    let limit: usize = frame
        .param(limit_at)
        .and_then(|l| l.parse().ok())
        .unwrap_or(engine.config.history.max);

    // Channel history requires membership.
    let storage = if target.starts_with('#') || target.starts_with('&') {
        let folded = casefold(&target);
        let member = engine
            .net
            .users
            .get(&numeric)
            .is_some_and(|u| u.channels.contains(&folded));
        if !member {
            let reply = StandardReply::fail("CHATHISTORY", codes::INVALID_TARGET, "Not on that channel")
                .with_context(target);
            engine.send_reply(conn, &reply);
            return;
        }
        folded
    } else {
        let own = engine
            .net
            .users
            .get(&numeric)
            .map(|u| u.nick.clone())
            .unwrap_or_default();
        history::dm_target(&own, &target)
    };

    handlers::chathistory::client_request(engine, conn, &target, &storage, select, limit);
}

fn invalid_ref(engine: &mut Engine, conn: ConnId, target: &str) {
    let reply = StandardReply::fail(
        "CHATHISTORY",
        codes::INVALID_MSGREFTYPE,
        "References are *, timestamp=<unix>, or msgid=<id>",
    )
    .with_context(target.to_owned());
    engine.send_reply(conn, &reply);
}

fn handle_chathistory_targets(engine: &mut Engine, conn: ConnId, numeric: UserNumeric, frame: &Frame) {
    let (from, to) = match (
        frame.param(1).and_then(MsgRef::parse_client),
        frame.param(2).and_then(MsgRef::parse_client),
    ) {
        (Some(MsgRef::Timestamp(a)), Some(MsgRef::Timestamp(b))) => (a * 1000, b * 1000),
        _ => {
            invalid_ref(engine, conn, "*");
            return;
        }
    };
    let limit: usize = frame
        .param(3)
        .and_then(|l| l.parse().ok())
        .unwrap_or(engine.config.history.max);

    let (channels, own_nick) = match engine.net.users.get(&numeric) {
        Some(u) => (u.channels.clone(), u.nick.clone()),
        None => return,
    };
    let mut targets: Vec<(String, i64)> = Vec::new();
    for folded in &channels {
        let rows = history::load(engine.kv.as_ref(), folded);
        if let Some(last) = rows.last() {
            if last.ts_ms >= from && last.ts_ms < to {
                let display = engine
                    .net
                    .channels
                    .get(folded)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| folded.clone());
                targets.push((display, last.ts_ms));
            }
        }
    }
    let own_folded = casefold(&own_nick);
    if let Ok(rows) = engine.kv.scan("hist:") {
        let mut seen = std::collections::HashSet::new();
        for (key, _) in rows {
            let Some(rest) = key.strip_prefix("hist:") else { continue };
            let Some((target, _)) = rest.split_once(':') else { continue };
            if !target.contains(',') || !seen.insert(target.to_owned()) {
                continue;
            }
            let (a, b) = target.split_once(',').unwrap_or((target, ""));
            if a != own_folded && b != own_folded {
                continue;
            }
            let other = if a == own_folded { b } else { a };
            let rows = history::load(engine.kv.as_ref(), target);
            if let Some(last) = rows.last() {
                if last.ts_ms >= from && last.ts_ms < to {
                    targets.push((other.to_owned(), last.ts_ms));
                }
            }
        }
    }
    targets.sort_by_key(|(_, ts)| *ts);
    targets.truncate(limit);

    let batched = engine.caps_of(conn).contains(Capability::Batch);
    let batch_id = engine.next_batch_id();
    if batched {
        let open = ClientMsg::new(engine.server_name(), "BATCH")
            .with_param(format!("+{batch_id}"))
            .with_param("draft/chathistory-targets");
        engine.send_labeled(conn, &open);
    }
    for (target, ts) in targets {
        let mut msg = ClientMsg::new(engine.server_name(), "CHATHISTORY")
            .with_param("TARGETS")
            .with_param(target)
            .with_param(tagging::format_server_time(ts));
        if batched {
            msg.tags.push(Tag::new("batch", batch_id.clone()));
        }
        engine.send_msg(conn, &msg);
    }
    if batched {
        let close =
            ClientMsg::new(engine.server_name(), "BATCH").with_param(format!("-{batch_id}"));
        engine.send_msg(conn, &close);
    }
}

fn handle_metadata(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let (Some(target), Some(sub)) = (
        frame.param(0).map(str::to_owned),
        frame.param(1).map(|s| s.to_uppercase()),
    ) else {
        let reply = StandardReply::fail("METADATA", codes::NEED_MORE_PARAMS, "Not enough parameters");
        engine.send_reply(conn, &reply);
        return;
    };
    match sub.as_str() {
        "GET" => {
            let keys: Vec<String> = frame.params.iter().skip(2).cloned().collect();
            if keys.is_empty() {
                let reply = StandardReply::fail("METADATA", codes::NEED_MORE_PARAMS, "Missing key");
                engine.send_reply(conn, &reply);
                return;
            }
            for key in keys {
                handlers::metadata::client_get(engine, conn, &target, &key);
            }
        }
        "LIST" => handlers::metadata::client_list(engine, conn, &target),
        "SET" => {
            let Some(key) = frame.param(2).map(str::to_owned) else {
                let reply = StandardReply::fail("METADATA", codes::NEED_MORE_PARAMS, "Missing key");
                engine.send_reply(conn, &reply);
                return;
            };
            let visibility = match frame.param(3) {
                Some("P") => Visibility::Private,
                _ => Visibility::Public,
            };
            handlers::metadata::client_set(
                engine,
                conn,
                &target,
                &key,
                frame.trailing.as_deref(),
                visibility,
            );
        }
        "CLEAR" => {
            let Some(key) = frame.param(2).map(str::to_owned) else {
                let reply = StandardReply::fail("METADATA", codes::NEED_MORE_PARAMS, "Missing key");
                engine.send_reply(conn, &reply);
                return;
            };
            handlers::metadata::client_set(engine, conn, &target, &key, None, Visibility::Public);
        }
        _ => {
            let reply = StandardReply::fail("METADATA", codes::INVALID_PARAMS, "Unknown subcommand")
                .with_context(sub);
            engine.send_reply(conn, &reply);
        }
    }
}

fn handle_markread(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(target) = frame.param(0).map(str::to_owned) else {
        let reply = StandardReply::fail("MARKREAD", codes::NEED_MORE_PARAMS, "Not enough parameters");
        engine.send_reply(conn, &reply);
        return;
    };
    match frame.param(1) {
        None => handlers::markread::client_get(engine, conn, &target),
        Some(stamp) => {
            let Some(iso) = stamp.strip_prefix("timestamp=") else {
                let reply = StandardReply::fail("MARKREAD", codes::INVALID_PARAMS, "Bad timestamp")
                    .with_context(target);
                engine.send_reply(conn, &reply);
                return;
            };
            match chrono::DateTime::parse_from_rfc3339(iso) {
                Ok(ts) => {
                    handlers::markread::client_set(engine, conn, &target, ts.timestamp_millis());
                }
                Err(_) => {
                    let reply =
                        StandardReply::fail("MARKREAD", codes::INVALID_PARAMS, "Bad timestamp")
                            .with_context(target);
                    engine.send_reply(conn, &reply);
                }
            }
        }
    }
}

fn handle_register_cmd(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let (Some(account), Some(email)) = (frame.param(0).map(str::to_owned), frame.param(1).map(str::to_owned))
    else {
        let reply = StandardReply::fail("REGISTER", codes::NEED_MORE_PARAMS, "Not enough parameters");
        engine.send_reply(conn, &reply);
        return;
    };
    let Some(password) = frame
        .param(2)
        .map(str::to_owned)
        .or_else(|| frame.trailing.clone())
    else {
        let reply = StandardReply::fail("REGISTER", codes::NEED_MORE_PARAMS, "Missing password");
        engine.send_reply(conn, &reply);
        return;
    };
    handlers::registration::client_register(engine, conn, &account, &email, &password);
}

fn handle_verify_cmd(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let (Some(account), Some(code)) = (frame.param(0).map(str::to_owned), frame.param(1).map(str::to_owned))
    else {
        let reply = StandardReply::fail("VERIFY", codes::NEED_MORE_PARAMS, "Not enough parameters");
        engine.send_reply(conn, &reply);
        return;
    };
    handlers::registration::client_verify(engine, conn, &account, &code);
}

fn handle_setname(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let Some(realname) = frame
        .trailing
        .clone()
        .or_else(|| frame.param(0).map(str::to_owned))
    else {
        let reply = StandardReply::fail("SETNAME", codes::INVALID_PARAMS, "Missing realname");
        engine.send_reply(conn, &reply);
        return;
    };
    handlers::setname::apply_setname(engine, numeric, &realname);
    let out = Frame::new("SE")
        .with_origin(numeric.to_string())
        .with_trailing(User::clamp_realname(&realname));
    engine.broadcast_frame(&out, None);
}

fn handle_rename(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let (Some(old), Some(new)) = (frame.param(0).map(str::to_owned), frame.param(1).map(str::to_owned))
    else {
        let reply = StandardReply::fail("RENAME", codes::NEED_MORE_PARAMS, "Not enough parameters");
        engine.send_reply(conn, &reply);
        return;
    };
    let reason = frame.trailing.clone().unwrap_or_default();
    handlers::rename::client_request(engine, conn, numeric, &old, &new, &reason);
}

fn handle_redact(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    let Some(numeric) = session_user(engine, conn) else { return };
    let (Some(target), Some(msgid)) = (frame.param(0).map(str::to_owned), frame.param(1).map(str::to_owned))
    else {
        let reply = StandardReply::fail("REDACT", codes::NEED_MORE_PARAMS, "Not enough parameters");
        engine.send_reply(conn, &reply);
        return;
    };
    let reason = frame.trailing.clone().unwrap_or_default();
    handlers::redact::client_request(engine, conn, numeric, &target, &msgid, &reason);
}

fn handle_webpush(engine: &mut Engine, conn: ConnId, frame: &Frame) {
    match frame.param(0).map(|s| s.to_uppercase()).as_deref() {
        Some("REGISTER") => {
            let (Some(endpoint), Some(p256dh), Some(auth)) = (
                frame.param(1).map(str::to_owned),
                frame.param(2).map(str::to_owned),
                frame.param(3).map(str::to_owned),
            ) else {
                let reply =
                    StandardReply::fail("WEBPUSH", codes::NEED_MORE_PARAMS, "Not enough parameters");
                engine.send_reply(conn, &reply);
                return;
            };
            handlers::webpush::client_register(engine, conn, &endpoint, &p256dh, &auth);
        }
        Some("UNREGISTER") => {
            let Some(endpoint) = frame.param(1).map(str::to_owned) else {
                let reply =
                    StandardReply::fail("WEBPUSH", codes::NEED_MORE_PARAMS, "Missing endpoint");
                engine.send_reply(conn, &reply);
                return;
            };
            handlers::webpush::client_unregister(engine, conn, &endpoint);
        }
        _ => {
            let reply = StandardReply::fail("WEBPUSH", codes::INVALID_PARAMS, "Unknown subcommand");
            engine.send_reply(conn, &reply);
        }
    }
}

// ----------------------------------------------------------------------
// Matching
// ----------------------------------------------------------------------

/// Classic IRC mask matching: `*` and `?` wildcards, case-insensitive.
pub fn mask_match(mask: &str, subject: &str) -> bool {
    fn inner(mask: &[u8], subject: &[u8]) -> bool {
        match (mask.first(), subject.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&mask[1..], subject)
                    || (!subject.is_empty() && inner(mask, &subject[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&mask[1..], &subject[1..]),
            (Some(m), Some(s)) if m.eq_ignore_ascii_case(s) => inner(&mask[1..], &subject[1..]),
            _ => false,
        }
    }
    inner(mask.as_bytes(), subject.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_matching() {
        assert!(mask_match("*!*@*.example", "nick!user@host.example"));
        assert!(mask_match("alice!*@*", "Alice!u@h"));
        assert!(mask_match("a?c!*@*", "abc!x@y"));
        assert!(!mask_match("*!*@other.example", "nick!user@host.example"));
        assert!(mask_match("*", "anything"));
    }
}
