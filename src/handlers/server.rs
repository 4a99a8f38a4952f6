//! Link bring-up, burst, and server lifecycle: `PASS`/`SERVER`
//! handshake, `S` introductions, `SQ` cascades, `EB`/`EA`, `G`/`Z`.

use std::collections::HashMap;

use tracing::{debug, info};

use kestrel_p10::{casefold, Frame, OriginMode, ServerNumeric, Tag};

use crate::engine::{Engine, LinkPhase};
use crate::error::{HandlerError, HandlerResult};
use crate::state::{BurstState, ConnId, LinkId, Server};
use crate::tagging::{server_time_now, ClientMsg};

/// The protocol revision we speak on links.
const LINK_PROTOCOL: &str = "J10";

/// Begin the handshake on a connection we initiated.
pub fn start_outbound_handshake(engine: &mut Engine, link: LinkId) {
    let Some(l) = engine.links.get(&link) else {
        return;
    };
    let Some(block) = l.outbound.clone() else {
        return;
    };
    let pass = format!("PASS :{}", block.password);
    let server = our_server_line(engine);
    if let Some(l) = engine.links.get_mut(&link) {
        let _ = l.tx.try_send(pass);
        let _ = l.tx.try_send(server);
        l.phase = LinkPhase::AwaitPass;
        l.name = block.name.clone();
    }
}

fn our_server_line(engine: &Engine) -> String {
    format!(
        "SERVER {} 1 {} {} {} {}]]] :{}",
        engine.config.server.name,
        engine.start_ts,
        chrono::Utc::now().timestamp(),
        LINK_PROTOCOL,
        engine.config.server.numeric,
        engine.config.server.description
    )
}

/// Handle a line while the link is still in handshake.
pub fn handle_handshake_line(engine: &mut Engine, link: LinkId, line: &str) {
    let frame = match Frame::parse(line, OriginMode::Client) {
        Ok(frame) => frame,
        Err(e) => {
            engine.close_link(link, &format!("Protocol error: {e}"));
            return;
        }
    };
    match frame.token.as_str() {
        "PASS" => {
            let offered = frame
                .trailing
                .clone()
                .or_else(|| frame.params.first().cloned())
                .unwrap_or_default();
            if let Some(l) = engine.links.get_mut(&link) {
                // Verified against the link block once SERVER names the peer.
                l.name = offered;
                l.phase = LinkPhase::AwaitServer;
            }
        }
        "SERVER" => {
            if let Err(e) = admit_peer(engine, link, &frame) {
                let reason = match e {
                    HandlerError::CloseLink(r) => r,
                    other => other.to_string(),
                };
                engine.close_link(link, &reason);
            }
        }
        "ERROR" => {
            let reason = frame.trailing.unwrap_or_default();
            engine.teardown_link(link, &format!("Remote error: {reason}"));
        }
        other => {
            engine.close_link(link, &format!("Unexpected {other} during handshake"));
        }
    }
}

/// Admit the directly-connected peer from its `SERVER` line.
fn admit_peer(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let (server, flags) = parse_server_frame(frame)?;

    let offered_pass = engine
        .links
        .get(&link)
        .map(|l| l.name.clone())
        .unwrap_or_default();
    let was_outbound = engine
        .links
        .get(&link)
        .is_some_and(|l| l.outbound.is_some());

    let block = engine
        .config
        .links
        .iter()
        .find(|b| b.name.eq_ignore_ascii_case(&server.name))
        .cloned();
    let Some(block) = block else {
        return Err(HandlerError::CloseLink(format!(
            "No link block for {}",
            server.name
        )));
    };
    if !was_outbound && block.password != offered_pass {
        return Err(HandlerError::CloseLink("Bad link password".to_owned()));
    }

    if engine.net.servers.contains_key(&server.numeric) {
        // Admitting either side twice would fork the numeric space.
        return Err(HandlerError::CloseLink(format!(
            "Server numeric collision: {}",
            server.numeric
        )));
    }

    let numeric = server.numeric;
    let name = server.name.clone();
    let mut admitted = server;
    admitted.hops = 1;
    admitted.uplink = Some(engine.net.me);
    admitted.via = Some(link);
    admitted.burst = BurstState::Bursting;
    admitted.is_services = flags.contains('s') || engine.services.matches(&name, false);
    engine.net.servers.insert(numeric, admitted);
    let me = engine.net.me;
    if let Some(own) = engine.net.servers.get_mut(&me) {
        own.downlinks.insert(numeric);
    }

    if let Some(l) = engine.links.get_mut(&link) {
        l.phase = LinkPhase::Linked;
        l.server = Some(numeric);
        l.name = name.clone();
        l.pass_ok = true;
    }

    info!(link, peer = %name, numeric = %numeric, "server link admitted");

    if !was_outbound {
        // Inbound: answer with our own credentials before bursting.
        let pass = format!("PASS :{}", block.password);
        let server_line = our_server_line(engine);
        if let Some(l) = engine.links.get(&link) {
            let _ = l.tx.try_send(pass);
            let _ = l.tx.try_send(server_line);
        }
    }

    engine.services.resolve(&engine.net);
    send_burst(engine, link);

    // Introduce the new peer to the rest of the network.
    let frame = server_intro_frame(engine, numeric);
    engine.broadcast_frame(&frame, Some(link));
    Ok(())
}

/// Parse either the handshake `SERVER` line or an in-burst `S` frame
/// into a server record plus its flag string.
fn parse_server_frame(frame: &Frame) -> Result<(Server, String), HandlerError> {
    if frame.params.len() < 6 {
        return Err(HandlerError::NeedMoreParams);
    }
    let name = frame.params[0].clone();
    let hops: u32 = frame.params[1]
        .parse()
        .map_err(|_| HandlerError::InvalidParams("bad hop count".to_owned()))?;
    let start_ts: i64 = frame.params[2]
        .parse()
        .map_err(|_| HandlerError::InvalidParams("bad start timestamp".to_owned()))?;
    let link_ts: i64 = frame.params[3]
        .parse()
        .map_err(|_| HandlerError::InvalidParams("bad link timestamp".to_owned()))?;
    // params[4] is the protocol revision; accepted as-is.
    let numeric_field = &frame.params[5];
    let numeric: ServerNumeric = numeric_field
        .get(..2)
        .ok_or_else(|| HandlerError::InvalidParams("short numeric".to_owned()))?
        .parse()
        .map_err(|e| HandlerError::InvalidParams(format!("bad numeric: {e}")))?;
    let flags = frame
        .params
        .get(6)
        .filter(|p| p.starts_with('+'))
        .cloned()
        .unwrap_or_default();

    let mut server = Server::new(
        numeric,
        name,
        frame.trailing.clone().unwrap_or_default(),
    );
    server.hops = hops;
    server.start_ts = start_ts;
    server.link_ts = link_ts;
    Ok((server, flags))
}

fn server_intro_frame(engine: &Engine, numeric: ServerNumeric) -> Frame {
    let server = &engine.net.servers[&numeric];
    let uplink = server.uplink.unwrap_or(engine.net.me);
    let mut frame = Frame::new("S")
        .with_origin(uplink.to_string())
        .with_param(server.name.clone())
        .with_param((server.hops + 1).to_string())
        .with_param(server.start_ts.to_string())
        .with_param(server.link_ts.to_string())
        .with_param(LINK_PROTOCOL)
        .with_param(format!("{}]]]", server.numeric));
    if server.is_services {
        frame = frame.with_param("+s");
    }
    frame.trailing = Some(server.description.clone());
    frame
}

/// Burst our authoritative view down a fresh link: server subtree,
/// user introductions, channel states, then `EB`.
pub fn send_burst(engine: &mut Engine, link: LinkId) {
    let behind_link: Option<ServerNumeric> =
        engine.links.get(&link).and_then(|l| l.server);

    // (a) servers, ours first, excluding the peer's own side
    let mut servers: Vec<ServerNumeric> = engine
        .net
        .servers
        .values()
        .filter(|s| s.numeric != engine.net.me && Some(s.numeric) != behind_link)
        .map(|s| s.numeric)
        .collect();
    servers.sort_by_key(|n| engine.net.servers[n].hops);
    for numeric in servers {
        let frame = server_intro_frame(engine, numeric);
        engine.send_link_frame(link, &frame);
    }

    // (c) user introductions
    let users: Vec<Frame> = engine
        .net
        .users
        .values()
        .filter(|u| Some(u.numeric.server) != behind_link)
        .map(|u| crate::handlers::nick::introduction_frame(u))
        .collect();
    for frame in users {
        engine.send_link_frame(link, &frame);
    }

    // (d) channel states, with metadata follow-ups
    let me = engine.me_str();
    let channels: Vec<Frame> = engine
        .net
        .channels
        .values()
        .map(|c| {
            let mut frame = crate::handlers::channel::burst_frame(c);
            frame.origin = Some(me.clone());
            frame
        })
        .collect();
    for frame in channels {
        engine.send_link_frame(link, &frame);
    }
    if engine.config.metadata.burst {
        let now = engine.now();
        let mut follow_ups = Vec::new();
        for channel in engine.net.channels.values() {
            for (key, entry) in engine.metadata.all_for(&channel.name, now) {
                follow_ups.push(crate::handlers::metadata::md_frame(
                    &engine.me_str(),
                    &channel.name,
                    &key,
                    &entry,
                ));
            }
        }
        for frame in follow_ups {
            engine.send_link_frame(link, &frame);
        }
    }

    // (e) end of burst
    let eb = Frame::new("EB").with_origin(engine.me_str());
    engine.send_link_frame(link, &eb);
    debug!(link, "burst sent");
}

/// `S` - a remote server introduces another server behind it.
pub fn handle_server(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let origin = origin_server(engine, frame)?;
    let (server, flags) = parse_server_frame(frame)?;
    if engine.net.servers.contains_key(&server.numeric) {
        return Err(HandlerError::CloseLink(format!(
            "Server numeric collision: {}",
            server.numeric
        )));
    }
    let numeric = server.numeric;
    let name = server.name.clone();
    let mut admitted = server;
    admitted.uplink = Some(origin);
    admitted.via = Some(link);
    admitted.burst = BurstState::Done;
    admitted.is_services = flags.contains('s') || engine.services.matches(&name, false);
    engine.net.servers.insert(numeric, admitted);
    if let Some(up) = engine.net.servers.get_mut(&origin) {
        up.downlinks.insert(numeric);
    }
    engine.services.resolve(&engine.net);
    info!(server = %name, numeric = %numeric, via = %origin, "server introduced");

    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// `SQ` - remove a server and everything behind it.
pub fn handle_squit(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let target = frame.param(0).ok_or(HandlerError::NeedMoreParams)?;
    let reason = frame.trailing.clone().unwrap_or_default();
    let numeric = resolve_server(engine, target)
        .ok_or_else(|| HandlerError::UnknownTarget(target.to_owned()))?;
    if numeric == engine.net.me {
        return Err(HandlerError::CloseLink("SQUIT names ourselves".to_owned()));
    }
    squit_cascade(engine, numeric, &reason, Some(link));
    Ok(())
}

fn resolve_server(engine: &Engine, target: &str) -> Option<ServerNumeric> {
    if let Ok(numeric) = target.parse::<ServerNumeric>() {
        if engine.net.servers.contains_key(&numeric) {
            return Some(numeric);
        }
    }
    engine
        .net
        .servers
        .values()
        .find(|s| s.name.eq_ignore_ascii_case(target))
        .map(|s| s.numeric)
}

/// Remove `root` and its subtree: quit every user behind it inside a
/// `netsplit` batch, prune the tree, and propagate the squit.
pub fn squit_cascade(
    engine: &mut Engine,
    root: ServerNumeric,
    reason: &str,
    from_link: Option<LinkId>,
) {
    let subtree = engine.net.subtree(root);
    let users = engine.net.users_on(&subtree);
    let split_name = {
        let uplink = engine
            .net
            .servers
            .get(&root)
            .and_then(|s| s.uplink)
            .and_then(|u| engine.net.servers.get(&u))
            .map(|s| s.name.clone())
            .unwrap_or_else(|| engine.config.server.name.clone());
        let root_name = engine
            .net
            .servers
            .get(&root)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| root.to_string());
        format!("{uplink} {root_name}")
    };
    info!(root = %root, users = users.len(), reason = %reason, "squit cascade");

    // Quit every user behind the split, bracketed per-client in a
    // netsplit batch for batch-capable recipients.
    let mut open_batches: HashMap<ConnId, String> = HashMap::new();
    let mut accounts = Vec::new();
    for numeric in &users {
        let Some(user) = engine.net.users.get(numeric) else {
            continue;
        };
        let hostmask = user.hostmask();
        if let Some(account) = user.account() {
            accounts.push(account.to_owned());
        }
        let recipients = engine.net.common_channel_conns(*numeric);
        for (_, conn) in recipients {
            let batch_capable = engine
                .caps_of(conn)
                .contains(kestrel_p10::Capability::Batch);
            let batch_id = if batch_capable {
                Some(match open_batches.get(&conn) {
                    Some(id) => id.clone(),
                    None => {
                        let id = engine.next_batch_id();
                        let open = ClientMsg::new(engine.server_name(), "BATCH")
                            .with_param(format!("+{id}"))
                            .with_param("netsplit")
                            .with_param(split_name.clone());
                        engine.send_msg(conn, &open);
                        open_batches.insert(conn, id.clone());
                        id
                    }
                })
            } else {
                None
            };
            let mut quit =
                ClientMsg::new(hostmask.clone(), "QUIT").with_trailing(split_name.clone());
            quit.tags.push(Tag::new("time", server_time_now()));
            if let Some(id) = batch_id {
                quit.tags.push(Tag::new("batch", id));
            }
            engine.send_msg(conn, &quit);
        }
        engine.net.remove_user(*numeric);
    }
    for (conn, id) in open_batches {
        let close = ClientMsg::new(engine.server_name(), "BATCH").with_param(format!("-{id}"));
        engine.send_msg(conn, &close);
    }

    // Prune the tree.
    for numeric in &subtree {
        engine.net.servers.remove(numeric);
    }
    let uplinks: Vec<ServerNumeric> = engine.net.servers.keys().copied().collect();
    for numeric in uplinks {
        if let Some(server) = engine.net.servers.get_mut(&numeric) {
            server.downlinks.retain(|d| !subtree.contains(d));
        }
    }

    accounts.sort();
    accounts.dedup();
    for account in accounts {
        crate::handlers::user::refresh_presence(engine, &account);
    }

    if engine.services.resolve(&engine.net) {
        info!(available = engine.services.available(), "services peer changed");
    }

    let frame = Frame::new("SQ")
        .with_origin(engine.me_str())
        .with_param(root.to_string())
        .with_param("0")
        .with_trailing(reason.to_owned());
    engine.broadcast_frame(&frame, from_link);
}

/// `EB` - the peer finished bursting.
pub fn handle_end_of_burst(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let origin = origin_server(engine, frame)?;
    if let Some(server) = engine.net.servers.get_mut(&origin) {
        server.burst = BurstState::Done;
        server.junction = false;
    }
    info!(server = %origin, "end of burst");
    let ea = Frame::new("EA").with_origin(engine.me_str());
    engine.send_link_frame(link, &ea);
    // Services may have come up with this burst: replay parked writes.
    if engine.services.resolve(&engine.net) || engine.services.available() {
        let parked = engine.services.drain();
        for frame in parked {
            engine.send_to_services(frame);
        }
    }
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// `EA` - the peer acknowledged our burst.
pub fn handle_eob_ack(engine: &mut Engine, _link: LinkId, frame: &Frame) -> HandlerResult {
    let origin = origin_server(engine, frame)?;
    debug!(server = %origin, "burst acknowledged");
    Ok(())
}

/// `G` - ping; echo back as `Z`.
pub fn handle_ping(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let echoed = frame
        .params
        .first()
        .cloned()
        .or_else(|| frame.origin.clone())
        .unwrap_or_default();
    let me = engine.me_str();
    let pong = Frame::new("Z")
        .with_origin(me.clone())
        .with_param(me)
        .with_param(echoed);
    engine.send_link_frame(link, &pong);
    Ok(())
}

/// `Z` - pong; liveness was already refreshed on receipt.
pub fn handle_pong(_engine: &mut Engine, link: LinkId, _frame: &Frame) -> HandlerResult {
    debug!(link, "pong");
    Ok(())
}

/// Resolve a frame's origin as a server numeric; user origins resolve
/// to their owning server.
pub fn origin_server(engine: &Engine, frame: &Frame) -> Result<ServerNumeric, HandlerError> {
    let origin = frame
        .origin
        .as_deref()
        .ok_or_else(|| HandlerError::InvalidParams("missing origin".to_owned()))?;
    if let Ok(server) = origin.parse::<ServerNumeric>() {
        if engine.net.servers.contains_key(&server) {
            return Ok(server);
        }
        return Err(HandlerError::UnknownOrigin(origin.to_owned()));
    }
    if let Ok(user) = origin.parse::<kestrel_p10::UserNumeric>() {
        if engine.net.users.contains_key(&user) {
            return Ok(user.server);
        }
    }
    Err(HandlerError::UnknownOrigin(origin.to_owned()))
}

/// Casefolded helper shared by handlers that accept channel targets.
pub fn require_channel(engine: &Engine, name: &str) -> Result<String, HandlerError> {
    let folded = casefold(name);
    if engine.net.channels.contains_key(&folded) {
        Ok(folded)
    } else {
        Err(HandlerError::UnknownTarget(name.to_owned()))
    }
}
