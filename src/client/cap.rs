//! The capability engine: `CAP LS/LIST/REQ/END` and value advertising.

use kestrel_p10::{caps::ALL_CAPABILITIES, Capability};

use crate::engine::Engine;
use crate::state::ConnId;
use crate::tagging::ClientMsg;

use super::RegState;

/// Cap listings wrap at this many bytes per line.
const LS_LINE_LIMIT: usize = 400;

/// The advertised value for a capability, when it has one.
pub fn cap_value(engine: &Engine, cap: Capability) -> Option<String> {
    match cap {
        Capability::Sasl => {
            let mechs = &engine.services.mechs;
            (!mechs.is_empty()).then(|| mechs.clone())
        }
        Capability::Multiline => Some(format!(
            "max-bytes={},max-lines={}",
            engine.config.multiline.max_bytes, engine.config.multiline.max_lines
        )),
        Capability::Chathistory => {
            let mode = match engine.config.history.pm_consent {
                crate::config::PmConsent::Global => "global",
                crate::config::PmConsent::Single => "single",
                crate::config::PmConsent::Multi => "multi",
            };
            Some(format!("pm={mode}"))
        }
        Capability::AccountRegistration => Some("before-connect,custom-account-name".to_owned()),
        _ => None,
    }
}

/// All configuration-enabled capabilities, with 302 values when asked.
fn listing(engine: &Engine, with_values: bool) -> Vec<String> {
    ALL_CAPABILITIES
        .iter()
        .filter(|cap| engine.enabled_caps.contains(**cap))
        .map(|cap| {
            if with_values {
                match cap_value(engine, *cap) {
                    Some(value) => format!("{}={}", cap.name(), value),
                    None => cap.name().to_owned(),
                }
            } else {
                cap.name().to_owned()
            }
        })
        .collect()
}

/// Handle one `CAP` command from a client.
pub fn handle(engine: &mut Engine, conn: ConnId, params: &[String], trailing: Option<&str>) {
    let sub = params
        .first()
        .map(|s| s.to_uppercase())
        .unwrap_or_default();
    match sub.as_str() {
        "LS" => {
            let version: u32 = params
                .get(1)
                .and_then(|v| v.parse().ok())
                .unwrap_or(301);
            if let Some(session) = engine.clients.get_mut(&conn) {
                session.cap_version = session.cap_version.max(version);
                if session.state != RegState::Registered {
                    session.state = RegState::CapNegotiating;
                }
            }
            let caps = listing(engine, version >= 302);
            send_listing(engine, conn, "LS", &caps);
        }
        "LIST" => {
            let enabled: Vec<String> = engine
                .caps_of(conn)
                .iter()
                .map(|c| c.name().to_owned())
                .collect();
            send_listing(engine, conn, "LIST", &enabled);
        }
        "REQ" => {
            let request = trailing
                .map(str::to_owned)
                .or_else(|| params.get(1).cloned())
                .unwrap_or_default();
            handle_req(engine, conn, &request);
        }
        "END" => {
            let ready = {
                if let Some(session) = engine.clients.get_mut(&conn) {
                    if session.state == RegState::CapNegotiating {
                        session.state = RegState::Initial;
                    }
                    session.ready_to_register()
                } else {
                    false
                }
            };
            if ready {
                super::commands::complete_registration(engine, conn);
            }
        }
        _ => {
            let nick = reply_nick(engine, conn);
            let msg = ClientMsg::new(engine.server_name(), "410")
                .with_param(nick)
                .with_param(sub)
                .with_trailing("Invalid CAP command");
            engine.send_msg(conn, &msg);
        }
    }
}

/// `CAP REQ` is atomic: every item recognized, enabled and correctly
/// signed, or the whole request is NAK'd.
fn handle_req(engine: &mut Engine, conn: ConnId, request: &str) {
    let mut to_enable = Vec::new();
    let mut to_disable = Vec::new();
    let mut ok = true;
    for item in request.split(' ').filter(|s| !s.is_empty()) {
        let (removing, name) = match item.strip_prefix('-') {
            Some(name) => (true, name),
            None => (false, item),
        };
        match Capability::from_name(name) {
            Some(cap) if engine.enabled_caps.contains(cap) => {
                if removing {
                    to_disable.push(cap);
                } else {
                    to_enable.push(cap);
                }
            }
            _ => {
                ok = false;
                break;
            }
        }
    }

    let nick = reply_nick(engine, conn);
    let verb = if ok { "ACK" } else { "NAK" };
    if ok {
        if let Some(session) = engine.clients.get_mut(&conn) {
            for cap in to_enable {
                session.caps.insert(cap);
            }
            for cap in to_disable {
                session.caps.remove(cap);
            }
            if session.state != RegState::Registered {
                session.state = RegState::CapNegotiating;
            }
        }
    }
    let msg = ClientMsg::new(engine.server_name(), "CAP")
        .with_param(nick)
        .with_param(verb)
        .with_trailing(request.to_owned());
    engine.send_msg(conn, &msg);
}

/// Multi-line listings: every line but the last carries a `*` marker.
fn send_listing(engine: &mut Engine, conn: ConnId, verb: &str, caps: &[String]) {
    let nick = reply_nick(engine, conn);
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    for cap in caps {
        if !current.is_empty() && current.len() + cap.len() + 1 > LS_LINE_LIMIT {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(cap);
    }
    lines.push(current);

    let last = lines.len() - 1;
    for (i, line) in lines.into_iter().enumerate() {
        let mut msg = ClientMsg::new(engine.server_name(), "CAP")
            .with_param(nick.clone())
            .with_param(verb);
        if i != last {
            msg = msg.with_param("*");
        }
        msg = msg.with_trailing(line);
        engine.send_msg(conn, &msg);
    }
}

fn reply_nick(engine: &Engine, conn: ConnId) -> String {
    engine
        .clients
        .get(&conn)
        .map(|s| s.reply_nick().to_owned())
        .unwrap_or_else(|| "*".to_owned())
}
