//! `SA` - the SASL relay between local clients and services.
//!
//! Wire shape: `SA <session> <sub> …` where `<session>` is a pending
//! request id (prefixed by the origin server numeric, which is how
//! answers route home) and `<sub>` is one of `S`tart, `H`ost info,
//! `C`ontinue, `D`one, `L`ogin, `M`echanisms, `I`mpersonate. The `M`
//! broadcast uses `*` as its session and rewrites the advertised
//! `sasl=` value.

use tracing::{debug, info};

use kestrel_p10::reply::numerics;
use kestrel_p10::{Capability, Frame, ServerNumeric};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::services::sasl::{chunk_payload, SaslPhase};
use crate::state::{ConnId, LinkId, PendingKind};
use crate::tagging::ClientMsg;

/// Dispatch entry for `SA`.
pub fn handle(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let session = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let sub = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();

    if session == "*" && sub == "M" {
        let mechs = frame.trailing.clone().unwrap_or_default();
        info!(mechs = %mechs, "SASL mechanism list updated");
        engine.services.mechs = mechs;
        announce_sasl_value(engine);
        engine.broadcast_frame(frame, Some(link));
        return Ok(());
    }

    // Answers route home by the session id's server prefix.
    if let Some(prefix) = session.get(..2) {
        if let Ok(owner) = prefix.parse::<ServerNumeric>() {
            if owner != engine.net.me && engine.net.servers.contains_key(&owner) {
                engine.send_to_server(owner, frame);
                return Ok(());
            }
        }
    }

    let Some(conn) = conn_for_session(engine, &session) else {
        debug!(session = %session, "SASL answer for unknown session dropped");
        return Ok(());
    };

    match sub.as_str() {
        "C" => {
            let payload = frame.trailing.clone().unwrap_or_default();
            if let Some(s) = engine.clients.get_mut(&conn) {
                s.sasl.phase = SaslPhase::Collecting;
            }
            for chunk in chunk_payload(&payload) {
                let msg = ClientMsg::new(engine.server_name(), "AUTHENTICATE").with_param(chunk);
                engine.send_msg(conn, &msg);
            }
        }
        "L" => {
            let account = frame.param(2).ok_or(HandlerError::NeedMoreParams)?.to_owned();
            login(engine, conn, &account);
        }
        "I" => {
            // Impersonation: services attach the session to an account
            // it vouches for.
            let account = frame.param(2).ok_or(HandlerError::NeedMoreParams)?.to_owned();
            login(engine, conn, &account);
        }
        "D" => {
            let outcome = frame.param(2).unwrap_or("F");
            finish(engine, conn, &session, outcome);
        }
        _ => {
            return Err(HandlerError::InvalidParams(format!(
                "bad SA subcommand {sub}"
            )));
        }
    }
    Ok(())
}

fn conn_for_session(engine: &Engine, session: &str) -> Option<ConnId> {
    engine
        .clients
        .values()
        .find(|s| s.sasl.reqid.as_deref() == Some(session))
        .map(|s| s.conn)
}

fn login(engine: &mut Engine, conn: ConnId, account: &str) {
    let mask = engine
        .clients
        .get(&conn)
        .map(|s| {
            s.user
                .and_then(|u| engine.net.users.get(&u))
                .map(|u| u.hostmask())
                .unwrap_or_else(|| format!("{}!*@*", s.reply_nick()))
        })
        .unwrap_or_default();
    if let Some(session) = engine.clients.get_mut(&conn) {
        session.account = Some(account.to_owned());
    }
    engine.send_numeric(
        conn,
        numerics::RPL_LOGGEDIN,
        &[&mask, account],
        &format!("You are now logged in as {account}"),
    );

    // Mid-session re-authentication updates the live user too.
    let user = engine.clients.get(&conn).and_then(|s| s.user);
    if let Some(numeric) = user {
        super::user::apply_account(engine, numeric, Some(account));
        let frame = Frame::new("AC")
            .with_origin(engine.me_str())
            .with_param(numeric.to_string())
            .with_param("R")
            .with_param(account.to_owned());
        engine.broadcast_frame(&frame, None);
    }
}

fn finish(engine: &mut Engine, conn: ConnId, session_id: &str, outcome: &str) {
    engine.pending.take(session_id);
    if let Some(session) = engine.clients.get_mut(&conn) {
        session.sasl.finish();
    }
    match outcome {
        "S" => {
            engine.send_numeric(
                conn,
                numerics::RPL_SASLSUCCESS,
                &[],
                "SASL authentication successful",
            );
        }
        "A" => {
            engine.send_numeric(
                conn,
                numerics::ERR_SASLABORTED,
                &[],
                "SASL authentication aborted",
            );
        }
        _ => {
            engine.send_numeric(
                conn,
                numerics::ERR_SASLFAIL,
                &[],
                "SASL authentication failed",
            );
        }
    }
}

/// Client `AUTHENTICATE` - mechanism selection, payload chunks, and
/// the `*` abort.
pub fn client_authenticate(engine: &mut Engine, conn: ConnId, arg: &str) {
    let caps_ok = engine.caps_of(conn).contains(Capability::Sasl);
    if !caps_ok {
        engine.send_numeric(conn, numerics::ERR_SASLFAIL, &[], "SASL not negotiated");
        return;
    }

    let in_flight = engine
        .clients
        .get(&conn)
        .is_some_and(|s| s.sasl.in_flight());

    if arg == "*" {
        // Abort: tell services when a session is open, answer 906
        // either way; the current account is untouched.
        let reqid = engine
            .clients
            .get(&conn)
            .and_then(|s| s.sasl.reqid.clone());
        if let Some(reqid) = reqid {
            let abort = Frame::new("SA")
                .with_origin(engine.me_str())
                .with_param(reqid.clone())
                .with_param("C")
                .with_trailing("*");
            engine.send_to_services(abort);
            engine.pending.take(&reqid);
        }
        if let Some(session) = engine.clients.get_mut(&conn) {
            session.sasl.abort();
        }
        engine.send_numeric(
            conn,
            numerics::ERR_SASLABORTED,
            &[],
            "SASL authentication aborted",
        );
        return;
    }

    if in_flight {
        // Payload chunk toward services.
        let complete = engine
            .clients
            .get_mut(&conn)
            .and_then(|s| s.sasl.push_chunk(arg));
        if let Some(payload) = complete {
            let reqid = engine
                .clients
                .get(&conn)
                .and_then(|s| s.sasl.reqid.clone())
                .unwrap_or_default();
            let cont = Frame::new("SA")
                .with_origin(engine.me_str())
                .with_param(reqid)
                .with_param("C")
                .with_trailing(payload);
            engine.send_to_services(cont);
        }
        return;
    }

    // Mechanism selection; a completed session may re-authenticate.
    let mechanism = arg.to_uppercase();
    if engine.services.mechs.is_empty() || !engine.services.available() {
        engine.send_numeric(
            conn,
            numerics::ERR_SASLFAIL,
            &[],
            "SASL authentication unavailable",
        );
        return;
    }
    if !engine
        .services
        .mechs
        .split(',')
        .any(|m| m.eq_ignore_ascii_case(&mechanism))
    {
        let mechs = engine.services.mechs.clone();
        engine.send_numeric(
            conn,
            numerics::RPL_SASLMECHS,
            &[&mechs],
            "are available SASL mechanisms",
        );
        engine.send_numeric(conn, numerics::ERR_SASLFAIL, &[], "Unknown SASL mechanism");
        return;
    }

    let timeout = engine.config.metadata.services_timeout_secs as i64 * 4;
    let now = engine.now();
    let reqid = engine.pending.create(conn, PendingKind::Sasl, now, timeout);
    let begun = engine
        .clients
        .get_mut(&conn)
        .is_some_and(|s| s.sasl.begin(&mechanism, reqid.clone()));
    if !begun {
        engine.send_numeric(
            conn,
            numerics::ERR_SASLALREADY,
            &[],
            "SASL authentication already in progress",
        );
        engine.pending.take(&reqid);
        return;
    }

    let (host, ip) = engine
        .clients
        .get(&conn)
        .map(|s| (s.host.clone(), s.ip.clone()))
        .unwrap_or_default();
    let start = Frame::new("SA")
        .with_origin(engine.me_str())
        .with_param(reqid.clone())
        .with_param("S")
        .with_param(mechanism);
    engine.send_to_services(start);
    let host_info = Frame::new("SA")
        .with_origin(engine.me_str())
        .with_param(reqid)
        .with_param("H")
        .with_param(host)
        .with_param(if ip.is_empty() { "*".to_owned() } else { ip });
    engine.send_to_services(host_info);
}

/// Advertise the current `sasl=` value to `cap-notify` clients.
fn announce_sasl_value(engine: &mut Engine) {
    let value = engine.services.mechs.clone();
    let conns: Vec<ConnId> = engine
        .clients
        .values()
        .filter(|s| s.caps.contains(Capability::CapNotify))
        .map(|s| s.conn)
        .collect();
    for conn in conns {
        let line = if value.is_empty() {
            ClientMsg::new(engine.server_name(), "CAP")
                .with_param("*")
                .with_param("DEL")
                .with_trailing("sasl")
        } else {
            ClientMsg::new(engine.server_name(), "CAP")
                .with_param("*")
                .with_param("NEW")
                .with_trailing(format!("sasl={value}"))
        };
        engine.send_msg(conn, &line);
    }
}
