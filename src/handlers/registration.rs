//! `RG`/`VF`/`RR` - account registration and verification, relayed to
//! services.
//!
//! The request id rides in the `RR` user slot so registration works
//! before connection registration completes (no user numeric exists
//! yet at that point).

use tracing::debug;

use kestrel_p10::reply::{codes, numerics, StandardReply};
use kestrel_p10::{Frame, ServerNumeric};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::state::{ConnId, LinkId, PendingKind};
use crate::tagging::ClientMsg;

/// `RG` in transit toward services: forward.
pub fn handle_register(engine: &mut Engine, _link: LinkId, frame: &Frame) -> HandlerResult {
    if !engine.send_to_services(frame.clone()) {
        debug!("register request with no services peer dropped");
    }
    Ok(())
}

/// `VF` in transit toward services: forward.
pub fn handle_verify(engine: &mut Engine, _link: LinkId, frame: &Frame) -> HandlerResult {
    if !engine.send_to_services(frame.clone()) {
        debug!("verify request with no services peer dropped");
    }
    Ok(())
}

/// `RR <server> <reqid> <OK|VERIFY|FAIL> [<code>] :<msg>` - services
/// answer a registration or verification.
pub fn handle_reply(engine: &mut Engine, _link: LinkId, frame: &Frame) -> HandlerResult {
    if frame.params.len() < 3 {
        return Err(HandlerError::NeedMoreParams);
    }
    let server: ServerNumeric = frame.params[0]
        .parse()
        .map_err(|e| HandlerError::InvalidParams(format!("bad server: {e}")))?;
    if server != engine.net.me {
        engine.send_to_server(server, frame);
        return Ok(());
    }
    let reqid = frame.params[1].clone();
    let result = frame.params[2].clone();
    let code = frame.params.get(3).cloned();
    let message = frame
        .trailing
        .clone()
        .unwrap_or_else(|| "Registration processed".to_owned());

    let Some(request) = engine.pending.take(&reqid) else {
        debug!(reqid = %reqid, "late registration reply dropped");
        return Ok(());
    };
    let (account, was_verify) = match request.kind {
        PendingKind::Register { account } => (account, false),
        PendingKind::Verify { account } => (account, true),
        _ => return Ok(()),
    };
    let conn = request.conn;
    let command = if was_verify { "VERIFY" } else { "REGISTER" };

    match result.as_str() {
        "OK" => {
            let msg = ClientMsg::new(engine.server_name(), command)
                .with_param("SUCCESS")
                .with_param(account.clone())
                .with_trailing(message);
            engine.send_labeled(conn, &msg);
            complete_login(engine, conn, &account);
        }
        "VERIFY" => {
            let msg = ClientMsg::new(engine.server_name(), command)
                .with_param("VERIFICATION_REQUIRED")
                .with_param(account)
                .with_trailing(message);
            engine.send_labeled(conn, &msg);
        }
        _ => {
            let code: &'static str = match code.as_deref() {
                Some("ACCOUNT_EXISTS") => codes::ACCOUNT_EXISTS,
                Some("BAD_ACCOUNT_NAME") => codes::BAD_ACCOUNT_NAME,
                Some("ACCOUNT_NAME_MUST_BE_NICK") => codes::ACCOUNT_NAME_MUST_BE_NICK,
                Some("WEAK_PASSWORD") => codes::WEAK_PASSWORD,
                Some("INVALID_EMAIL") => codes::INVALID_EMAIL,
                Some("INVALID_CODE") => codes::INVALID_CODE,
                _ => codes::TEMPORARILY_UNAVAILABLE,
            };
            let reply = StandardReply::fail(command, code, message).with_context(account);
            engine.send_reply(conn, &reply);
        }
    }
    Ok(())
}

/// After a successful register/verify the session is logged in.
fn complete_login(engine: &mut Engine, conn: ConnId, account: &str) {
    let user = engine.clients.get(&conn).and_then(|s| s.user);
    match user {
        Some(numeric) => {
            super::user::apply_account(engine, numeric, Some(account));
            let frame = Frame::new("AC")
                .with_origin(engine.me_str())
                .with_param(numeric.to_string())
                .with_param("R")
                .with_param(account.to_owned());
            engine.broadcast_frame(&frame, None);
            let mask = match engine.net.users.get(&numeric) {
                Some(u) => u.hostmask(),
                None => return,
            };
            engine.send_numeric(
                conn,
                numerics::RPL_LOGGEDIN,
                &[&mask, account],
                &format!("You are now logged in as {account}"),
            );
        }
        None => {
            // Before-connect registration: remember for the welcome.
            if let Some(session) = engine.clients.get_mut(&conn) {
                session.account = Some(account.to_owned());
            }
        }
    }
}

/// Client `REGISTER <account> {<email>|*} <password>`.
pub fn client_register(
    engine: &mut Engine,
    conn: ConnId,
    account: &str,
    email: &str,
    password: &str,
) {
    let nick = engine
        .clients
        .get(&conn)
        .map(|s| s.reply_nick().to_owned())
        .unwrap_or_else(|| "*".to_owned());
    let account = if account == "*" { nick.clone() } else { account.to_owned() };

    if account == "*" || account.is_empty() {
        let reply = StandardReply::fail("REGISTER", codes::NEED_NICK, "Pick a nickname first")
            .with_context("*");
        engine.send_reply(conn, &reply);
        return;
    }
    if password.len() < 6 {
        let reply = StandardReply::fail("REGISTER", codes::WEAK_PASSWORD, "Password too short")
            .with_context(account);
        engine.send_reply(conn, &reply);
        return;
    }
    if email != "*" && !email.contains('@') {
        let reply = StandardReply::fail("REGISTER", codes::INVALID_EMAIL, "Invalid email")
            .with_context(account);
        engine.send_reply(conn, &reply);
        return;
    }
    if !engine.services.available() {
        let reply = StandardReply::fail(
            "REGISTER",
            codes::TEMPORARILY_UNAVAILABLE,
            "Account services unavailable",
        )
        .with_context(account);
        engine.send_reply(conn, &reply);
        return;
    }

    let timeout = engine.config.metadata.services_timeout_secs as i64;
    let now = engine.now();
    let reqid = engine.pending.create(
        conn,
        PendingKind::Register {
            account: account.clone(),
        },
        now,
        timeout,
    );
    let frame = Frame::new("RG")
        .with_origin(engine.me_str())
        .with_param(reqid)
        .with_param(account)
        .with_param(email.to_owned())
        .with_trailing(password.to_owned());
    engine.send_to_services(frame);
}

/// Client `VERIFY <account> <code>`.
pub fn client_verify(engine: &mut Engine, conn: ConnId, account: &str, code: &str) {
    if !engine.services.available() {
        let reply = StandardReply::fail(
            "VERIFY",
            codes::TEMPORARILY_UNAVAILABLE,
            "Account services unavailable",
        )
        .with_context(account.to_owned());
        engine.send_reply(conn, &reply);
        return;
    }
    let timeout = engine.config.metadata.services_timeout_secs as i64;
    let now = engine.now();
    let reqid = engine.pending.create(
        conn,
        PendingKind::Verify {
            account: account.to_owned(),
        },
        now,
        timeout,
    );
    let frame = Frame::new("VF")
        .with_origin(engine.me_str())
        .with_param(reqid)
        .with_param(account.to_owned())
        .with_param(code.to_owned());
    engine.send_to_services(frame);
}
