//! `WP` - webpush: VAPID broadcast, subscription register/unregister,
//! push requests and error relay.

use tracing::{debug, info, warn};

use kestrel_p10::reply::{codes, StandardReply};
use kestrel_p10::{Frame, UserNumeric};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::services::webpush::{self, endpoint_hash, Subscription};
use crate::state::{ConnId, LinkId};
use crate::store::ns;
use crate::tagging::ClientMsg;

/// Dispatch entry for `WP`.
pub fn handle(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    match frame.param(0) {
        Some("V") => {
            let key = frame.trailing.clone().ok_or(HandlerError::NeedMoreParams)?;
            info!("VAPID key announced");
            engine.services.vapid = Some(key);
            engine.broadcast_frame(frame, Some(link));
            Ok(())
        }
        Some("R") | Some("U") => {
            // Subscription changes are owned by services; forward.
            if !engine.send_to_services(frame.clone()) {
                debug!("webpush change with no services peer dropped");
            }
            Ok(())
        }
        Some("P") => handle_push(engine, link, frame),
        Some("E") => handle_error(engine, frame),
        _ => Err(HandlerError::InvalidParams("bad WP subcommand".to_owned())),
    }
}

/// `WP P <account> :<message>` - push to every stored subscription of
/// the account.
fn handle_push(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let account = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let payload = frame.trailing.clone().unwrap_or_default();

    let rows = engine
        .kv
        .scan(&ns::webpush_prefix(&account))
        .unwrap_or_default();
    for (_, raw) in rows {
        match serde_json::from_str::<Subscription>(&raw) {
            Ok(subscription) => {
                webpush::spawn_delivery(
                    engine.events.clone(),
                    account.clone(),
                    subscription,
                    payload.clone(),
                );
            }
            Err(e) => warn!(error = %e, "corrupt webpush subscription"),
        }
    }
    // Other cores may hold subscriptions for the same account.
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// `WP E <user> <code> :<msg>` - error for a user's registration.
fn handle_error(engine: &mut Engine, frame: &Frame) -> HandlerResult {
    let user: UserNumeric = frame
        .param(1)
        .ok_or(HandlerError::NeedMoreParams)?
        .parse()
        .map_err(|e| HandlerError::InvalidParams(format!("bad user: {e}")))?;
    if user.server != engine.net.me {
        engine.send_to_server(user.server, frame);
        return Ok(());
    }
    let Some(conn) = engine.net.users.get(&user).and_then(|u| u.conn) else {
        return Ok(());
    };
    let message = frame.trailing.clone().unwrap_or_default();
    let reply = StandardReply::warn("WEBPUSH", codes::TEMPORARILY_UNAVAILABLE, message);
    engine.send_reply(conn, &reply);
    Ok(())
}

/// Client `WEBPUSH REGISTER <endpoint> <p256dh> <auth>` - validation
/// runs off-engine; the outcome arrives as an event.
pub fn client_register(
    engine: &mut Engine,
    conn: ConnId,
    endpoint: &str,
    p256dh: &str,
    auth: &str,
) {
    webpush::spawn_validation(
        engine.events.clone(),
        conn,
        endpoint.to_owned(),
        p256dh.to_owned(),
        auth.to_owned(),
    );
}

/// Client `WEBPUSH UNREGISTER <endpoint>`.
pub fn client_unregister(engine: &mut Engine, conn: ConnId, endpoint: &str) {
    let Some(account) = account_of(engine, conn) else {
        return;
    };
    let _ = engine
        .kv
        .delete(&ns::webpush(&account, &endpoint_hash(endpoint)));
    if let Some(user) = engine.clients.get(&conn).and_then(|s| s.user) {
        let frame = Frame::new("WP")
            .with_origin(engine.me_str())
            .with_param("U")
            .with_param(user.to_string())
            .with_param(endpoint.to_owned());
        engine.send_to_services(frame);
    }
    let msg = ClientMsg::new(engine.server_name(), "WEBPUSH").with_param("UNREGISTERED");
    engine.send_labeled(conn, &msg);
}

/// Validation outcome from the offload task.
pub fn on_validated(
    engine: &mut Engine,
    conn: ConnId,
    subscription: Subscription,
    result: Result<(), String>,
) {
    if let Err(reason) = result {
        let reply = StandardReply::fail("WEBPUSH", codes::INVALID_ENDPOINT, reason)
            .with_context(subscription.endpoint);
        engine.send_reply(conn, &reply);
        return;
    }
    let Some(account) = account_of(engine, conn) else {
        let reply = StandardReply::fail(
            "WEBPUSH",
            codes::INVALID_PARAMS,
            "Log in before registering push subscriptions",
        );
        engine.send_reply(conn, &reply);
        return;
    };

    let key = ns::webpush(&account, &endpoint_hash(&subscription.endpoint));
    match serde_json::to_string(&subscription) {
        Ok(raw) => {
            if let Err(e) = engine.kv.put(&key, &raw, None) {
                warn!(error = %e, "webpush subscription persist failed");
            }
        }
        Err(e) => warn!(error = %e, "webpush subscription serialize failed"),
    }

    if let Some(user) = engine.clients.get(&conn).and_then(|s| s.user) {
        let frame = Frame::new("WP")
            .with_origin(engine.me_str())
            .with_param("R")
            .with_param(user.to_string())
            .with_param(subscription.endpoint.clone())
            .with_param(subscription.p256dh.clone())
            .with_param(subscription.auth.clone());
        engine.send_to_services(frame);
    }
    let msg = ClientMsg::new(engine.server_name(), "WEBPUSH").with_param("REGISTERED");
    engine.send_labeled(conn, &msg);
}

/// Delivery outcome from the offload task; dead endpoints drop their
/// subscription.
pub fn on_delivered(
    engine: &mut Engine,
    account: &str,
    endpoint: &str,
    result: Result<u16, String>,
) {
    match result {
        Ok(status) if status == 404 || status == 410 => {
            info!(account = %account, "webpush endpoint gone, dropping subscription");
            let _ = engine.kv.delete(&ns::webpush(account, &endpoint_hash(endpoint)));
        }
        Ok(status) if status < 300 => {
            debug!(account = %account, status, "webpush delivered");
        }
        Ok(status) => warn!(account = %account, status, "webpush rejected"),
        Err(e) => warn!(account = %account, error = %e, "webpush failed"),
    }
}

fn account_of(engine: &Engine, conn: ConnId) -> Option<String> {
    engine
        .clients
        .get(&conn)
        .and_then(|s| s.user)
        .and_then(|u| engine.net.users.get(&u))
        .and_then(|u| u.account().map(str::to_owned))
}
