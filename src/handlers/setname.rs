//! `SE` - realname changes.

use kestrel_p10::{Capability, Frame, UserNumeric};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::state::{LinkId, User};
use crate::tagging::ClientMsg;

/// Dispatch entry for `SE`.
pub fn handle(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let origin = frame
        .origin
        .as_deref()
        .ok_or_else(|| HandlerError::InvalidParams("missing origin".to_owned()))?;
    let who: UserNumeric = origin
        .parse()
        .map_err(|_| HandlerError::UnknownOrigin(origin.to_owned()))?;
    if !engine.net.users.contains_key(&who) {
        return Err(HandlerError::UnknownOrigin(origin.to_owned()));
    }
    let realname = frame.trailing.clone().ok_or(HandlerError::NeedMoreParams)?;
    apply_setname(engine, who, &realname);
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// Truncate, store, and notify `setname`-capable watchers. Shared with
/// the client SETNAME command.
pub fn apply_setname(engine: &mut Engine, who: UserNumeric, realname: &str) {
    let clamped = User::clamp_realname(realname);
    let (hostmask, own_conn) = match engine.net.users.get_mut(&who) {
        Some(user) => {
            user.realname = clamped.clone();
            (user.hostmask(), user.conn)
        }
        None => return,
    };
    let msg = ClientMsg::new(hostmask, "SETNAME").with_trailing(clamped);
    engine.fanout_common(who, &msg, Some(Capability::Setname));
    if let Some(conn) = own_conn {
        if engine.caps_of(conn).contains(Capability::Setname) {
            engine.send_msg(conn, &msg);
        }
    }
}
