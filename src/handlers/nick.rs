//! `N` - nick introductions and nick changes, with timestamp-based
//! collision resolution.

use tracing::{debug, info};

use kestrel_p10::mode::IntroModes;
use kestrel_p10::{Frame, ServerNumeric, UserNumeric};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::state::{AwayState, LinkId, User};
use crate::tagging::ClientMsg;

/// Who loses a nick collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionVerdict {
    /// The newly-introduced user is killed.
    KillIncoming,
    /// The already-known user is killed.
    KillExisting,
    /// Equal timestamps: both are killed.
    KillBoth,
}

/// The collision rule: differing `user@host` kills the later nick-TS;
/// equal `user@host` kills the earlier; equal timestamps kill both.
pub fn resolve_collision(
    existing_userhost: &str,
    existing_ts: i64,
    incoming_userhost: &str,
    incoming_ts: i64,
) -> CollisionVerdict {
    if existing_ts == incoming_ts {
        return CollisionVerdict::KillBoth;
    }
    let same_identity = existing_userhost == incoming_userhost;
    let incoming_is_later = incoming_ts > existing_ts;
    if same_identity {
        // Same person reconnecting: the older session dies.
        if incoming_is_later {
            CollisionVerdict::KillExisting
        } else {
            CollisionVerdict::KillIncoming
        }
    } else if incoming_is_later {
        CollisionVerdict::KillIncoming
    } else {
        CollisionVerdict::KillExisting
    }
}

/// Dispatch entry for `N`.
pub fn handle(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let origin = frame
        .origin
        .as_deref()
        .ok_or_else(|| HandlerError::InvalidParams("missing origin".to_owned()))?;
    if let Ok(server) = origin.parse::<ServerNumeric>() {
        handle_introduction(engine, link, server, frame)
    } else if let Ok(user) = origin.parse::<UserNumeric>() {
        handle_nick_change(engine, link, user, frame)
    } else {
        Err(HandlerError::UnknownOrigin(origin.to_owned()))
    }
}

fn handle_introduction(
    engine: &mut Engine,
    link: LinkId,
    server: ServerNumeric,
    frame: &Frame,
) -> HandlerResult {
    let n = frame.params.len();
    if n < 7 {
        return Err(HandlerError::NeedMoreParams);
    }
    if !engine.net.servers.contains_key(&server) {
        return Err(HandlerError::UnknownOrigin(server.to_string()));
    }
    let nick = frame.params[0].clone();
    let nick_ts: i64 = frame.params[2]
        .parse()
        .map_err(|_| HandlerError::InvalidParams("bad nick timestamp".to_owned()))?;
    let ident = frame.params[3].clone();
    let host = frame.params[4].clone();
    let numeric: UserNumeric = frame.params[n - 1]
        .parse()
        .map_err(|e| HandlerError::InvalidParams(format!("bad user numeric: {e}")))?;
    let ip = frame.params[n - 2].clone();
    let realname = frame.trailing.clone().unwrap_or_default();

    if numeric.server != server {
        return Err(HandlerError::InvalidParams(
            "numeric does not match introducing server".to_owned(),
        ));
    }
    if engine.net.users.contains_key(&numeric) {
        return Err(HandlerError::InvalidParams(format!(
            "duplicate user numeric {numeric}"
        )));
    }

    let middle = &frame.params[5..n - 2];
    let modes = if middle.is_empty() {
        IntroModes::default()
    } else {
        let modestr = &middle[0];
        if !modestr.starts_with('+') {
            return Err(HandlerError::InvalidParams("bad mode string".to_owned()));
        }
        let mut carrier = middle[1..].iter().map(String::as_str);
        IntroModes::parse(modestr, &mut carrier)
            .map_err(|e| HandlerError::InvalidParams(e.to_string()))?
    };

    // Collision check against the nick index.
    let incoming_userhost = format!("{ident}@{host}");
    if let Some(existing) = engine.net.numeric_by_nick(&nick) {
        let (existing_userhost, existing_ts) = {
            let user = &engine.net.users[&existing];
            (user.userhost(), user.nick_ts)
        };
        let verdict =
            resolve_collision(&existing_userhost, existing_ts, &incoming_userhost, nick_ts);
        info!(nick = %nick, ?verdict, "nick collision");
        match verdict {
            CollisionVerdict::KillIncoming => {
                send_kill(engine, numeric, "Nick collision", None);
                return Ok(());
            }
            CollisionVerdict::KillExisting => {
                kill_user(engine, existing, "Nick collision", None);
            }
            CollisionVerdict::KillBoth => {
                kill_user(engine, existing, "Nick collision", None);
                send_kill(engine, numeric, "Nick collision", None);
                return Ok(());
            }
        }
    }

    let user = User {
        numeric,
        nick,
        ident,
        host,
        realname: User::clamp_realname(&realname),
        nick_ts,
        connect_ts: nick_ts,
        ip,
        modes,
        channels: Default::default(),
        away: AwayState::Present,
        conn: None,
    };
    debug!(numeric = %numeric, nick = %user.nick, "user introduced");
    engine.net.insert_user(user);

    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

fn handle_nick_change(
    engine: &mut Engine,
    link: LinkId,
    who: UserNumeric,
    frame: &Frame,
) -> HandlerResult {
    let new_nick = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let ts: i64 = frame
        .param(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(|| engine.now());

    if !engine.net.users.contains_key(&who) {
        return Err(HandlerError::UnknownOrigin(who.to_string()));
    }

    // A rename onto an occupied nick collides like an introduction.
    if let Some(holder) = engine.net.numeric_by_nick(&new_nick) {
        if holder != who {
            let (holder_userhost, holder_ts) = {
                let user = &engine.net.users[&holder];
                (user.userhost(), user.nick_ts)
            };
            let changer_userhost = engine.net.users[&who].userhost();
            let verdict = resolve_collision(&holder_userhost, holder_ts, &changer_userhost, ts);
            info!(nick = %new_nick, ?verdict, "nick-change collision");
            match verdict {
                CollisionVerdict::KillIncoming => {
                    kill_user(engine, who, "Nick collision", None);
                    return Ok(());
                }
                CollisionVerdict::KillExisting => {
                    kill_user(engine, holder, "Nick collision", None);
                }
                CollisionVerdict::KillBoth => {
                    kill_user(engine, holder, "Nick collision", None);
                    kill_user(engine, who, "Nick collision", None);
                    return Ok(());
                }
            }
        }
    }

    apply_nick_change(engine, who, &new_nick, ts);
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

/// Rename a user and notify local watchers; shared with the client
/// NICK command.
pub fn apply_nick_change(engine: &mut Engine, who: UserNumeric, new_nick: &str, ts: i64) {
    let Some(user) = engine.net.users.get(&who) else {
        return;
    };
    let hostmask = user.hostmask();
    let own_conn = user.conn;
    let msg = ClientMsg::new(hostmask, "NICK").with_trailing(new_nick.to_owned());
    engine.fanout_common(who, &msg, None);
    if let Some(conn) = own_conn {
        engine.send_msg(conn, &msg);
    }
    engine.net.rename_user(who, new_nick, ts);
}

/// Remove a user we know about because a collision (or an inbound kill)
/// took them; fans out locally and floods the kill.
pub fn kill_user(
    engine: &mut Engine,
    numeric: UserNumeric,
    reason: &str,
    except: Option<LinkId>,
) {
    let was_local = engine
        .net
        .users
        .get(&numeric)
        .is_some_and(|u| u.is_local());
    let conn = engine.net.users.get(&numeric).and_then(|u| u.conn);
    engine.quit_user(numeric, &format!("Killed ({reason})"), false, None);
    if was_local {
        if let Some(conn) = conn {
            if let Some(session) = engine.clients.get_mut(&conn) {
                session.user = None;
            }
            engine.teardown_client(conn, reason);
        }
    }
    send_kill(engine, numeric, reason, except);
}

/// Flood a kill so it reaches the loser's owning server.
fn send_kill(engine: &mut Engine, numeric: UserNumeric, reason: &str, except: Option<LinkId>) {
    let frame = Frame::new("K")
        .with_origin(engine.me_str())
        .with_param(numeric.to_string())
        .with_trailing(reason.to_owned());
    engine.broadcast_frame(&frame, except);
}

/// The burst/introduction frame for a user.
pub fn introduction_frame(user: &User) -> Frame {
    let mut frame = Frame::new("N")
        .with_origin(user.numeric.server.to_string())
        .with_param(user.nick.clone())
        .with_param("1")
        .with_param(user.nick_ts.to_string())
        .with_param(user.ident.clone())
        .with_param(user.host.clone());
    let (modestr, carriers) = user.modes.to_wire();
    if modestr != "+" {
        frame = frame.with_param(modestr);
        for c in carriers {
            frame = frame.with_param(c);
        }
    }
    frame
        .with_param(user.ip.clone())
        .with_param(user.numeric.to_string())
        .with_trailing(user.realname.clone())
}

/// Client-side nick validity.
pub fn valid_nick(nick: &str, max_len: usize) -> bool {
    if nick.is_empty() || nick.len() > max_len {
        return false;
    }
    let mut chars = nick.chars();
    let first = chars.next().unwrap_or(' ');
    let first_ok = first.is_ascii_alphabetic() || "[]\\`_^{|}".contains(first);
    first_ok
        && nick
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "[]\\`_^{|}-".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn different_identity_later_ts_loses() {
        assert_eq!(
            resolve_collision("u@h1", 100, "u@h2", 200),
            CollisionVerdict::KillIncoming
        );
        assert_eq!(
            resolve_collision("u@h1", 100, "u@h2", 50),
            CollisionVerdict::KillExisting
        );
    }

    #[test]
    fn same_identity_earlier_ts_loses() {
        assert_eq!(
            resolve_collision("u@h", 100, "u@h", 200),
            CollisionVerdict::KillExisting
        );
        assert_eq!(
            resolve_collision("u@h", 200, "u@h", 100),
            CollisionVerdict::KillIncoming
        );
    }

    #[test]
    fn equal_ts_kills_both() {
        assert_eq!(
            resolve_collision("u@h1", 100, "u@h2", 100),
            CollisionVerdict::KillBoth
        );
        assert_eq!(
            resolve_collision("u@h", 100, "u@h", 100),
            CollisionVerdict::KillBoth
        );
    }

    #[test]
    fn nick_validity() {
        assert!(valid_nick("alice", 30));
        assert!(valid_nick("[away]", 30));
        assert!(!valid_nick("1alice", 30));
        assert!(!valid_nick("", 30));
        assert!(!valid_nick("with space", 30));
        assert!(!valid_nick("toolongnick", 8));
    }
}
