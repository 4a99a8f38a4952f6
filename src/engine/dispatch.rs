//! Token dispatch for server links.

use tracing::{debug, warn};

use kestrel_p10::{Frame, OriginMode, Token};

use crate::error::HandlerError;
use crate::handlers;
use crate::state::LinkId;

use super::{Engine, LinkPhase};

/// Handle one raw line from a server link.
pub fn on_link_line(engine: &mut Engine, link: LinkId, line: &str) {
    let phase = match engine.links.get(&link) {
        Some(l) => l.phase,
        None => return,
    };

    if phase != LinkPhase::Linked {
        handlers::server::handle_handshake_line(engine, link, line);
        return;
    }

    let frame = match Frame::parse(line, OriginMode::Server) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(link, error = %e, "frame error, closing link");
            engine.close_link(link, &format!("Protocol error: {e}"));
            return;
        }
    };

    if frame.token == "ERROR" {
        let reason = frame.trailing.clone().unwrap_or_default();
        engine.teardown_link(link, &format!("Remote error: {reason}"));
        return;
    }
    // Late SERVER spellings from peers that introduce subtrees verbosely.
    if frame.token == "SERVER" {
        let mut aliased = frame;
        aliased.token = "S".to_owned();
        on_link_frame(engine, link, aliased);
        return;
    }

    on_link_frame(engine, link, frame);
}

/// Dispatch a parsed frame to its token handler.
pub fn on_link_frame(engine: &mut Engine, link: LinkId, frame: Frame) {
    let Some(token) = Token::from_wire(&frame.token) else {
        // Forward compatibility: unknown tokens are logged and dropped.
        warn!(link, token = %frame.token, "ignoring unknown token");
        return;
    };

    let result = match token {
        Token::Ping => handlers::server::handle_ping(engine, link, &frame),
        Token::Pong => handlers::server::handle_pong(engine, link, &frame),
        Token::Server => handlers::server::handle_server(engine, link, &frame),
        Token::Squit => handlers::server::handle_squit(engine, link, &frame),
        Token::EndOfBurst => handlers::server::handle_end_of_burst(engine, link, &frame),
        Token::EobAck => handlers::server::handle_eob_ack(engine, link, &frame),
        Token::Nick => handlers::nick::handle(engine, link, &frame),
        Token::Quit => handlers::user::handle_quit(engine, link, &frame),
        Token::Kick => handlers::channel::handle_kick(engine, link, &frame),
        Token::Join => handlers::channel::handle_join(engine, link, &frame),
        Token::Part => handlers::channel::handle_part(engine, link, &frame),
        Token::Mode => handlers::channel::handle_mode(engine, link, &frame),
        Token::Burst => handlers::channel::handle_burst(engine, link, &frame),
        Token::Privmsg => handlers::message::handle_privmsg(engine, link, &frame),
        Token::Notice => handlers::message::handle_notice(engine, link, &frame),
        Token::Tagmsg => handlers::message::handle_tagmsg(engine, link, &frame),
        Token::Account => handlers::user::handle_account(engine, link, &frame),
        Token::Fakehost => handlers::user::handle_fakehost(engine, link, &frame),
        Token::Invite => handlers::user::handle_invite(engine, link, &frame),
        Token::Away => handlers::user::handle_away(engine, link, &frame),
        Token::Setname => handlers::setname::handle(engine, link, &frame),
        Token::Batch => handlers::batch::handle(engine, link, &frame),
        Token::Chathistory => handlers::chathistory::handle(engine, link, &frame),
        Token::Redact => handlers::redact::handle(engine, link, &frame),
        Token::Register => handlers::registration::handle_register(engine, link, &frame),
        Token::Verify => handlers::registration::handle_verify(engine, link, &frame),
        Token::RegReply => handlers::registration::handle_reply(engine, link, &frame),
        Token::MarkRead => handlers::markread::handle(engine, link, &frame),
        Token::Rename => handlers::rename::handle(engine, link, &frame),
        Token::Metadata => handlers::metadata::handle_md(engine, link, &frame),
        Token::MetadataQuery => handlers::metadata::handle_mdq(engine, link, &frame),
        Token::Webpush => handlers::webpush::handle(engine, link, &frame),
        Token::Multiline => handlers::multiline::handle(engine, link, &frame),
        Token::Sasl => handlers::sasl::handle(engine, link, &frame),
    };

    match result {
        Ok(()) => {}
        Err(HandlerError::CloseLink(reason)) => {
            engine.close_link(link, &reason);
        }
        Err(e) => {
            // Validation failures that do not implicate the link are
            // dropped, not fatal.
            debug!(link, token = %frame.token, code = e.error_code(), error = %e, "frame dropped");
        }
    }
}
