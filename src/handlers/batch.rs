//! `BT` - server-to-server batch markers for netjoin and netsplit
//! coordination.
//!
//! The active batch id is stored on the owning server record so that
//! JOIN/QUIT fanout during the window can stamp `@batch` for
//! batch-capable local clients.

use tracing::debug;

use kestrel_p10::{Capability, Frame};

use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::state::{ConnId, LinkId};
use crate::tagging::ClientMsg;

/// Dispatch entry for `BT`.
pub fn handle(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let origin = super::server::origin_server(engine, frame)?;
    let marker = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();

    if let Some(id) = marker.strip_prefix('+') {
        let batch_type = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();
        if batch_type != "netjoin" && batch_type != "netsplit" {
            return Err(HandlerError::InvalidParams(format!(
                "unsupported batch type {batch_type}"
            )));
        }
        let params: Vec<String> = frame.params.iter().skip(2).cloned().collect();
        debug!(server = %origin, id = %id, batch_type = %batch_type, "network batch open");

        if let Some(server) = engine.net.servers.get_mut(&origin) {
            server.batch_id = Some(id.to_owned());
            server.junction = batch_type == "netjoin";
        }

        let mut open = ClientMsg::new(engine.server_name(), "BATCH")
            .with_param(format!("+{id}"))
            .with_param(batch_type);
        for p in params {
            open = open.with_param(p);
        }
        for conn in batch_capable_conns(engine) {
            engine.send_msg(conn, &open);
        }
    } else if let Some(id) = marker.strip_prefix('-') {
        debug!(server = %origin, id = %id, "network batch close");
        if let Some(server) = engine.net.servers.get_mut(&origin) {
            if server.batch_id.as_deref() == Some(id) {
                server.batch_id = None;
                server.junction = false;
            }
        }
        let close = ClientMsg::new(engine.server_name(), "BATCH").with_param(format!("-{id}"));
        for conn in batch_capable_conns(engine) {
            engine.send_msg(conn, &close);
        }
    } else {
        return Err(HandlerError::InvalidParams("bad batch marker".to_owned()));
    }

    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

fn batch_capable_conns(engine: &Engine) -> Vec<ConnId> {
    engine
        .clients
        .values()
        .filter(|s| s.user.is_some() && s.caps.contains(Capability::Batch))
        .map(|s| s.conn)
        .collect()
}
