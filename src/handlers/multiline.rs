//! `ML` - server-to-server multiline fan-out.
//!
//! The batch id parameter carries the framing: `+<id>` opens with the
//! first line, `<id>` continues on a new line, `c<id>` continues with
//! concat semantics, `-<id>` closes (possibly with empty text).

use tracing::{debug, warn};

use kestrel_p10::{casefold, Capability, Frame, Tag, UserNumeric};

use crate::client::batch::BatchLine;
use crate::engine::Engine;
use crate::error::{HandlerError, HandlerResult};
use crate::state::{ConnId, LinkId};
use crate::tagging::{server_time_now, ClientMsg};

/// One in-flight inbound multiline batch.
pub struct MultilineAssembly {
    /// Sending user.
    pub sender: UserNumeric,
    /// Declared target.
    pub target: String,
    /// Lines so far.
    pub lines: Vec<BatchLine>,
    /// Accumulated bytes.
    pub bytes: usize,
    /// Open time for expiry.
    pub opened_at: i64,
}

/// Dispatch entry for `ML`.
pub fn handle(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    let origin = frame
        .origin
        .as_deref()
        .ok_or_else(|| HandlerError::InvalidParams("missing origin".to_owned()))?;
    let sender: UserNumeric = origin
        .parse()
        .map_err(|_| HandlerError::UnknownOrigin(origin.to_owned()))?;
    if !engine.net.users.contains_key(&sender) {
        return Err(HandlerError::UnknownOrigin(origin.to_owned()));
    }
    let marker = frame.param(0).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let target = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let text = frame.trailing.clone().unwrap_or_default();

    let max_bytes = engine.config.multiline.max_bytes;
    let max_lines = engine.config.multiline.max_lines;

    if let Some(id) = marker.strip_prefix('+') {
        let open_count = engine
            .ml_inbound
            .keys()
            .filter(|(l, _)| *l == link)
            .count();
        if open_count >= engine.config.multiline.max_batches_per_link {
            warn!(link, "multiline batch limit exceeded, dropping open");
            return Err(HandlerError::InvalidParams(
                "too many concurrent multiline batches".to_owned(),
            ));
        }
        let mut assembly = MultilineAssembly {
            sender,
            target,
            lines: Vec::new(),
            bytes: 0,
            opened_at: engine.now(),
        };
        push_line(&mut assembly, text, false);
        engine.ml_inbound.insert((link, id.to_owned()), assembly);
    } else if let Some(id) = marker.strip_prefix('-') {
        let Some(mut assembly) = engine.ml_inbound.remove(&(link, id.to_owned())) else {
            return Err(HandlerError::InvalidParams(format!(
                "close for unknown multiline batch {id}"
            )));
        };
        if !text.is_empty() {
            push_line(&mut assembly, text, false);
        }
        if assembly.bytes > max_bytes || assembly.lines.len() > max_lines {
            warn!(link, bytes = assembly.bytes, lines = assembly.lines.len(), "oversize multiline batch dropped");
            return Err(HandlerError::InvalidParams("multiline batch too large".to_owned()));
        }
        let msgid = engine.msgids.next();
        fanout_local(
            engine,
            assembly.sender,
            &assembly.target,
            &assembly.lines,
            &msgid,
            None,
        );
    } else {
        let (concat, id) = match marker.strip_prefix('c') {
            Some(id) => (true, id),
            None => (false, marker.as_str()),
        };
        let Some(assembly) = engine.ml_inbound.get_mut(&(link, id.to_owned())) else {
            return Err(HandlerError::InvalidParams(format!(
                "continuation for unknown multiline batch {id}"
            )));
        };
        push_line(assembly, text, concat);
        if assembly.bytes > max_bytes || assembly.lines.len() > max_lines {
            engine.ml_inbound.remove(&(link, id.to_owned()));
            warn!(link, "oversize multiline batch dropped mid-stream");
            return Err(HandlerError::InvalidParams("multiline batch too large".to_owned()));
        }
    }

    // Streamed onward as received; peers reassemble for their own
    // clients.
    engine.broadcast_frame(frame, Some(link));
    Ok(())
}

fn push_line(assembly: &mut MultilineAssembly, text: String, concat: bool) {
    assembly.bytes += text.len();
    assembly.lines.push(BatchLine {
        text,
        concat,
        client_tags: Vec::new(),
    });
}

/// Deliver an assembled multiline message to local recipients:
/// capable clients get a `draft/multiline` batch, everyone else a
/// bounded preview preceded by a notice.
pub fn fanout_local(
    engine: &mut Engine,
    sender: UserNumeric,
    target: &str,
    lines: &[BatchLine],
    msgid: &str,
    exclude: Option<ConnId>,
) {
    let hostmask = match engine.net.users.get(&sender) {
        Some(user) => user.hostmask(),
        None => return,
    };
    let is_channel = target.starts_with('#') || target.starts_with('&');
    let recipients: Vec<ConnId> = if is_channel {
        engine
            .net
            .local_members(&casefold(target))
            .into_iter()
            .map(|(_, conn)| conn)
            .filter(|conn| Some(*conn) != exclude)
            .collect()
    } else {
        engine
            .net
            .user_by_nick(target)
            .and_then(|u| u.conn)
            .into_iter()
            .filter(|conn| Some(*conn) != exclude)
            .collect()
    };

    let time = server_time_now();
    let preview_lines = engine.config.multiline.preview_lines;
    let batch_id = engine.next_batch_id();

    for conn in recipients {
        let caps = engine.caps_of(conn);
        if caps.contains(Capability::Multiline) && caps.contains(Capability::Batch) {
            let open = ClientMsg::new(engine.server_name(), "BATCH")
                .with_param(format!("+{batch_id}"))
                .with_param("draft/multiline")
                .with_param(target.to_owned());
            engine.send_msg(conn, &open);
            for (i, line) in lines.iter().enumerate() {
                let mut msg = ClientMsg::new(hostmask.clone(), "PRIVMSG")
                    .with_param(target.to_owned())
                    .with_trailing(line.text.clone());
                msg.tags.push(Tag::new("batch", batch_id.clone()));
                if i == 0 {
                    msg.tags.push(Tag::new("time", time.clone()));
                    msg.tags.push(Tag::new("msgid", msgid.to_owned()));
                }
                if line.concat {
                    msg.tags.push(Tag::flag("draft/multiline-concat"));
                }
                for tag in &line.client_tags {
                    msg.tags.push(tag.clone());
                }
                engine.send_msg(conn, &msg);
            }
            let close = ClientMsg::new(engine.server_name(), "BATCH")
                .with_param(format!("-{batch_id}"));
            engine.send_msg(conn, &close);
        } else {
            if lines.len() > preview_lines {
                let notice = ClientMsg::new(engine.server_name(), "NOTICE")
                    .with_param(target.to_owned())
                    .with_trailing(format!(
                        "Long message from {hostmask}: showing first {preview_lines} of {} lines",
                        lines.len()
                    ));
                engine.send_msg(conn, &notice);
            }
            for line in lines.iter().take(preview_lines) {
                let mut msg = ClientMsg::new(hostmask.clone(), "PRIVMSG")
                    .with_param(target.to_owned())
                    .with_trailing(line.text.clone());
                msg.tags.push(Tag::new("time", time.clone()));
                engine.send_msg(conn, &msg);
            }
        }
    }
    debug!(target = %target, lines = lines.len(), "multiline fanout");
}

/// Emit an assembled client batch to peers as `ML` frames. The wire id
/// is the sender numeric plus the open timestamp.
pub fn emit_s2s(
    engine: &mut Engine,
    sender: UserNumeric,
    target: &str,
    lines: &[BatchLine],
    opened_at: i64,
) {
    let wire_id = format!("{sender}{opened_at}");
    for (i, line) in lines.iter().enumerate() {
        let marker = if i == 0 {
            format!("+{wire_id}")
        } else if line.concat {
            format!("c{wire_id}")
        } else {
            wire_id.clone()
        };
        let frame = Frame::new("ML")
            .with_origin(sender.to_string())
            .with_param(marker)
            .with_param(target.to_owned())
            .with_trailing(line.text.clone());
        engine.broadcast_frame(&frame, None);
    }
    let close = Frame::new("ML")
        .with_origin(sender.to_string())
        .with_param(format!("-{wire_id}"))
        .with_param(target.to_owned())
        .with_trailing("");
    engine.broadcast_frame(&close, None);
}

/// Expire assemblies whose link stalled mid-batch.
pub fn expire(engine: &mut Engine, now: i64, max_age: i64) {
    engine
        .ml_inbound
        .retain(|_, assembly| now - assembly.opened_at < max_age);
}
