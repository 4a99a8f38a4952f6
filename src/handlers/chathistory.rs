//! `CH` - chathistory federation, and the local query/stream path the
//! client command shares.
//!
//! Federation flow: serve locally; when the local store comes up short
//! and federation is enabled, broadcast `CH Q` to directly-linked
//! peers, collect `CH R` rows until every peer's `CH E`, then merge
//! (dedup by msgid, sort by time), truncate and stream inside a
//! `chathistory` batch. Late responses find no pending entry and drop.

use tracing::debug;

use kestrel_p10::{Capability, Frame, MsgRef, Tag};

use crate::engine::{Engine, LinkPhase};
use crate::error::{HandlerError, HandlerResult};
use crate::history::{self, HistorySelect, MessageKind, StoredMessage};
use crate::state::{ConnId, LinkId, PendingKind};
use crate::tagging::{format_server_time, ClientMsg};

/// Dispatch entry for `CH`.
pub fn handle(engine: &mut Engine, link: LinkId, frame: &Frame) -> HandlerResult {
    match frame.param(0) {
        Some("Q") => handle_query(engine, link, frame),
        Some("R") => handle_row(engine, frame),
        Some("E") => handle_end(engine, frame),
        _ => Err(HandlerError::InvalidParams("bad CH subcommand".to_owned())),
    }
}

/// `CH Q <target> <L|B|A|R|W|T> <ref[,ref]> <limit> <reqid>` - a peer
/// asks for our slice of a target's history.
fn handle_query(engine: &mut Engine, _link: LinkId, frame: &Frame) -> HandlerResult {
    let origin = super::server::origin_server(engine, frame)?;
    if frame.params.len() < 6 {
        return Err(HandlerError::NeedMoreParams);
    }
    let target = frame.params[1].clone();
    let letter = frame.params[2].clone();
    let reference = frame.params[3].clone();
    let limit: usize = frame.params[4]
        .parse()
        .map_err(|_| HandlerError::InvalidParams("bad limit".to_owned()))?;
    let reqid = frame.params[5].clone();
    let limit = limit.min(engine.config.history.max);

    let select = parse_wire_select(&letter, &reference)
        .ok_or_else(|| HandlerError::InvalidParams("bad history reference".to_owned()))?;

    let rows = history::load(engine.kv.as_ref(), &kestrel_p10::casefold(&target));
    let slice = history::select(&rows, &select, limit);
    debug!(target = %target, rows = slice.len(), reqid = %reqid, "serving federated history");

    let me = engine.me_str();
    for row in &slice {
        let reply = row_frame(&me, &reqid, row);
        engine.send_to_server(origin, &reply);
    }
    let end = Frame::new("CH")
        .with_origin(me)
        .with_param("E")
        .with_param(reqid)
        .with_param(slice.len().to_string());
    engine.send_to_server(origin, &end);
    Ok(())
}

fn row_frame(me: &str, reqid: &str, row: &StoredMessage) -> Frame {
    Frame::new("CH")
        .with_origin(me.to_owned())
        .with_param("R")
        .with_param(reqid.to_owned())
        .with_param(row.msgid.clone())
        .with_param(row.ts_ms.to_string())
        .with_param(row.kind.as_int().to_string())
        .with_param(row.sender.clone())
        .with_param(row.account.clone().unwrap_or_else(|| "*".to_owned()))
        .with_trailing(row.text.clone())
}

/// `CH R <reqid> <msgid> <ts> <type> <sender> <account|*> :<content>`.
fn handle_row(engine: &mut Engine, frame: &Frame) -> HandlerResult {
    if frame.params.len() < 7 {
        return Err(HandlerError::NeedMoreParams);
    }
    let reqid = frame.params[1].clone();
    let Some(request) = engine.pending.get_mut(&reqid) else {
        debug!(reqid = %reqid, "late history row dropped");
        return Ok(());
    };
    let PendingKind::History { collected, target, .. } = &mut request.kind else {
        return Ok(());
    };

    let msgid = frame.params[2].clone();
    let ts_ms: i64 = frame.params[3]
        .parse()
        .map_err(|_| HandlerError::InvalidParams("bad row timestamp".to_owned()))?;
    let kind = frame.params[4]
        .parse::<u8>()
        .ok()
        .and_then(MessageKind::from_int)
        .ok_or_else(|| HandlerError::InvalidParams("bad row type".to_owned()))?;
    let sender = frame.params[5].clone();
    let account = match frame.params[6].as_str() {
        "*" => None,
        a => Some(a.to_owned()),
    };
    collected.push(StoredMessage {
        msgid,
        ts_ms,
        target: target.clone(),
        sender,
        account,
        kind,
        text: frame.trailing.clone().unwrap_or_default(),
    });
    Ok(())
}

/// `CH E <reqid> <count>` - one peer finished answering.
fn handle_end(engine: &mut Engine, frame: &Frame) -> HandlerResult {
    let reqid = frame.param(1).ok_or(HandlerError::NeedMoreParams)?.to_owned();
    let done = {
        let Some(request) = engine.pending.get_mut(&reqid) else {
            debug!(reqid = %reqid, "late history end dropped");
            return Ok(());
        };
        match &mut request.kind {
            PendingKind::History { outstanding, .. } => {
                *outstanding = outstanding.saturating_sub(1);
                *outstanding == 0
            }
            _ => false,
        }
    };
    if done {
        if let Some(request) = engine.pending.take(&reqid) {
            if let PendingKind::History {
                target,
                limit,
                collected,
                ..
            } = request.kind
            {
                let merged = history::merge(collected, limit);
                stream_to_client(engine, request.conn, &target, &merged);
            }
        }
    }
    Ok(())
}

/// A client CHATHISTORY request, already parsed. Serves locally, and
/// federates on shortfall.
pub fn client_request(
    engine: &mut Engine,
    conn: ConnId,
    display_target: &str,
    storage_target: &str,
    select: HistorySelect,
    limit: usize,
) {
    let limit = limit.min(engine.config.history.max).max(1);
    let rows = history::load(engine.kv.as_ref(), storage_target);
    let local = history::select(&rows, &select, limit);

    let peer_count = engine
        .links
        .values()
        .filter(|l| l.phase == LinkPhase::Linked)
        .count();
    let federate =
        engine.config.history.federation && local.len() < limit && peer_count > 0;

    if !federate {
        let merged = history::merge(local, limit);
        stream_to_client(engine, conn, display_target, &merged);
        return;
    }

    let timeout = engine.config.history.timeout_secs as i64;
    let now = engine.now();
    let reqid = engine.pending.create(
        conn,
        PendingKind::History {
            target: display_target.to_owned(),
            limit,
            collected: local,
            outstanding: peer_count,
        },
        now,
        timeout,
    );

    let (letter, reference) = wire_select(&select);
    let query = Frame::new("CH")
        .with_origin(engine.me_str())
        .with_param("Q")
        .with_param(storage_target.to_owned())
        .with_param(letter.to_string())
        .with_param(reference)
        .with_param(limit.to_string())
        .with_param(reqid);
    engine.broadcast_frame(&query, None);
}

/// Stream merged rows to the client inside a `chathistory` batch.
pub fn stream_to_client(
    engine: &mut Engine,
    conn: ConnId,
    display_target: &str,
    rows: &[StoredMessage],
) {
    let caps = engine.caps_of(conn);
    let batched = caps.contains(Capability::Batch);
    let playback_tagmsg = caps.contains(Capability::EventPlayback);
    let batch_id = engine.next_batch_id();

    if batched {
        let open = ClientMsg::new(engine.server_name(), "BATCH")
            .with_param(format!("+{batch_id}"))
            .with_param("chathistory")
            .with_param(display_target.to_owned());
        engine.send_labeled(conn, &open);
    }
    for row in rows {
        if row.kind == MessageKind::Tagmsg && !playback_tagmsg {
            continue;
        }
        let mut msg = ClientMsg::new(row.sender.clone(), row.kind.command())
            .with_param(display_target.to_owned());
        if row.kind != MessageKind::Tagmsg {
            msg = msg.with_trailing(row.text.clone());
        }
        msg.tags.push(Tag::new("time", format_server_time(row.ts_ms)));
        msg.tags.push(Tag::new("msgid", row.msgid.clone()));
        if let Some(account) = &row.account {
            msg.tags.push(Tag::new("account", account.clone()));
        }
        if batched {
            msg.tags.push(Tag::new("batch", batch_id.clone()));
        }
        engine.send_msg(conn, &msg);
    }
    if batched {
        let close =
            ClientMsg::new(engine.server_name(), "BATCH").with_param(format!("-{batch_id}"));
        engine.send_msg(conn, &close);
    }
}

/// Wire encoding of a selection: the letter and the reference field
/// (`BETWEEN` joins its two references with a comma).
pub fn wire_select(select: &HistorySelect) -> (char, String) {
    match select {
        HistorySelect::Latest => ('L', "*".to_owned()),
        HistorySelect::Before(r) => ('B', r.to_wire()),
        HistorySelect::After(r) => ('A', r.to_wire()),
        HistorySelect::Around(r) => ('R', r.to_wire()),
        HistorySelect::Between(a, b) => ('W', format!("{},{}", a.to_wire(), b.to_wire())),
    }
}

/// Decode the wire selection.
pub fn parse_wire_select(letter: &str, reference: &str) -> Option<HistorySelect> {
    match letter {
        "L" => Some(HistorySelect::Latest),
        "B" => MsgRef::parse_wire(reference).map(HistorySelect::Before),
        "A" => MsgRef::parse_wire(reference).map(HistorySelect::After),
        "R" => MsgRef::parse_wire(reference).map(HistorySelect::Around),
        "W" => {
            let (a, b) = reference.split_once(',')?;
            Some(HistorySelect::Between(
                MsgRef::parse_wire(a)?,
                MsgRef::parse_wire(b)?,
            ))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_select_roundtrip() {
        for select in [
            HistorySelect::Latest,
            HistorySelect::Before(MsgRef::Timestamp(100)),
            HistorySelect::After(MsgRef::MsgId("AB-1-2".into())),
            HistorySelect::Around(MsgRef::Any),
            HistorySelect::Between(MsgRef::Timestamp(5), MsgRef::Timestamp(9)),
        ] {
            let (letter, reference) = wire_select(&select);
            let parsed = parse_wire_select(&letter.to_string(), &reference).unwrap();
            assert_eq!(parsed, select);
        }
    }
}
