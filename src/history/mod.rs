//! Message history over the KV store.
//!
//! One stored message is one JSON row under
//! `hist:<target>:<ts>:<msgid>`; the zero-padded timestamp makes a
//! prefix scan come back in delivery order. Selection, merging and
//! dedup all operate on loaded rows, which the watermark-bounded store
//! keeps small.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use kestrel_p10::{casefold, MsgRef};

use crate::store::{ns, Kv};

/// What kind of message a history row holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// PRIVMSG.
    Privmsg,
    /// NOTICE.
    Notice,
    /// TAGMSG.
    Tagmsg,
}

impl MessageKind {
    /// Wire integer for `CH R` rows.
    pub fn as_int(self) -> u8 {
        match self {
            MessageKind::Privmsg => 0,
            MessageKind::Notice => 1,
            MessageKind::Tagmsg => 2,
        }
    }

    /// Parse the wire integer.
    pub fn from_int(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageKind::Privmsg),
            1 => Some(MessageKind::Notice),
            2 => Some(MessageKind::Tagmsg),
            _ => None,
        }
    }

    /// The client command used on replay.
    pub fn command(self) -> &'static str {
        match self {
            MessageKind::Privmsg => "PRIVMSG",
            MessageKind::Notice => "NOTICE",
            MessageKind::Tagmsg => "TAGMSG",
        }
    }
}

/// One stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Globally-unique message id.
    pub msgid: String,
    /// Emission time in milliseconds.
    pub ts_ms: i64,
    /// Storage target (casefolded channel, or DM conversation key).
    pub target: String,
    /// Sender hostmask.
    pub sender: String,
    /// Sender account, when logged in.
    pub account: Option<String>,
    /// Message kind.
    pub kind: MessageKind,
    /// Message text (empty for TAGMSG).
    pub text: String,
}

/// A history selection, shared by the client command and federation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistorySelect {
    /// Most recent rows.
    Latest,
    /// Rows strictly before the reference.
    Before(MsgRef),
    /// Rows strictly after the reference.
    After(MsgRef),
    /// Rows centered around the reference.
    Around(MsgRef),
    /// Rows strictly between two references.
    Between(MsgRef, MsgRef),
}

impl HistorySelect {
    /// Wire letter for `CH Q`.
    pub fn wire_letter(&self) -> char {
        match self {
            HistorySelect::Latest => 'L',
            HistorySelect::Before(_) => 'B',
            HistorySelect::After(_) => 'A',
            HistorySelect::Around(_) => 'R',
            HistorySelect::Between(_, _) => 'W',
        }
    }
}

/// The storage target for a private conversation, symmetric in its
/// participants.
pub fn dm_target(a: &str, b: &str) -> String {
    let (a, b) = (casefold(a), casefold(b));
    if a <= b {
        format!("{a},{b}")
    } else {
        format!("{b},{a}")
    }
}

/// Append one message, bounded by the retention window.
pub fn append(kv: &dyn Kv, retention: Duration, msg: &StoredMessage) {
    let key = ns::hist(&msg.target, msg.ts_ms, &msg.msgid);
    match serde_json::to_string(msg) {
        Ok(row) => {
            if let Err(e) = kv.put(&key, &row, Some(retention)) {
                tracing::warn!(error = %e, key = %key, "history append failed");
            }
        }
        Err(e) => tracing::warn!(error = %e, "history row serialization failed"),
    }
}

/// Load every stored row for a target, oldest first.
pub fn load(kv: &dyn Kv, target: &str) -> Vec<StoredMessage> {
    let rows = match kv.scan(&ns::hist_prefix(target)) {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, target = %target, "history scan failed");
            return Vec::new();
        }
    };
    rows.into_iter()
        .filter_map(|(_, row)| serde_json::from_str(&row).ok())
        .collect()
}

/// Position of a reference within sorted rows: the index of the first
/// row at-or-after the reference.
fn position(rows: &[StoredMessage], reference: &MsgRef) -> Option<usize> {
    match reference {
        MsgRef::Any => None,
        MsgRef::Timestamp(ts) => {
            let ts_ms = ts * 1000;
            Some(rows.partition_point(|m| m.ts_ms < ts_ms))
        }
        MsgRef::MsgId(id) => rows.iter().position(|m| &m.msgid == id),
    }
}

/// Apply a selection over sorted rows.
pub fn select(rows: &[StoredMessage], select: &HistorySelect, limit: usize) -> Vec<StoredMessage> {
    match select {
        HistorySelect::Latest => {
            let start = rows.len().saturating_sub(limit);
            rows[start..].to_vec()
        }
        HistorySelect::Before(reference) => {
            let end = position(rows, reference).unwrap_or(rows.len());
            let start = end.saturating_sub(limit);
            rows[start..end].to_vec()
        }
        HistorySelect::After(reference) => {
            let mut start = position(rows, reference).unwrap_or(rows.len());
            // A msgid reference is exclusive of the referenced row.
            if matches!(reference, MsgRef::MsgId(_)) {
                start += 1;
            }
            let start = start.min(rows.len());
            rows[start..(start + limit).min(rows.len())].to_vec()
        }
        HistorySelect::Around(reference) => {
            let center = match position(rows, reference) {
                Some(c) => c,
                None => return Vec::new(),
            };
            let before = limit / 2;
            let start = center.saturating_sub(before);
            rows[start..(start + limit).min(rows.len())].to_vec()
        }
        HistorySelect::Between(a, b) => {
            let pa = position(rows, a).unwrap_or(0);
            let pb = position(rows, b).unwrap_or(rows.len());
            let (mut start, mut end) = if pa <= pb { (pa, pb) } else { (pb, pa) };
            if matches!(a, MsgRef::MsgId(_)) && pa <= pb {
                start = (start + 1).min(rows.len());
            }
            if matches!(b, MsgRef::MsgId(_)) && pb < pa {
                start = (start + 1).min(rows.len());
            }
            end = end.min(rows.len());
            if start > end {
                return Vec::new();
            }
            rows[start..end].iter().take(limit).cloned().collect()
        }
    }
}

/// Merge rows from several sources: dedup by msgid, sort by timestamp
/// ascending, truncate.
pub fn merge(mut rows: Vec<StoredMessage>, limit: usize) -> Vec<StoredMessage> {
    rows.sort_by(|a, b| a.ts_ms.cmp(&b.ts_ms).then_with(|| a.msgid.cmp(&b.msgid)));
    let mut seen = std::collections::HashSet::new();
    rows.retain(|m| seen.insert(m.msgid.clone()));
    if rows.len() > limit {
        let start = rows.len() - limit;
        rows.drain(..start);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn msg(msgid: &str, ts_ms: i64) -> StoredMessage {
        StoredMessage {
            msgid: msgid.to_owned(),
            ts_ms,
            target: "#room".to_owned(),
            sender: "alice!a@h".to_owned(),
            account: None,
            kind: MessageKind::Privmsg,
            text: format!("msg at {ts_ms}"),
        }
    }

    fn sample() -> Vec<StoredMessage> {
        (1..=10).map(|i| msg(&format!("AB-1-{i}"), i * 1000)).collect()
    }

    #[test]
    fn append_load_roundtrip() {
        let store = MemoryStore::new();
        let m = msg("AB-1-1", 5000);
        append(&store, Duration::from_secs(3600), &m);
        let rows = load(&store, "#room");
        assert_eq!(rows, vec![m]);
    }

    #[test]
    fn latest_takes_tail() {
        let rows = sample();
        let out = select(&rows, &HistorySelect::Latest, 3);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].msgid, "AB-1-8");
    }

    #[test]
    fn before_timestamp_is_exclusive() {
        let rows = sample();
        let out = select(&rows, &HistorySelect::Before(MsgRef::Timestamp(5)), 10);
        assert_eq!(out.len(), 4);
        assert_eq!(out.last().unwrap().msgid, "AB-1-4");
    }

    #[test]
    fn after_msgid_is_exclusive() {
        let rows = sample();
        let out = select(
            &rows,
            &HistorySelect::After(MsgRef::MsgId("AB-1-8".into())),
            10,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].msgid, "AB-1-9");
    }

    #[test]
    fn around_centers_the_window() {
        let rows = sample();
        let out = select(
            &rows,
            &HistorySelect::Around(MsgRef::MsgId("AB-1-5".into())),
            4,
        );
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].msgid, "AB-1-3");
    }

    #[test]
    fn between_timestamps() {
        let rows = sample();
        let out = select(
            &rows,
            &HistorySelect::Between(MsgRef::Timestamp(3), MsgRef::Timestamp(7)),
            10,
        );
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].msgid, "AB-1-3");
        assert_eq!(out.last().unwrap().msgid, "AB-1-6");
    }

    #[test]
    fn merge_dedups_and_sorts() {
        let mut rows = sample();
        rows.push(msg("AB-1-5", 5000)); // duplicate
        rows.push(msg("CD-1-1", 1500)); // from a peer
        let merged = merge(rows, 100);
        assert_eq!(merged.len(), 11);
        assert_eq!(merged[1].msgid, "CD-1-1");
        assert!(merged.windows(2).all(|w| w[0].ts_ms <= w[1].ts_ms));
    }

    #[test]
    fn merge_truncates_keeping_newest() {
        let merged = merge(sample(), 3);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].msgid, "AB-1-8");
    }

    #[test]
    fn dm_target_is_symmetric() {
        assert_eq!(dm_target("Alice", "bob"), dm_target("BOB", "alice"));
    }
}
