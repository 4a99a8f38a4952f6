//! Message-id generation and history reference classification.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::numeric::is_numeric_str;

/// Generates msgids of the form `<server-numeric>-<startup-ts>-<counter>`.
///
/// The startup timestamp makes ids unique across restarts of the same
/// server; the counter makes them unique within a run. No two emissions
/// by one server share an id within the retention window.
pub struct MsgIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl MsgIdGenerator {
    /// Create a generator for `server` (its 2-symbol numeric) started at
    /// `startup_unix` seconds.
    pub fn new(server: &str, startup_unix: i64) -> Self {
        Self {
            prefix: format!("{server}-{startup_unix}"),
            counter: AtomicU64::new(0),
        }
    }

    /// Produce the next id.
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

/// A history reference as carried on the wire.
///
/// Wire disambiguation: a leading ASCII digit is a Unix timestamp, a
/// leading numeric-alphabet symbol is a msgid (msgids always start with
/// a server numeric), and `*` means "no reference".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgRef {
    /// `*` - no anchor.
    Any,
    /// A Unix timestamp in seconds (milliseconds accepted and floored).
    Timestamp(i64),
    /// A message id.
    MsgId(String),
}

impl MsgRef {
    /// Classify a server-to-server wire reference.
    pub fn parse_wire(s: &str) -> Option<Self> {
        if s == "*" {
            return Some(MsgRef::Any);
        }
        let first = s.chars().next()?;
        if first.is_ascii_digit() {
            return s.parse::<i64>().ok().map(MsgRef::Timestamp);
        }
        if is_numeric_str(&s[..first.len_utf8()]) {
            return Some(MsgRef::MsgId(s.to_owned()));
        }
        None
    }

    /// Parse a client-side reference: `*`, `timestamp=<unix>`, or
    /// `msgid=<id>`.
    pub fn parse_client(s: &str) -> Option<Self> {
        if s == "*" {
            return Some(MsgRef::Any);
        }
        if let Some(ts) = s.strip_prefix("timestamp=") {
            return ts.parse::<i64>().ok().map(MsgRef::Timestamp);
        }
        if let Some(id) = s.strip_prefix("msgid=") {
            if id.is_empty() {
                return None;
            }
            return Some(MsgRef::MsgId(id.to_owned()));
        }
        None
    }

    /// Serialize for the server-to-server wire.
    pub fn to_wire(&self) -> String {
        match self {
            MsgRef::Any => "*".to_owned(),
            MsgRef::Timestamp(ts) => ts.to_string(),
            MsgRef::MsgId(id) => id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_format_and_uniqueness() {
        let generator = MsgIdGenerator::new("AB", 1_700_000_000);
        let a = generator.next();
        let b = generator.next();
        assert_eq!(a, "AB-1700000000-0");
        assert_eq!(b, "AB-1700000000-1");
        assert_ne!(a, b);
    }

    #[test]
    fn wire_classification() {
        assert_eq!(MsgRef::parse_wire("*"), Some(MsgRef::Any));
        assert_eq!(
            MsgRef::parse_wire("1700000000"),
            Some(MsgRef::Timestamp(1_700_000_000))
        );
        assert_eq!(
            MsgRef::parse_wire("AB-1700000000-5"),
            Some(MsgRef::MsgId("AB-1700000000-5".to_owned()))
        );
        assert_eq!(MsgRef::parse_wire("!bad"), None);
    }

    #[test]
    fn client_references() {
        assert_eq!(MsgRef::parse_client("*"), Some(MsgRef::Any));
        assert_eq!(
            MsgRef::parse_client("timestamp=1700000000"),
            Some(MsgRef::Timestamp(1_700_000_000))
        );
        assert_eq!(
            MsgRef::parse_client("msgid=AB-1-2"),
            Some(MsgRef::MsgId("AB-1-2".to_owned()))
        );
        assert_eq!(MsgRef::parse_client("msgid="), None);
        assert_eq!(MsgRef::parse_client("around=5"), None);
    }

    #[test]
    fn wire_roundtrip() {
        for r in [
            MsgRef::Any,
            MsgRef::Timestamp(123),
            MsgRef::MsgId("AB-1-2".to_owned()),
        ] {
            assert_eq!(MsgRef::parse_wire(&r.to_wire()), Some(r.clone()));
        }
    }
}
