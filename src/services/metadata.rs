//! Metadata cache and compression pass-through.
//!
//! Services own authoritative metadata; the core keeps a bounded TTL
//! cache keyed by `(target, key)` and persists entries through the KV
//! store. A `Z`-flagged value is a base64-encoded zstd payload stored
//! exactly as received - it is only decompressed at client delivery.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use kestrel_p10::casefold;

/// Who may read a metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// `*` - anyone.
    Public,
    /// `P` - the owner and operators only.
    Private,
}

impl Visibility {
    /// Wire token.
    pub fn wire(self) -> &'static str {
        match self {
            Visibility::Public => "*",
            Visibility::Private => "P",
        }
    }

    /// Parse the wire token.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "*" => Some(Visibility::Public),
            "P" => Some(Visibility::Private),
            _ => None,
        }
    }
}

/// One cached metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaEntry {
    /// The value as carried on the wire (compressed form stays as-is).
    pub value: String,
    /// Visibility.
    pub visibility: Visibility,
    /// Value is base64-encoded zstd.
    pub compressed: bool,
    /// Cache insertion time.
    pub stored_at: i64,
}

impl MetaEntry {
    /// The plaintext value, decompressing when flagged.
    pub fn plaintext(&self) -> Result<String, String> {
        if !self.compressed {
            return Ok(self.value.clone());
        }
        let raw = B64
            .decode(self.value.as_bytes())
            .map_err(|e| format!("bad base64: {e}"))?;
        let bytes =
            zstd::stream::decode_all(raw.as_slice()).map_err(|e| format!("bad zstd: {e}"))?;
        String::from_utf8(bytes).map_err(|e| format!("bad utf8: {e}"))
    }

    /// Encode for KV persistence: `<vis>[Z]:<payload>`.
    pub fn encode(&self) -> String {
        format!(
            "{}{}:{}",
            self.visibility.wire(),
            if self.compressed { "Z" } else { "" },
            self.value
        )
    }

    /// Decode a persisted entry.
    pub fn decode(raw: &str, stored_at: i64) -> Option<Self> {
        let (head, payload) = raw.split_once(':')?;
        let (vis, compressed) = match head {
            "*" => (Visibility::Public, false),
            "*Z" => (Visibility::Public, true),
            "P" => (Visibility::Private, false),
            "PZ" => (Visibility::Private, true),
            _ => return None,
        };
        Some(Self {
            value: payload.to_owned(),
            visibility: vis,
            compressed,
            stored_at,
        })
    }
}

/// Compress a value when it clears the threshold; returns the wire
/// value and whether the `Z` flag applies.
pub fn maybe_compress(value: &str, threshold: usize, level: i32) -> (String, bool) {
    if threshold == 0 || value.len() < threshold {
        return (value.to_owned(), false);
    }
    match zstd::stream::encode_all(value.as_bytes(), level) {
        Ok(compressed) if compressed.len() < value.len() => (B64.encode(compressed), true),
        _ => (value.to_owned(), false),
    }
}

/// The bounded TTL cache.
pub struct MetadataCache {
    entries: HashMap<(String, String), MetaEntry>,
    ttl: i64,
}

impl MetadataCache {
    /// Cache with the configured TTL in seconds.
    pub fn new(ttl: i64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    fn key(target: &str, key: &str) -> (String, String) {
        (casefold(target), key.to_owned())
    }

    /// A live entry, or `None` on miss/expiry.
    pub fn get(&self, target: &str, key: &str, now: i64) -> Option<&MetaEntry> {
        self.entries
            .get(&Self::key(target, key))
            .filter(|e| now - e.stored_at < self.ttl)
    }

    /// Insert or replace. Returns false when value and visibility are
    /// unchanged (the write is a no-op for broadcast purposes).
    pub fn insert(&mut self, target: &str, key: &str, entry: MetaEntry) -> bool {
        let slot = Self::key(target, key);
        if let Some(existing) = self.entries.get(&slot) {
            if existing.value == entry.value && existing.visibility == entry.visibility {
                return false;
            }
        }
        self.entries.insert(slot, entry);
        true
    }

    /// Remove a key; true when something was removed.
    pub fn clear(&mut self, target: &str, key: &str) -> bool {
        self.entries.remove(&Self::key(target, key)).is_some()
    }

    /// All live entries for a target.
    pub fn all_for(&self, target: &str, now: i64) -> Vec<(String, MetaEntry)> {
        let folded = casefold(target);
        self.entries
            .iter()
            .filter(|((t, _), e)| *t == folded && now - e.stored_at < self.ttl)
            .map(|((_, k), e)| (k.clone(), e.clone()))
            .collect()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| now - e.stored_at < ttl);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: &str) -> MetaEntry {
        MetaEntry {
            value: value.to_owned(),
            visibility: Visibility::Public,
            compressed: false,
            stored_at: 100,
        }
    }

    #[test]
    fn ttl_expires_entries() {
        let mut cache = MetadataCache::new(300);
        cache.insert("Alice", "avatar", entry("v1"));
        assert!(cache.get("alice", "avatar", 150).is_some());
        assert!(cache.get("alice", "avatar", 500).is_none());
        assert_eq!(cache.sweep(500), 1);
    }

    #[test]
    fn duplicate_write_is_noop() {
        let mut cache = MetadataCache::new(300);
        assert!(cache.insert("alice", "avatar", entry("v1")));
        assert!(!cache.insert("alice", "avatar", entry("v1")));
        assert!(cache.insert("alice", "avatar", entry("v2")));
    }

    #[test]
    fn compression_roundtrip() {
        let value = "x".repeat(2000);
        let (wire, compressed) = maybe_compress(&value, 1024, 3);
        assert!(compressed);
        let entry = MetaEntry {
            value: wire,
            visibility: Visibility::Public,
            compressed: true,
            stored_at: 0,
        };
        assert_eq!(entry.plaintext().unwrap(), value);
    }

    #[test]
    fn below_threshold_stays_plain() {
        let (wire, compressed) = maybe_compress("short", 1024, 3);
        assert!(!compressed);
        assert_eq!(wire, "short");
    }

    #[test]
    fn persistence_encoding_roundtrip() {
        for (vis, compressed) in [
            (Visibility::Public, false),
            (Visibility::Public, true),
            (Visibility::Private, false),
            (Visibility::Private, true),
        ] {
            let entry = MetaEntry {
                value: "payload:with:colons".into(),
                visibility: vis,
                compressed,
                stored_at: 42,
            };
            let decoded = MetaEntry::decode(&entry.encode(), 42).unwrap();
            assert_eq!(decoded, entry);
        }
    }
}
