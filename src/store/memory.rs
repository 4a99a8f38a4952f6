//! In-memory store backend, used for tests and `store = "memory"`.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::StoreError;

use super::{Kv, HIGH_WATERMARK, LOW_WATERMARK};

struct Entry {
    value: String,
    expires_at: Option<i64>,
    seq: u64,
}

struct Inner {
    map: BTreeMap<String, Entry>,
    next_seq: u64,
}

/// A bounded, TTL-aware in-memory store.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    high: usize,
    low: usize,
}

impl MemoryStore {
    /// Store with the default watermarks.
    pub fn new() -> Self {
        Self::with_watermarks(HIGH_WATERMARK, LOW_WATERMARK)
    }

    /// Store with explicit watermarks, for tests.
    pub fn with_watermarks(high: usize, low: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: BTreeMap::new(),
                next_seq: 0,
            }),
            high,
            low,
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Kv for MemoryStore {
    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.map.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: ttl.map(|t| Self::now() + t.as_secs() as i64),
                seq,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.map.get(key).and_then(|e| {
            if e.expires_at.is_some_and(|exp| exp <= Self::now()) {
                None
            } else {
                Some(e.value.clone())
            }
        }))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.write().map.remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let now = Self::now();
        let inner = self.inner.read();
        Ok(inner
            .map
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.expires_at.is_some_and(|exp| exp <= now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    fn maintenance(&self) -> Result<usize, StoreError> {
        let now = Self::now();
        let mut inner = self.inner.write();
        let before = inner.map.len();
        inner
            .map
            .retain(|_, e| !e.expires_at.is_some_and(|exp| exp <= now));

        if inner.map.len() > self.high {
            let mut by_age: Vec<(u64, String)> = inner
                .map
                .iter()
                .map(|(k, e)| (e.seq, k.clone()))
                .collect();
            by_age.sort_unstable();
            let excess = inner.map.len() - self.low;
            for (_, key) in by_age.into_iter().take(excess) {
                inner.map.remove(&key);
            }
        }
        Ok(before - inner.map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();
        store.put("k", "v", None).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn scan_is_prefix_bounded_and_sorted() {
        let store = MemoryStore::new();
        store.put("a:2", "2", None).unwrap();
        store.put("a:1", "1", None).unwrap();
        store.put("b:1", "x", None).unwrap();
        let rows = store.scan("a:").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "a:1");
        assert_eq!(rows[1].0, "a:2");
    }

    #[test]
    fn watermark_evicts_oldest_first() {
        let store = MemoryStore::with_watermarks(4, 2);
        for i in 0..6 {
            store.put(&format!("k{i}"), "v", None).unwrap();
        }
        store.maintenance().unwrap();
        // Oldest four evicted down to the low watermark.
        assert_eq!(store.get("k0").unwrap(), None);
        assert_eq!(store.get("k3").unwrap(), None);
        assert!(store.get("k4").unwrap().is_some());
        assert!(store.get("k5").unwrap().is_some());
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let store = MemoryStore::new();
        store
            .put("gone", "v", Some(Duration::from_secs(0)))
            .unwrap();
        assert_eq!(store.get("gone").unwrap(), None);
        assert!(store.scan("gone").unwrap().is_empty());
    }
}
