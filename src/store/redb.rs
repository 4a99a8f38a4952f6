//! Redb-backed store for durable chathistory and caches.
//!
//! Each value is stored as `<expires>|<seq>|<payload>`: `expires` is a
//! unix second or 0 for none, `seq` is a monotonic insertion counter
//! that drives watermark eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::StoreError;

use super::{Kv, HIGH_WATERMARK, LOW_WATERMARK};

const KV_TABLE: TableDefinition<&str, &str> = TableDefinition::new("kv");

/// Persistent store backend.
pub struct RedbStore {
    db: Database,
    seq: AtomicU64,
}

impl RedbStore {
    /// Open or create the database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        // Ensure the table exists so reads before the first write work.
        let txn = db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        txn.open_table(KV_TABLE)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        txn.commit().map_err(|e| StoreError::Backend(e.to_string()))?;

        // Seed the insertion counter past anything already stored.
        let seq = chrono::Utc::now().timestamp_micros().max(0) as u64;
        Ok(Self {
            db,
            seq: AtomicU64::new(seq),
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn encode(&self, value: &str, ttl: Option<Duration>) -> String {
        let expires = ttl.map(|t| Self::now() + t.as_secs() as i64).unwrap_or(0);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{expires}|{seq}|{value}")
    }

    /// Split a stored record into (expires, seq, payload).
    fn decode(raw: &str) -> Option<(i64, u64, &str)> {
        let (expires, rest) = raw.split_once('|')?;
        let (seq, payload) = rest.split_once('|')?;
        Some((expires.parse().ok()?, seq.parse().ok()?, payload))
    }

    fn live_payload(raw: &str) -> Option<&str> {
        let (expires, _, payload) = Self::decode(raw)?;
        if expires != 0 && expires <= Self::now() {
            None
        } else {
            Some(payload)
        }
    }
}

impl Kv for RedbStore {
    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let record = self.encode(value, ttl);
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            table
                .insert(key, record.as_str())
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let table = txn
            .open_table(KV_TABLE)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let Some(guard) = table
            .get(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?
        else {
            return Ok(None);
        };
        Ok(Self::live_payload(guard.value()).map(str::to_owned))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            table
                .remove(key)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let table = txn
            .open_table(KV_TABLE)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let range = table
            .range(prefix..)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for item in range {
            let (k, v) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            let key = k.value();
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(payload) = Self::live_payload(v.value()) {
                out.push((key.to_owned(), payload.to_owned()));
            }
        }
        Ok(out)
    }

    fn maintenance(&self) -> Result<usize, StoreError> {
        let now = Self::now();
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut removed = 0usize;
        {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            let mut live: Vec<(u64, String)> = Vec::new();
            let mut dead: Vec<String> = Vec::new();
            for item in table
                .iter()
                .map_err(|e| StoreError::Backend(e.to_string()))?
            {
                let (k, v) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
                match Self::decode(v.value()) {
                    Some((expires, seq, _)) if expires == 0 || expires > now => {
                        live.push((seq, k.value().to_owned()));
                    }
                    _ => dead.push(k.value().to_owned()),
                }
            }
            for key in &dead {
                table
                    .remove(key.as_str())
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                removed += 1;
            }
            if live.len() > HIGH_WATERMARK {
                live.sort_unstable();
                let excess = live.len() - LOW_WATERMARK;
                for (_, key) in live.into_iter().take(excess) {
                    table
                        .remove(key.as_str())
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RedbStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.redb");
        let store = RedbStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = open_temp();
        store.put("meta:alice:avatar", "*:value", None).unwrap();
        assert_eq!(
            store.get("meta:alice:avatar").unwrap().as_deref(),
            Some("*:value")
        );
    }

    #[test]
    fn scan_respects_prefix() {
        let (_dir, store) = open_temp();
        store.put("hist:#a:1:x", "1", None).unwrap();
        store.put("hist:#a:2:y", "2", None).unwrap();
        store.put("hist:#b:1:z", "3", None).unwrap();
        let rows = store.scan("hist:#a:").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn values_with_pipes_survive() {
        let (_dir, store) = open_temp();
        store.put("k", "a|b|c", None).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("a|b|c"));
    }

    #[test]
    fn maintenance_removes_expired() {
        let (_dir, store) = open_temp();
        store.put("dead", "v", Some(Duration::from_secs(0))).unwrap();
        store.put("live", "v", None).unwrap();
        let removed = store.maintenance().unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("live").unwrap().is_some());
    }
}
