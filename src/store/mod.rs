//! The bounded persistent key-value store.
//!
//! Chathistory, the metadata cache, read markers and webpush
//! subscriptions all live behind this one interface. Keys are
//! namespaced strings; values are opaque strings. `maintenance()` runs
//! periodically from the engine's housekeeping tick: it evicts expired
//! entries, then watermark-evicts oldest entries while the store is
//! over its high watermark.

mod memory;
mod redb;

pub use memory::MemoryStore;
pub use redb::RedbStore;

use std::time::Duration;

use crate::error::StoreError;

/// Entries above this count trigger watermark eviction.
pub const HIGH_WATERMARK: usize = 100_000;

/// Watermark eviction stops below this count.
pub const LOW_WATERMARK: usize = 90_000;

/// The store interface required by the core.
pub trait Kv: Send + Sync {
    /// Insert or replace a value, optionally with a time-to-live.
    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Fetch a value; expired entries read as misses.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All live entries whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Evict expired entries, then oldest entries while over the high
    /// watermark. Returns how many entries were removed.
    fn maintenance(&self) -> Result<usize, StoreError>;
}

/// Key construction for the namespaces the core uses.
pub mod ns {
    /// `hist:<target>:<ts>:<msgid>` - one stored message.
    pub fn hist(target: &str, ts_ms: i64, msgid: &str) -> String {
        format!("hist:{target}:{ts_ms:020}:{msgid}")
    }

    /// Prefix selecting a target's whole history.
    pub fn hist_prefix(target: &str) -> String {
        format!("hist:{target}:")
    }

    /// `meta:<target>:<key>` - one metadata value.
    pub fn meta(target: &str, key: &str) -> String {
        format!("meta:{target}:{key}")
    }

    /// Prefix selecting all of a target's metadata.
    pub fn meta_prefix(target: &str) -> String {
        format!("meta:{target}:")
    }

    /// `markread:<account>:<target>` - a read marker.
    pub fn markread(account: &str, target: &str) -> String {
        format!("markread:{account}:{target}")
    }

    /// `webpush:<account>:<hash>` - one push subscription.
    pub fn webpush(account: &str, endpoint_hash: &str) -> String {
        format!("webpush:{account}:{endpoint_hash}")
    }

    /// Prefix selecting an account's push subscriptions.
    pub fn webpush_prefix(account: &str) -> String {
        format!("webpush:{account}:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hist_keys_sort_by_timestamp() {
        let a = ns::hist("#room", 5, "AB-1-1");
        let b = ns::hist("#room", 40, "AB-1-2");
        let c = ns::hist("#room", 400, "AB-1-3");
        assert!(a < b && b < c);
        assert!(a.starts_with(&ns::hist_prefix("#room")));
    }
}
