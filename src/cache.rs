//! TTL cache shared by resource services
//!
//! Entries expire at an absolute instant. Expired entries read as absent
//! but stay in the map until overwritten, deleted or flushed.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Cache handed to every service by the registry
pub type SharedCache = Arc<TtlCache<Value>>;

/// Conventional key: `"<resource-kind>:<project-id>"`
pub fn cache_key(kind: &str, project_id: &str) -> String {
    format!("{}:{}", kind, project_id)
}

struct CacheEntry<V> {
    value: V,
    /// `None` when the TTL overflows `Instant`, i.e. never expires
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Key/value store with per-entry expiration
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` until `ttl` from now, replacing any existing entry
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), entry);
    }

    /// The value for `key` if present and not yet expired
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    pub fn delete(&self, key: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn flush(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
