// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Operation Result Cache
//!
//! Memoizes operation results so identical invocations skip the engine.
//!
//! ## Cache Key Generation
//!
//! ```text
//! key = SHA256(operation || 0x1f || input[..1024] || 0x1f || serialized args)
//! ```
//!
//! Only the first 1024 bytes of input take part in the key. Two inputs that
//! share that prefix under the same operation and arguments collide; this is
//! accepted in exchange for constant-cost key derivation.
//!
//! ## Eviction
//!
//! Capacity-based only (no TTL). An entry larger than a tenth of the byte budget
//! is never stored. Inserting evicts least-recently-used entries until both the
//! item and the byte budgets have room.

use crate::value::ArgMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Bytes of input that participate in the cache key.
pub const KEY_INPUT_PREFIX: usize = 1024;

const KEY_SEPARATOR: &[u8] = &[0x1f];

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub items: usize,
    pub size: usize,
    pub max_size: usize,
    pub max_items: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Entry<V> {
    value: V,
    size: usize,
}

struct Inner<V> {
    entries: LruCache<String, Entry<V>>,
    current_size: usize,
}

/// Size- and count-bounded LRU cache of operation results.
pub struct OperationCache<V> {
    inner: Mutex<Inner<V>>,
    max_size: usize,
    max_items: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Serialize + Clone> OperationCache<V> {
    pub fn new(max_size: usize, max_items: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                current_size: 0,
            }),
            max_size,
            max_items,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Derive the cache key for an invocation.
    pub fn get_key(operation: &str, input: &[u8], args: &ArgMap) -> String {
        let prefix = &input[..input.len().min(KEY_INPUT_PREFIX)];
        let serialized_args = serde_json::to_vec(args).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update(KEY_SEPARATOR);
        hasher.update(prefix);
        hasher.update(KEY_SEPARATOR);
        hasher.update(&serialized_args);
        hex::encode(hasher.finalize())
    }

    /// Look up a value, marking it most recently used on hit.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %short(key), "cache hit");
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value. Returns false when the value is too large to cache.
    pub fn set(&self, key: String, value: V) -> bool {
        let size = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes.len(),
            Err(_) => return false,
        };
        if size > self.max_size / 10 {
            debug!(key = %short(&key), size, "value exceeds per-entry limit, not cached");
            return false;
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(&key) {
            inner.current_size -= old.size;
        }

        while !inner.entries.is_empty()
            && (inner.entries.len() >= self.max_items || inner.current_size + size > self.max_size)
        {
            if let Some((evicted_key, evicted)) = inner.entries.pop_lru() {
                inner.current_size -= evicted.size;
                debug!(key = %short(&evicted_key), size = evicted.size, "evicted cache entry");
            }
        }

        inner.current_size += size;
        inner.entries.put(key, Entry { value, size });
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.current_size = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            items: inner.entries.len(),
            size: inner.current_size,
            max_size: self.max_size,
            max_items: self.max_items,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn short(key: &str) -> &str {
    &key[..key.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ArgValue;

    fn cache(max_items: usize) -> OperationCache<String> {
        OperationCache::new(1024 * 1024, max_items)
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = cache(3);
        for k in ["k1", "k2", "k3", "k4"] {
            cache.set(k.to_string(), format!("v-{}", k));
        }
        assert!(!cache.contains("k1"));
        assert!(cache.contains("k2"));
        assert!(cache.contains("k4"));
        assert_eq!(cache.stats().items, 3);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cache = cache(3);
        cache.set("k1".into(), "a".into());
        cache.set("k2".into(), "b".into());
        cache.set("k3".into(), "c".into());
        assert_eq!(cache.get("k1"), Some("a".to_string()));
        cache.set("k4".into(), "d".into());

        assert!(cache.contains("k1"));
        assert!(!cache.contains("k2"));
    }

    #[test]
    fn test_oversized_value_not_cached() {
        let cache: OperationCache<String> = OperationCache::new(1000, 10);
        assert!(!cache.set("big".into(), "x".repeat(200)));
        assert_eq!(cache.get("big"), None);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_size_budget_tracks_entries() {
        let cache: OperationCache<String> = OperationCache::new(100, 100);
        // each value serializes to 10 bytes ("\"aaaaaaaa\"")
        for i in 0..12 {
            cache.set(format!("k{}", i), "a".repeat(8));
        }
        let stats = cache.stats();
        assert_eq!(stats.items, 10);
        assert_eq!(stats.size, 100);
        assert!(!cache.contains("k0"));
        assert!(!cache.contains("k1"));
    }

    #[test]
    fn test_replacing_key_keeps_size_consistent() {
        let cache = cache(10);
        cache.set("k".into(), "aaaa".into());
        cache.set("k".into(), "bb".into());
        let stats = cache.stats();
        assert_eq!(stats.items, 1);
        assert_eq!(stats.size, 4);
    }

    #[test]
    fn test_key_is_deterministic_and_sensitive() {
        let mut args = ArgMap::new();
        args.insert("Uppercase".into(), ArgValue::Bool(true));
        let base = OperationCache::<String>::get_key("To Hex", b"abc", &args);

        assert_eq!(base, OperationCache::<String>::get_key("To Hex", b"abc", &args));
        assert_ne!(base, OperationCache::<String>::get_key("To Base64", b"abc", &args));
        assert_ne!(base, OperationCache::<String>::get_key("To Hex", b"abd", &args));
        assert_ne!(base, OperationCache::<String>::get_key("To Hex", b"abc", &ArgMap::new()));
    }

    #[test]
    fn test_key_ignores_input_beyond_prefix() {
        let mut a = vec![b'x'; KEY_INPUT_PREFIX];
        let mut b = a.clone();
        a.push(b'1');
        b.push(b'2');
        let args = ArgMap::new();
        assert_eq!(
            OperationCache::<String>::get_key("To Hex", &a, &args),
            OperationCache::<String>::get_key("To Hex", &b, &args)
        );
    }

    #[test]
    fn test_hit_miss_counters() {
        let cache = cache(10);
        cache.set("k".into(), "v".into());
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        cache.clear();
        assert_eq!(cache.stats().items, 0);
    }
}
