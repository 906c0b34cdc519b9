//! Short-lived, bounded TTL cache backing the proxy's per-request session
//! and ownership lookups (spec §4.J): a few seconds of staleness is an
//! acceptable trade for not round-tripping to Postgres on every proxied
//! byte. Mirrors the teacher's `admin_sessions` TTL-map-with-periodic-sweep
//! shape (`ferrex-server/src/infra/app_state.rs` + `infra/startup.rs`),
//! generalized to any key/value pair instead of one hardcoded struct.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    max_entries: usize,
    entries: DashMap<K, Entry<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self { ttl, max_entries, entries: DashMap::new() }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove(key);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.evict_expired();
        }
        self.entries.insert(key, Entry { value, expires_at: Instant::now() + self.ttl });
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Drops every expired entry; also the fallback when the cache is at
    /// capacity and a fresh insert needs room.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_then_expire_then_miss() {
        let cache: TtlCache<u32, &str> = TtlCache::new(Duration::from_millis(20), 10);
        cache.insert(1, "a");
        assert_eq!(cache.get(&1), Some("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn invalidate_removes_before_expiry() {
        let cache: TtlCache<u32, &str> = TtlCache::new(Duration::from_secs(30), 10);
        cache.insert(1, "a");
        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
    }
}
