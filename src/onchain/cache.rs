//! Time-bounded read cache for contract-derived pool state.
//!
//! Entries are never evicted in the background: freshness is evaluated
//! lazily on every lookup (`now - fetched_at_ms < ttl`). An expired entry
//! keeps its value so callers can serve it while a refetch is in flight.

use crate::pool::PoolId;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// A cached value and the time it was read.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub fetched_at_ms: u64,
}

impl<V> CacheEntry<V> {
    pub fn is_fresh(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.fetched_at_ms) < ttl_ms
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    Fresh(V),
    /// Past its TTL. Needs a refetch; the old value may stand in meanwhile.
    Stale(V),
    Missing,
}

impl<V> Lookup<V> {
    pub fn needs_refetch(&self) -> bool {
        !matches!(self, Lookup::Fresh(_))
    }

    /// The value regardless of freshness (stale-while-revalidate).
    pub fn into_value(self) -> Option<V> {
        match self {
            Lookup::Fresh(v) | Lookup::Stale(v) => Some(v),
            Lookup::Missing => None,
        }
    }
}

/// Thread-safe TTL cache keyed by pool id.
#[derive(Clone)]
pub struct TtlCache<V> {
    /// pool id → last successful read
    entries: Arc<DashMap<PoolId, CacheEntry<V>>>,
    ttl_ms: u64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn get(&self, id: &PoolId, now_ms: u64) -> Lookup<V> {
        match self.entries.get(id) {
            Some(entry) if entry.is_fresh(now_ms, self.ttl_ms) => {
                Lookup::Fresh(entry.value.clone())
            }
            Some(entry) => Lookup::Stale(entry.value.clone()),
            None => Lookup::Missing,
        }
    }

    pub fn put(&self, id: PoolId, value: V, now_ms: u64) {
        self.entries.insert(
            id,
            CacheEntry {
                value,
                fetched_at_ms: now_ms,
            },
        );
    }

    pub fn is_fresh(&self, id: &PoolId, now_ms: u64) -> bool {
        self.entries
            .get(id)
            .map(|entry| entry.is_fresh(now_ms, self.ttl_ms))
            .unwrap_or(false)
    }

    /// Force the next lookup for `id` to miss.
    pub fn invalidate(&self, id: &PoolId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(30_000);

    #[test]
    fn test_entry_fresh_until_ttl_elapses() {
        let cache = TtlCache::new(TTL);
        let id = PoolId::from(42);
        cache.put(id.clone(), "v1", 1_000);

        assert!(cache.is_fresh(&id, 1_000));
        assert!(cache.is_fresh(&id, 30_999));
        assert!(!cache.is_fresh(&id, 31_000));
        assert_eq!(cache.get(&id, 20_000), Lookup::Fresh("v1"));
    }

    #[test]
    fn test_expired_entry_keeps_value_for_revalidation() {
        let cache = TtlCache::new(TTL);
        let id = PoolId::from(7);
        cache.put(id.clone(), 5u32, 0);

        let lookup = cache.get(&id, 45_000);
        assert!(lookup.needs_refetch());
        assert_eq!(lookup.into_value(), Some(5));
    }

    #[test]
    fn test_missing_and_invalidated_ids_need_refetch() {
        let cache: TtlCache<u32> = TtlCache::new(TTL);
        let id = PoolId::from(1);
        assert_eq!(cache.get(&id, 0), Lookup::Missing);
        assert!(!cache.is_fresh(&id, 0));

        cache.put(id.clone(), 1, 0);
        assert!(cache.invalidate(&id));
        assert!(!cache.invalidate(&id));
        assert!(cache.get(&id, 0).needs_refetch());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_refreshes_timestamp() {
        let cache = TtlCache::new(TTL);
        let id = PoolId::from(3);
        cache.put(id.clone(), 1u8, 0);
        cache.put(id.clone(), 2u8, 40_000);
        assert_eq!(cache.get(&id, 50_000), Lookup::Fresh(2));
        assert_eq!(cache.len(), 1);
    }
}
