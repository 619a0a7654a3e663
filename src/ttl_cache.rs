use std::{hash::Hash, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

/// Bounded, time-windowed map.
///
/// Entries older than `ttl` no longer count as present and are physically
/// removed by [`TtlCache::evict_expired`], either from the periodic sweeper or
/// when an insert finds the map at `max_entries`. If the map is still full
/// after dropping expired entries, the oldest entry is evicted.
#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, (V, Instant)>,
    ttl: Duration,
    max_entries: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Insert `key` unless a live entry already exists.
    ///
    /// Returns `true` when the key was absent (or expired) and is now stored,
    /// `false` when a live entry was already present. The check and the insert
    /// happen under the same shard lock.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        self.make_room(&key);
        let now = Instant::now();
        let mut fresh = false;
        self.entries
            .entry(key)
            .and_modify(|(v, inserted_at)| {
                if inserted_at.elapsed() >= self.ttl {
                    *v = value.clone();
                    *inserted_at = now;
                    fresh = true;
                }
            })
            .or_insert_with(|| {
                fresh = true;
                (value.clone(), now)
            });
        fresh
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, (_, inserted_at)| inserted_at.elapsed() < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn a task that calls [`TtlCache::evict_expired`] every `interval`.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.evict_expired();
                if removed > 0 {
                    debug!(removed, remaining = self.len(), "TTL cache sweep");
                }
            }
        })
    }

    fn make_room(&self, incoming: &K) {
        if self.entries.len() < self.max_entries || self.entries.contains_key(incoming) {
            return;
        }
        self.evict_expired();
        if self.entries.len() < self.max_entries {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().1)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = TtlCache::new(Duration::from_secs(5), 10);
        assert!(cache.insert_if_absent("a", 1));
        assert_eq!(cache.evict_expired(), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn insert_if_absent_detects_duplicates_within_window() {
        let cache = TtlCache::new(Duration::from_secs(5), 10);
        assert!(cache.insert_if_absent("msg", ()));
        assert!(!cache.insert_if_absent("msg", ()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.insert_if_absent("msg", ()));
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_oldest() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert_if_absent("a", 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert_if_absent("b", 2);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert_if_absent("c", 3);

        assert_eq!(cache.len(), 2);
        assert!(!cache.insert_if_absent("b", 2));
        assert!(!cache.insert_if_absent("c", 3));
        // "a" was the one evicted, so it is accepted again.
        assert!(cache.insert_if_absent("a", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_entries() {
        let cache = Arc::new(TtlCache::new(Duration::from_secs(2), 10));
        cache.insert_if_absent("a", 1);
        let handle = cache.clone().spawn_sweeper(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(cache.is_empty());
        handle.abort();
    }
}
