//! Segmented (sharded) cache backend.
//!
//! The keyspace is partitioned across a fixed, power-of-two number of
//! segments, each with its own lock, store and capacity. A key is routed by
//! the top bits of its `FxHash`, so it lands in the same segment for the whole
//! life of the cache and operations on keys in different segments never wait
//! on each other.
//!
//! A full segment evicts the entry with the earliest expiry, found with a
//! linear scan of that segment. This is not LRU: recency is not tracked at
//! all, which is what lets lookups run under a shared read lock.

use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use rustc_hash::FxBuildHasher;
use tracing::{debug, trace};

use super::{Cache, CacheEntry, CacheStats, DEFAULT_TTL, StatsCounters};

pub const DEFAULT_SEGMENTS: usize = 16;

/// Upper bound on the segment count; larger requests are clamped to it.
pub const MAX_SEGMENTS: usize = 1 << 16;

struct Segment<V> {
    store: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V> Segment<V> {
    fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cache split into independently locked segments.
///
/// Capacity is enforced per segment: each holds at most
/// `max(max_size / segments, 1)` entries, so the total can fall short of
/// `max_size` when keys hash unevenly.
///
/// Unlike the other backends, [`Cache::clear`] also resets the statistics.
pub struct SegmentedCache<V> {
    segments: Box<[Segment<V>]>,
    shift: u32,
    segment_capacity: usize,
    default_ttl: Duration,
    stats: StatsCounters,
}

impl<V> SegmentedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache with [`DEFAULT_SEGMENTS`] segments.
    pub fn new(max_size: usize) -> Self {
        Self::with_segments(max_size, DEFAULT_SEGMENTS)
    }

    /// Creates a cache with `segments` segments, clamped to `1..=MAX_SEGMENTS`
    /// and rounded up to a power of two.
    pub fn with_segments(max_size: usize, segments: usize) -> Self {
        let count = segments.clamp(1, MAX_SEGMENTS).next_power_of_two();
        let segment_capacity = (max_size / count).max(1);
        debug!(
            segments = count,
            segment_capacity,
            "Created segmented cache"
        );

        Self {
            segments: (0..count).map(|_| Segment::new()).collect(),
            shift: u64::BITS - count.trailing_zeros(),
            segment_capacity,
            default_ttl: DEFAULT_TTL,
            stats: StatsCounters::default(),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_capacity(&self) -> usize {
        self.segment_capacity
    }

    /// Removes expired entries from every segment and returns how many were removed.
    ///
    /// Segments are swept one at a time; other segments stay available meanwhile.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let removed: usize = self
            .segments
            .iter()
            .map(|segment| {
                let mut store = segment.write();
                let before = store.len();
                store.retain(|_, entry| !entry.is_expired(now));
                before - store.len()
            })
            .sum();
        self.stats.evicted(removed);
        removed
    }

    pub(crate) fn segment_index(&self, key: &str) -> usize {
        if self.segments.len() == 1 {
            return 0;
        }
        // FxHash mixes best into the high bits
        (FxBuildHasher.hash_one(key) >> self.shift) as usize
    }

    fn segment(&self, key: &str) -> &Segment<V> {
        &self.segments[self.segment_index(key)]
    }

    /// Lookup under the segment's write lock, after a read saw an expired entry.
    ///
    /// Another writer may have replaced the entry in between, so it is checked
    /// again: a live entry is a hit, an expired one is removed.
    fn get_exclusive(&self, key: &str, now: Instant) -> Option<V> {
        let mut store = self.segment(key).write();
        match store.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                let value = entry.value.clone();
                self.stats.hit();
                return Some(value);
            }
            Some(_) => {
                store.remove(key);
                self.stats.evicted(1);
            }
            None => {}
        }
        self.stats.miss();
        None
    }
}

fn earliest_expiry<V>(store: &HashMap<String, CacheEntry<V>>) -> Option<String> {
    store
        .iter()
        .min_by_key(|(_, entry)| entry.expires_at)
        .map(|(key, _)| key.clone())
}

impl<V> Cache<V> for SegmentedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Option<V> {
        let segment = self.segment(key);
        let now = Instant::now();
        {
            let store = segment.read();
            match store.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    let value = entry.value.clone();
                    self.stats.hit();
                    return Some(value);
                }
                Some(_) => {}
                None => {
                    self.stats.miss();
                    return None;
                }
            }
        }
        self.get_exclusive(key, now)
    }

    fn set(&self, key: &str, value: V, ttl: Duration) {
        let mut store = self.segment(key).write();
        if !store.contains_key(key) && store.len() >= self.segment_capacity {
            if let Some(victim) = earliest_expiry(&store) {
                store.remove(&victim);
                trace!(key = victim, "Evicted entry closest to expiry");
                self.stats.evicted(1);
            }
        }
        store.insert(key.to_owned(), CacheEntry::new(value, ttl));
    }

    fn delete(&self, key: &str) {
        self.segment(key).write().remove(key);
    }

    fn clear(&self) {
        for segment in self.segments.iter() {
            segment.write().clear();
        }
        self.stats.reset();
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| segment.read().len())
            .sum()
    }

    fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

impl<V> fmt::Debug for SegmentedCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedCache")
            .field("segments", &self.segments.len())
            .field("segment_capacity", &self.segment_capacity)
            .field("default_ttl", &self.default_ttl)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::{Arc, mpsc};
    use std::thread::{self, sleep};

    use pretty_assertions::assert_eq;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    /// Finds two keys routed to different segments.
    fn keys_in_different_segments(cache: &SegmentedCache<u32>) -> (String, String) {
        let first = "key-0".to_string();
        let first_segment = cache.segment_index(&first);
        let second = (1..1000)
            .map(|i| format!("key-{i}"))
            .find(|key| cache.segment_index(key) != first_segment)
            .expect("no key found in another segment");
        (first, second)
    }

    #[toolgate_macros::test]
    fn test_segment_count_is_power_of_two() {
        let cache = SegmentedCache::<u32>::with_segments(100, 10);
        assert_eq!(cache.segment_count(), 16);
        assert_eq!(cache.segment_capacity(), 6);

        let single = SegmentedCache::<u32>::with_segments(10, 0);
        assert_eq!(single.segment_count(), 1);
        assert_eq!(single.segment_index("anything"), 0);

        let tiny = SegmentedCache::<u32>::new(4);
        assert_eq!(tiny.segment_count(), DEFAULT_SEGMENTS);
        assert_eq!(tiny.segment_capacity(), 1);
    }

    #[toolgate_macros::test]
    fn test_segment_count_is_clamped() {
        let cache = SegmentedCache::<u32>::with_segments(10, usize::MAX);
        assert_eq!(cache.segment_count(), MAX_SEGMENTS);
        assert_eq!(cache.segment_capacity(), 1);

        let key = "namespace/pod-0";
        assert!(cache.segment_index(key) < MAX_SEGMENTS);
        cache.set(key, 1, HOUR);
        assert_eq!(cache.get(key), Some(1));
    }

    #[toolgate_macros::test]
    fn test_key_routing_is_stable() {
        let cache = SegmentedCache::<u32>::new(1024);
        for i in 0..200 {
            let key = format!("namespace/pod-{i}");
            let segment = cache.segment_index(&key);
            assert!(segment < cache.segment_count());
            assert_eq!(cache.segment_index(&key), segment);
        }
    }

    #[toolgate_macros::test]
    fn test_keys_spread_across_segments() {
        let cache = SegmentedCache::<u32>::new(1024);
        let used: std::collections::HashSet<usize> = (0..512)
            .map(|i| cache.segment_index(&format!("key-{i}")))
            .collect();
        assert!(
            used.len() > DEFAULT_SEGMENTS / 2,
            "only {} segments used",
            used.len()
        );
    }

    #[toolgate_macros::test]
    fn test_full_segment_evicts_earliest_expiry() {
        let cache = SegmentedCache::with_segments(2, 1);
        cache.set("a", 1, HOUR);
        cache.set("b", 2, Duration::from_secs(60));
        // "a" is older but expires later, so "b" goes
        cache.set("c", 3, HOUR);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[toolgate_macros::test]
    fn test_overwrite_in_full_segment_does_not_evict() {
        let cache = SegmentedCache::with_segments(2, 1);
        cache.set("a", 1, HOUR);
        cache.set("b", 2, HOUR);
        cache.set("a", 10, Duration::from_secs(1));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[toolgate_macros::test]
    fn test_expired_entry_is_removed_on_get() {
        let cache = SegmentedCache::new(64);
        cache.set("pod-abc", 1, Duration::from_millis(50));
        assert_eq!(cache.get("pod-abc"), Some(1));

        sleep(Duration::from_millis(60));
        assert_eq!(cache.get("pod-abc"), None);
        let expected = CacheStats {
            hits: 1,
            misses: 1,
            evictions: 1,
        };
        assert_eq!(cache.stats(), expected);
        assert!(cache.is_empty());
    }

    #[toolgate_macros::test]
    fn test_exclusive_get_returns_entry_replaced_by_another_writer() {
        let cache = SegmentedCache::new(64);
        let stale_read = Instant::now();
        // a writer replaced the expired entry after the read lock was released
        cache.set("pod-abc", 2, HOUR);

        assert_eq!(cache.get_exclusive("pod-abc", stale_read), Some(2));
        assert_eq!(cache.get_exclusive("missing", stale_read), None);
        let expected = CacheStats {
            hits: 1,
            misses: 1,
            evictions: 0,
        };
        assert_eq!(cache.stats(), expected);
        assert_eq!(cache.len(), 1);
    }

    #[toolgate_macros::test]
    fn test_exclusive_get_removes_entry_still_expired() {
        let cache = SegmentedCache::new(64);
        cache.set("pod-abc", 1, Duration::from_millis(10));

        let later = Instant::now() + Duration::from_millis(20);
        assert_eq!(cache.get_exclusive("pod-abc", later), None);
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.is_empty());
    }

    #[toolgate_macros::test]
    fn test_cleanup_sweeps_all_segments() {
        let cache = SegmentedCache::new(4096);
        for i in 0..40 {
            cache.set(&format!("short-{i}"), i, Duration::from_millis(5));
            cache.set(&format!("long-{i}"), i, HOUR);
        }
        sleep(Duration::from_millis(15));

        assert_eq!(cache.cleanup(), 40);
        assert_eq!(cache.len(), 40);
    }

    #[toolgate_macros::test]
    fn test_clear_resets_stats() {
        let cache = SegmentedCache::new(64);
        cache.set("a", 1, HOUR);
        cache.get("a");
        cache.get("missing");
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[toolgate_macros::test]
    fn test_locked_segment_does_not_block_other_segments() {
        let cache: Arc<SegmentedCache<u32>> = Arc::new(SegmentedCache::new(1024));
        let (blocked_key, free_key) = keys_in_different_segments(&cache);
        cache.set(&free_key, 1, HOUR);

        let blocked_segment = cache.segment_index(&blocked_key);
        let guard = cache.segments[blocked_segment].write();

        let (done_tx, done_rx) = mpsc::channel();
        let worker = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                cache.set(&free_key, 2, HOUR);
                let value = cache.get(&free_key);
                cache.delete(&free_key);
                done_tx.send(value).unwrap();
            })
        };

        let value = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("operation on another segment was blocked");
        assert_eq!(value, Some(2));
        drop(guard);
        worker.join().unwrap();
    }

    #[toolgate_macros::test]
    fn test_locked_segment_blocks_its_own_keys() {
        let cache: Arc<SegmentedCache<u32>> = Arc::new(SegmentedCache::new(1024));
        let key = "key-0".to_string();
        let guard = cache.segments[cache.segment_index(&key)].write();

        let (done_tx, done_rx) = mpsc::channel();
        let worker = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                cache.set(&key, 1, HOUR);
                done_tx.send(()).unwrap();
            })
        };

        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        worker.join().unwrap();
    }
}
