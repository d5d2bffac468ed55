//! Pluggable TTL cache backends.
//!
//! Handlers memoize upstream responses keyed by request parameters through the
//! [`Cache`] trait. Backends differ only in how they trade lock contention for
//! eviction precision:
//!
//! - **LRU** ([`LruCache`]): one lock over a map and an arena-backed recency
//!   list. Exact least-recently-used eviction, plus a background sweep that
//!   drops expired entries nobody asks for again.
//! - **Segmented** ([`SegmentedCache`]): the keyspace is split across a fixed
//!   power-of-two number of independently locked segments. Keys in different
//!   segments never contend. Eviction inside a full segment removes the entry
//!   that expires first, which only approximates LRU.
//! - **NoOp** ([`NoOpCache`]): stores nothing. Every lookup is a miss.
//!
//! [`LazyCache`] is not keyed and does not implement [`Cache`]. It guards a
//! single expensive producer so that it runs at most once until invalidated.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use toolgate::cache::{Cache, CacheBackend, new_cache};
//! use toolgate::config::CachingConfig;
//!
//! let config = CachingConfig { backend: CacheBackend::Segmented, ..Default::default() };
//! let cache = new_cache::<String>(&config);
//!
//! cache.set("pods/default", "[]".to_string(), Duration::from_secs(30));
//! assert_eq!(cache.get("pods/default").as_deref(), Some("[]"));
//! assert_eq!(cache.stats().hits, 1);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CachingConfig;

/// Lifetime given to entries stored with [`Cache::set_default`] unless
/// configured otherwise.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

pub mod lazy;
pub mod lru;
pub mod noop;
pub mod segmented;
mod stats;

pub use lazy::LazyCache;
pub use lru::LruCache;
pub use noop::NoOpCache;
pub use segmented::SegmentedCache;
pub use stats::CacheStats;
pub(crate) use stats::StatsCounters;

/// Common contract of the keyed cache backends.
///
/// The trait is object safe so handlers can hold an `Arc<dyn Cache<V>>` and
/// have the backend picked by configuration.
///
/// Expired entries behave exactly like absent ones: `get` reports a miss and
/// removes the entry on the way.
pub trait Cache<V>: Send + Sync + fmt::Debug
where
    V: Clone + Send + Sync + 'static,
{
    /// Returns a copy of the value stored under `key`, if present and not expired.
    fn get(&self, key: &str) -> Option<V>;

    /// Stores `value` under `key` until `ttl` elapses, replacing any previous entry.
    fn set(&self, key: &str, value: V, ttl: Duration);

    /// Removes `key`. Missing keys are ignored.
    fn delete(&self, key: &str);

    /// Removes every entry.
    fn clear(&self);

    /// Snapshot of the hit, miss and eviction counters.
    fn stats(&self) -> CacheStats;

    /// Number of stored entries, including expired ones not yet removed.
    fn len(&self) -> usize;

    /// Lifetime used by [`Cache::set_default`].
    fn default_ttl(&self) -> Duration;

    /// Stores `value` under `key` for the backend's default lifetime.
    fn set_default(&self, key: &str, value: V) {
        self.set(key, value, self.default_ttl())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A stored value and the instant after which it is no longer served.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: expiry_after(Instant::now(), ttl),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

// Roughly a century; used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

pub(crate) fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Selects the [`Cache`] implementation built by [`new_cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// Single-lock LRU with a background expiry sweep.
    #[default]
    Lru,

    /// Hash-partitioned segments with independent locks.
    Segmented,

    /// Caching disabled.
    #[serde(rename = "noop", alias = "no_op")]
    NoOp,
}

impl CacheBackend {
    /// Every backend.
    pub const ALL: [CacheBackend; 3] = [Self::Lru, Self::Segmented, Self::NoOp];

    /// Returns a human-readable name for the cache backend.
    pub fn name(&self) -> &'static str {
        match self {
            CacheBackend::Lru => "lru",
            CacheBackend::Segmented => "segmented",
            CacheBackend::NoOp => "noop",
        }
    }
}

impl fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builds the backend selected by `config`.
///
/// Every backend uses `config.default_ttl` for [`Cache::set_default`]. The LRU
/// backend starts its sweep thread here; it stops when the last reference to
/// the returned cache is dropped.
pub fn new_cache<V>(config: &CachingConfig) -> Arc<dyn Cache<V>>
where
    V: Clone + Send + Sync + 'static,
{
    tracing::debug!(
        backend = %config.backend,
        max_entries = config.max_entries,
        "Building response cache"
    );
    let ttl = config.default_ttl;
    match config.backend {
        CacheBackend::Lru => {
            let cache = LruCache::new(config.max_entries, config.sweep_interval);
            Arc::new(cache.with_default_ttl(ttl))
        }
        CacheBackend::Segmented => {
            let cache = SegmentedCache::with_segments(config.max_entries, config.segments);
            Arc::new(cache.with_default_ttl(ttl))
        }
        CacheBackend::NoOp => Arc::new(NoOpCache::new().with_default_ttl(ttl)),
    }
}
