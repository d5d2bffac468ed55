//! No-op cache backend implementation.
//!
//! Selected with `backend: noop` to switch response caching off without
//! touching the handlers that use it.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use super::{Cache, CacheStats, DEFAULT_TTL, StatsCounters};

/// A cache that never stores anything.
///
/// Every `get` is a miss and is counted as one, so hit-rate dashboards keep
/// working while caching is disabled.
pub struct NoOpCache<V> {
    default_ttl: Duration,
    stats: StatsCounters,
    _phantom: PhantomData<fn() -> V>,
}

impl<V> NoOpCache<V> {
    pub fn new() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            stats: StatsCounters::default(),
            _phantom: PhantomData,
        }
    }

    /// Only reported back through [`Cache::default_ttl`].
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

impl<V> Default for NoOpCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Cache<V> for NoOpCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, _key: &str) -> Option<V> {
        self.stats.miss();
        None
    }

    fn set(&self, _key: &str, _value: V, _ttl: Duration) {}

    fn delete(&self, _key: &str) {}

    fn clear(&self) {}

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn len(&self) -> usize {
        0
    }

    fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

impl<V> fmt::Debug for NoOpCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoOpCache")
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
