//! Compute-once cache for a single value.

use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::trace;

use super::{CacheStats, StatsCounters};

/// Boxed producer, for storing a `LazyCache` without naming a closure type.
pub type Producer<V> = Box<dyn Fn() -> V + Send + Sync>;

/// Guards an expensive producer so it runs at most once between invalidations.
///
/// `get` first checks under the shared lock. Only when the value is missing
/// does it take the exclusive lock, check again (a concurrent caller may have
/// produced it while this one waited) and then run the producer. Callers that
/// arrive during production block until the value is stored and then share it.
///
/// Stats count a `get` answered from the stored value as a hit and a `get`
/// that ran the producer as a miss.
pub struct LazyCache<V, F = Producer<V>> {
    producer: F,
    value: RwLock<Option<V>>,
    stats: StatsCounters,
}

impl<V> LazyCache<V>
where
    V: Clone,
{
    /// Creates a cache around a boxed producer.
    pub fn boxed<P>(producer: P) -> Self
    where
        P: Fn() -> V + Send + Sync + 'static,
    {
        Self::new(Box::new(producer))
    }
}

impl<V, F> LazyCache<V, F>
where
    V: Clone,
    F: Fn() -> V,
{
    pub fn new(producer: F) -> Self {
        Self {
            producer,
            value: RwLock::new(None),
            stats: StatsCounters::default(),
        }
    }

    pub fn get(&self) -> V {
        if let Some(value) = self.read().as_ref() {
            self.stats.hit();
            return value.clone();
        }

        let mut slot = self.write();
        if let Some(value) = slot.as_ref() {
            self.stats.hit();
            return value.clone();
        }

        trace!("Producing lazily cached value");
        let value = (self.producer)();
        *slot = Some(value.clone());
        self.stats.miss();
        value
    }

    /// Drops the stored value; the next `get` runs the producer again.
    pub fn invalidate(&self) {
        *self.write() = None;
    }

    pub fn is_populated(&self) -> bool {
        self.read().is_some()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<V>> {
        self.value.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<V>> {
        self.value.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V, F> fmt::Debug for LazyCache<V, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let populated = self
            .value
            .read()
            .map(|value| value.is_some())
            .unwrap_or_default();
        f.debug_struct("LazyCache")
            .field("populated", &populated)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
