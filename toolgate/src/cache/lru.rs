//! Single-lock LRU cache backend.
//!
//! Recency is kept in a doubly linked list whose nodes live in a slab
//! (`Vec<Option<Node>>` plus a free list) and point at each other by index.
//! Promotion and eviction are O(1) splices; nothing ever scans the list except
//! the expiry sweep.
//!
//! Every `get` reorders the list, so there is no shared read path: the map
//! and the list sit behind one mutex.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{Cache, CacheEntry, CacheStats, DEFAULT_TTL, StatsCounters};

struct Node<V> {
    key: String,
    entry: CacheEntry<V>,
    prev: Option<usize>,
    next: Option<usize>,
}

enum Lookup<V> {
    Hit(V),
    Expired,
    Missing,
}

/// Map plus recency list. Head is the most recently used node.
struct LruState<V> {
    index: HashMap<String, usize>,
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    max_size: usize,
}

impl<V: Clone> LruState<V> {
    fn new(max_size: usize) -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            max_size,
        }
    }

    fn node(&self, idx: usize) -> Option<&Node<V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let Some(node) = self.node_mut(idx) else {
            return;
        };
        let (prev, next) = (node.prev.take(), node.next.take());

        match prev.and_then(|p| self.node_mut(p)) {
            Some(prev_node) => prev_node.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.node_mut(n)) {
            Some(next_node) => next_node.prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        let Some(node) = self.node_mut(idx) else {
            return;
        };
        node.prev = None;
        node.next = old_head;

        match old_head.and_then(|h| self.node_mut(h)) {
            Some(head_node) => head_node.prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn promote(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn remove_slot(&mut self, idx: usize) -> Option<Node<V>> {
        self.unlink(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.index.remove(&node.key);
        Some(node)
    }

    fn lookup(&mut self, key: &str, now: Instant) -> Lookup<V> {
        let Some(&idx) = self.index.get(key) else {
            return Lookup::Missing;
        };
        let Some(node) = self.node(idx) else {
            return Lookup::Missing;
        };
        if node.entry.is_expired(now) {
            self.remove_slot(idx);
            return Lookup::Expired;
        }
        let value = node.entry.value.clone();
        self.promote(idx);
        Lookup::Hit(value)
    }

    /// Inserts or overwrites `key` and returns how many entries were evicted.
    fn insert(&mut self, key: &str, entry: CacheEntry<V>) -> usize {
        if let Some(&idx) = self.index.get(key) {
            if let Some(node) = self.node_mut(idx) {
                node.entry = entry;
            }
            self.promote(idx);
            return 0;
        }

        let node = Node {
            key: key.to_owned(),
            entry,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key.to_owned(), idx);
        self.push_front(idx);

        let mut evicted = 0;
        while self.index.len() > self.max_size {
            let Some(tail) = self.tail else { break };
            if let Some(node) = self.remove_slot(tail) {
                trace!(key = node.key, "Evicted least recently used entry");
            }
            evicted += 1;
        }
        evicted
    }

    fn remove(&mut self, key: &str) {
        if let Some(&idx) = self.index.get(key) {
            self.remove_slot(idx);
        }
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Some(node) if node.entry.is_expired(now) => Some(idx),
                _ => None,
            })
            .collect();
        for idx in &expired {
            self.remove_slot(*idx);
        }
        expired.len()
    }

    fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }
}

struct Shared<V> {
    state: Mutex<LruState<V>>,
    stats: StatsCounters,
}

impl<V: Clone> Shared<V> {
    fn lock(&self) -> MutexGuard<'_, LruState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(&self) -> usize {
        let removed = self.lock().remove_expired(Instant::now());
        self.stats.evicted(removed);
        removed
    }
}

/// Handle to the background sweep thread, owned by its cache.
struct Sweeper {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    fn spawn<V>(shared: Weak<Shared<V>>, interval: Duration) -> std::io::Result<Self>
    where
        V: Clone + Send + Sync + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("toolgate-lru-sweep".to_string())
            .spawn(move || sweep_until_stopped(&shared, interval, &stop_rx))?;
        Ok(Self { stop_tx, handle })
    }

    fn stop(self) {
        // a send error means the thread already exited
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("LRU sweep thread panicked");
        }
    }
}

/// Sweeps every `interval` until told to stop or the cache is gone.
fn sweep_until_stopped<V: Clone>(
    shared: &Weak<Shared<V>>,
    interval: Duration,
    stop_rx: &mpsc::Receiver<()>,
) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let removed = shared.sweep();
                if removed > 0 {
                    trace!(removed, "Swept expired entries");
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Capacity-bounded LRU cache behind a single mutex.
///
/// When an insertion pushes the entry count above `max_size`, the least
/// recently used entry (touched by neither `get` nor `set` for the longest
/// time) is evicted.
///
/// A background thread removes expired entries every `sweep_interval`, so
/// memory is reclaimed for keys that are never looked up again. The thread
/// only holds a weak reference to the cache and is stopped by [`LruCache::stop`]
/// or when the cache is dropped, whichever happens first.
pub struct LruCache<V> {
    shared: Arc<Shared<V>>,
    sweeper: Mutex<Option<Sweeper>>,
    default_ttl: Duration,
}

impl<V> LruCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache holding at most `max_size` entries (at least one).
    ///
    /// A zero `sweep_interval` disables the background sweep; expired entries
    /// are then only removed on access or by [`LruCache::cleanup`].
    pub fn new(max_size: usize, sweep_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(LruState::new(max_size.max(1))),
            stats: StatsCounters::default(),
        });

        let sweeper = if sweep_interval.is_zero() {
            None
        } else {
            match Sweeper::spawn(Arc::downgrade(&shared), sweep_interval) {
                Ok(sweeper) => Some(sweeper),
                Err(err) => {
                    warn!(
                        error = %err,
                        "Cannot start LRU sweep thread, expired entries are only removed on access"
                    );
                    None
                }
            }
        };
        debug!(max_size, ?sweep_interval, "Created LRU cache");

        Self {
            shared,
            sweeper: Mutex::new(sweeper),
            default_ttl: DEFAULT_TTL,
        }
    }

    /// Sets the lifetime used by [`Cache::set_default`].
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Stops the background sweep and waits for it to exit.
    ///
    /// Calling it more than once is harmless. The cache stays usable afterwards.
    pub fn stop(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
            debug!("Stopped LRU sweep thread");
        }
    }

    /// Runs one expiry sweep now and returns how many entries it removed.
    pub fn cleanup(&self) -> usize {
        self.shared.sweep()
    }

    pub fn max_size(&self) -> usize {
        self.shared.lock().max_size
    }

    #[cfg(test)]
    fn recency_order(&self) -> Vec<String> {
        let state = self.shared.lock();
        let mut keys = Vec::new();
        let mut cursor = state.head;
        while let Some(idx) = cursor {
            let Some(node) = state.slots.get(idx).and_then(Option::as_ref) else {
                break;
            };
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }
}

impl<V> Cache<V> for LruCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Option<V> {
        let lookup = self.shared.lock().lookup(key, Instant::now());
        match lookup {
            Lookup::Hit(value) => {
                self.shared.stats.hit();
                Some(value)
            }
            Lookup::Expired => {
                self.shared.stats.miss();
                self.shared.stats.evicted(1);
                None
            }
            Lookup::Missing => {
                self.shared.stats.miss();
                None
            }
        }
    }

    fn set(&self, key: &str, value: V, ttl: Duration) {
        let entry = CacheEntry::new(value, ttl);
        let evicted = self.shared.lock().insert(key, entry);
        self.shared.stats.evicted(evicted);
    }

    fn delete(&self, key: &str) {
        self.shared.lock().remove(key);
    }

    fn clear(&self) {
        self.shared.lock().clear();
    }

    fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot()
    }

    fn len(&self) -> usize {
        self.shared.lock().index.len()
    }

    fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

impl<V> Drop for LruCache<V> {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
    }
}

impl<V> fmt::Debug for LruCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sweeping = self
            .sweeper
            .lock()
            .map(|sweeper| sweeper.is_some())
            .unwrap_or_default();
        f.debug_struct("LruCache")
            .field("stats", &self.shared.stats.snapshot())
            .field("sweeping", &sweeping)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}
