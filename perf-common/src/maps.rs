//! Read-mostly lookup tables keyed by kernel event identifiers.
//!
//! Sample dispatch performs one lookup per record, potentially millions per
//! second, while mutations only happen on subscription churn. Every table
//! therefore publishes an immutable snapshot of the whole map through an
//! [`ArcSwap`]: readers load the current snapshot wait-free, writers are
//! serialised by a mutex and publish a rebuilt copy.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;

/// A concurrent map with wait-free lookups and writer-serialised,
/// copy-and-publish mutations.
///
/// The `*_in_place` variants mutate the currently published snapshot without
/// copying. They exist for the narrow teardown and construction paths where
/// the caller can guarantee no reader is concurrently observing the table;
/// see the safety notes on each method.
pub struct SnapshotMap<K, V> {
    /// Serialises writers. Never taken on the lookup path.
    writer: Mutex<()>,
    active: ArcSwap<HashMap<K, V>>,
}

impl<K, V> SnapshotMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(()),
            active: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Wait-free lookup against the currently published snapshot.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.active.load().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.active.load().contains_key(key)
    }

    /// Returns the currently published snapshot. The caller may iterate it
    /// freely; it will never change under them.
    pub fn snapshot(&self) -> Arc<HashMap<K, V>> {
        self.active.load_full()
    }

    pub fn len(&self) -> usize {
        self.active.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.load().is_empty()
    }

    pub fn insert(&self, key: K, value: V) {
        let _guard = self.writer.lock().unwrap();
        let mut next = HashMap::clone(&self.active.load());
        next.insert(key, value);
        self.active.store(Arc::new(next));
    }

    /// Inserts every entry of `entries` in a single publication.
    pub fn update<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let _guard = self.writer.lock().unwrap();
        let mut next = HashMap::clone(&self.active.load());
        next.extend(entries);
        self.active.store(Arc::new(next));
    }

    pub fn remove(&self, key: &K) {
        let _guard = self.writer.lock().unwrap();
        let mut next = HashMap::clone(&self.active.load());
        next.remove(key);
        self.active.store(Arc::new(next));
    }

    /// Removes every key in `keys` in a single publication.
    pub fn remove_all(&self, keys: &[K]) {
        let _guard = self.writer.lock().unwrap();
        let mut next = HashMap::clone(&self.active.load());
        for key in keys {
            next.remove(key);
        }
        self.active.store(Arc::new(next));
    }

    /// Inserts into the currently published snapshot without copying it.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no reader can observe the published
    /// snapshot for the duration of the call: either the map has not been
    /// shared yet (initial construction), or every path that could read it
    /// is quiescent (e.g. the owning group is disabled and its readers have
    /// exited). Concurrent `lookup` calls during an in-place mutation are a
    /// data race.
    pub unsafe fn insert_in_place(&self, key: K, value: V) {
        let snapshot = self.active.load();
        let map = Arc::as_ptr(&*snapshot) as *mut HashMap<K, V>;
        (*map).insert(key, value);
    }

    /// Bulk-insert variant of [`insert_in_place`](Self::insert_in_place).
    ///
    /// # Safety
    ///
    /// Same contract as [`insert_in_place`](Self::insert_in_place).
    pub unsafe fn update_in_place<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let snapshot = self.active.load();
        let map = Arc::as_ptr(&*snapshot) as *mut HashMap<K, V>;
        (*map).extend(entries);
    }

    /// Removes from the currently published snapshot without copying it.
    ///
    /// # Safety
    ///
    /// Same contract as [`insert_in_place`](Self::insert_in_place).
    pub unsafe fn remove_in_place(&self, key: &K) {
        let snapshot = self.active.load();
        let map = Arc::as_ptr(&*snapshot) as *mut HashMap<K, V>;
        (*map).remove(key);
    }

    /// Bulk-remove variant of [`remove_in_place`](Self::remove_in_place).
    ///
    /// # Safety
    ///
    /// Same contract as [`insert_in_place`](Self::insert_in_place).
    pub unsafe fn remove_all_in_place(&self, keys: &[K]) {
        let snapshot = self.active.load();
        let map = Arc::as_ptr(&*snapshot) as *mut HashMap<K, V>;
        for key in keys {
            (*map).remove(key);
        }
    }
}

impl<K, V> Default for SnapshotMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic per-key counters, e.g. lost-sample counts per stream id.
pub type CounterMap = SnapshotMap<u64, u64>;

impl CounterMap {
    /// Adds `delta` to the counter stored under `key`.
    pub fn add(&self, key: u64, delta: u64) {
        let _guard = self.writer.lock().unwrap();
        let mut next = HashMap::clone(&self.active.load());
        *next.entry(key).or_insert(0) += delta;
        self.active.store(Arc::new(next));
    }
}
