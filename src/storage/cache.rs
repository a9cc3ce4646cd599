//! # Write-Back Node Cache
//!
//! A bounded, thread-safe map from slot number to an in-memory node image.
//! The cache stores shared handles, so an operation holding a handle is
//! never invalidated by eviction; the image it points at simply leaves the
//! map and flushes through the disposer (or, if the operation still holds
//! its lock, later through the handle's own drop path).
//!
//! ## Replacement Policy: Approximate LFU
//!
//! Every entry carries a monotonically non-decreasing access counter.
//! `get` bumps the counter; eviction removes the entry with the smallest
//! counter (ties broken arbitrarily). When a counter reaches
//! `ACCESS_CEILING` the cache rescales instead of letting it saturate:
//! the global minimum is subtracted from every counter. Without the
//! rescale, a long-lived entry with a saturated counter would become
//! immortal.
//!
//! ## Write-Back Disposal
//!
//! Eviction and [`clear`](NodeCache::clear) invoke a disposer callback with
//! each removed handle. The volume supplies a disposer that flushes dirty
//! images. Two rules keep this deadlock-free:
//!
//! 1. The disposer runs **after** the map lock is released. An insert that
//!    evicts may be running inside a tree operation; a reader racing that
//!    operation may be blocked on the map lock in `get`, so reaching into
//!    node locks while holding the map lock would invert the order.
//! 2. The disposer must not block on node locks either: the volume's
//!    disposer uses `try_write` and leaves a busy node to flush when its
//!    last handle drops. Flush is idempotent on a clean image, so the
//!    double trigger is harmless.
//!
//! ## Lock Granularity
//!
//! One `RwLock` over the whole map: `get` is a read-lock plus one atomic
//! increment, and mutation windows only cover map surgery, never I/O.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::ACCESS_CEILING;

pub type Disposer<T> = Box<dyn Fn(&T) -> Result<()> + Send + Sync>;

struct CacheEntry<T> {
    handle: T,
    hits: AtomicU64,
}

impl<T> CacheEntry<T> {
    fn new(handle: T) -> Self {
        Self {
            handle,
            hits: AtomicU64::new(0),
        }
    }
}

pub struct NodeCache<T: Clone> {
    map: RwLock<HashMap<u64, CacheEntry<T>>>,
    capacity: usize,
    disposer: Disposer<T>,
}

impl<T: Clone> NodeCache<T> {
    pub fn new(capacity: usize, disposer: Disposer<T>) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            map: RwLock::new(HashMap::with_capacity(capacity.min(4096))),
            capacity,
            disposer,
        }
    }

    /// Looks up the node cached under `slot`, bumping its access counter.
    pub fn get(&self, slot: u64) -> Option<T> {
        let mut needs_rescale = false;
        let handle = {
            let map = self.map.read();
            let entry = map.get(&slot)?;
            let before = entry.hits.fetch_add(1, Ordering::Relaxed);
            if before + 1 >= ACCESS_CEILING {
                needs_rescale = true;
            }
            entry.handle.clone()
        };

        if needs_rescale {
            self.rescale();
        }
        Some(handle)
    }

    /// Inserts `handle` under `slot`, replacing any previous entry for the
    /// slot and evicting the least-frequently-used entry when at capacity.
    ///
    /// The evicted and replaced handles are passed to the disposer after
    /// the map lock is dropped; the first disposal error is returned once
    /// every removed handle has been offered.
    pub fn insert(&self, slot: u64, handle: T) -> Result<()> {
        let mut removed = Vec::new();
        {
            let mut map = self.map.write();
            if let Some(previous) = map.remove(&slot) {
                removed.push(previous.handle);
            } else if map.len() >= self.capacity {
                if let Some(victim) = Self::coldest(&map) {
                    let entry = map.remove(&victim).expect("victim chosen from map");
                    removed.push(entry.handle);
                }
            }
            map.insert(slot, CacheEntry::new(handle));
        }

        self.dispose(removed)
    }

    /// Removes the entry for `slot` without disposing it.
    ///
    /// Used when a merge vacates a slot: the image is tombstoned and must
    /// not be written back, so flushing here would resurrect a file the
    /// allocator just unlinked.
    pub fn erase(&self, slot: u64) {
        self.map.write().remove(&slot);
    }

    /// Drains the cache, disposing every entry.
    pub fn clear(&self) -> Result<()> {
        let drained: Vec<T> = {
            let mut map = self.map.write();
            map.drain().map(|(_, entry)| entry.handle).collect()
        };
        self.dispose(drained)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn coldest(map: &HashMap<u64, CacheEntry<T>>) -> Option<u64> {
        map.iter()
            .min_by_key(|(_, entry)| entry.hits.load(Ordering::Relaxed))
            .map(|(slot, _)| *slot)
    }

    fn rescale(&self) {
        let map = self.map.write();
        let min = map
            .values()
            .map(|entry| entry.hits.load(Ordering::Relaxed))
            .min()
            .unwrap_or(0);
        if min == 0 {
            return;
        }
        for entry in map.values() {
            let hits = entry.hits.load(Ordering::Relaxed);
            entry.hits.store(hits.saturating_sub(min), Ordering::Relaxed);
        }
    }

    fn dispose(&self, removed: Vec<T>) -> Result<()> {
        let mut first_error = None;
        for handle in &removed {
            if let Err(err) = (self.disposer)(handle) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl<T: Clone> std::fmt::Debug for NodeCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_cache(capacity: usize) -> (Arc<AtomicUsize>, NodeCache<u64>) {
        let disposed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&disposed);
        let cache = NodeCache::new(
            capacity,
            Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        (disposed, cache)
    }

    #[test]
    fn get_returns_inserted_handles() {
        let (_, cache) = counting_cache(4);
        cache.insert(2, 20).unwrap();
        assert_eq!(cache.get(2), Some(20));
        assert_eq!(cache.get(3), None);
    }

    #[test]
    fn eviction_picks_the_least_frequently_used_entry() {
        let (disposed, cache) = counting_cache(2);
        cache.insert(1, 10).unwrap();
        cache.insert(2, 20).unwrap();

        // Heat up slot 1 so slot 2 is the coldest.
        for _ in 0..3 {
            cache.get(1);
        }

        cache.insert(3, 30).unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(2), None);
        assert_eq!(cache.get(1), Some(10));
        assert_eq!(cache.get(3), Some(30));
    }

    #[test]
    fn replacing_a_slot_disposes_the_old_handle_without_eviction() {
        let (disposed, cache) = counting_cache(2);
        cache.insert(1, 10).unwrap();
        cache.insert(2, 20).unwrap();
        cache.insert(1, 11).unwrap();

        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(1), Some(11));
        assert_eq!(cache.get(2), Some(20));
    }

    #[test]
    fn erase_removes_without_disposing() {
        let (disposed, cache) = counting_cache(2);
        cache.insert(1, 10).unwrap();
        cache.erase(1);

        assert_eq!(disposed.load(Ordering::SeqCst), 0);
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn clear_disposes_every_entry() {
        let (disposed, cache) = counting_cache(8);
        for slot in 2..7 {
            cache.insert(slot, slot * 10).unwrap();
        }
        cache.clear().unwrap();

        assert_eq!(disposed.load(Ordering::SeqCst), 5);
        assert!(cache.is_empty());
    }

    #[test]
    fn disposer_errors_surface_from_insert() {
        let cache: NodeCache<u64> =
            NodeCache::new(1, Box::new(|_| eyre::bail!("disk full")));
        cache.insert(1, 10).unwrap();
        let err = cache.insert(2, 20).unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }
}
