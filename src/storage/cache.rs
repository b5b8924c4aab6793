//! # Reference-Counted Resource Cache
//!
//! This module implements the admission cache shared by the page store and
//! the record manager. Unlike recency-based caches, eviction here is driven
//! purely by reference counting: a resource stays resident exactly as long
//! as someone holds it, and is evicted (flushed, for dirty pages) the
//! moment its last holder releases it.
//!
//! ## Why Reference Counting Instead of LRU?
//!
//! A recency policy can evict a resource that is still in use, which for a
//! page under active mutation means either blocking eviction anyway or
//! corrupting an in-flight writer. Counting references makes the safety
//! property structural: eviction only happens at refs-zero, so a holder is
//! never invalidated underneath its feet.
//!
//! ## Single-Loader Gate
//!
//! When two threads miss on the same key concurrently, only one performs
//! the disk load. The second thread observes the key in the `loading` set,
//! releases the cache mutex, sleeps for one millisecond and retries. The
//! coarse poll is deliberate: a load is bounded by a single page read and
//! same-key contention is rare, so a per-key condition variable would buy
//! latency nobody observes.
//!
//! ## State Machine
//!
//! All bookkeeping lives under one mutex and is never split:
//!
//! ```text
//! entries: key -> Arc<Item>    resident resources
//! refs:    key -> usize        live holders per resident key
//! loading: {key}               keys with an in-flight load
//! ```
//!
//! Occupancy is `entries.len() + loading.len()`; when it reaches the
//! configured maximum, a miss on a new key fails with
//! [`DbError::CacheFull`]. A maximum of zero disables admission control
//! entirely (used by the record cache, whose footprint is bounded by the
//! page cache underneath it).
//!
//! ## Contract With the Backing Store
//!
//! [`Backing::load`] runs *outside* the cache mutex (a slot is reserved in
//! `loading` first, so nobody duplicates the work). [`Backing::evict`]
//! runs under the mutex at refs-zero; for pages this is where dirty
//! buffers get flushed.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use eyre::Result;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::error::DbError;

/// Where cached resources come from and where they go on eviction.
pub trait Backing {
    type Item;

    /// Materializes the resource for `key` from durable storage.
    fn load(&self, key: u64) -> Result<Self::Item>;

    /// Called at refs-zero, before the resource is dropped from the
    /// cache. Dirty state must be made durable here.
    fn evict(&self, item: &Self::Item) -> Result<()>;
}

struct CacheState<T> {
    entries: HashMap<u64, Arc<T>>,
    refs: HashMap<u64, usize>,
    loading: HashSet<u64>,
}

pub struct RefCache<B: Backing> {
    backing: B,
    state: Mutex<CacheState<B::Item>>,
    max: usize,
}

const LOADER_POLL: Duration = Duration::from_millis(1);

impl<B: Backing> RefCache<B> {
    /// `max == 0` means unbounded.
    pub fn new(backing: B, max: usize) -> Self {
        Self {
            backing,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                refs: HashMap::new(),
                loading: HashSet::new(),
            }),
            max,
        }
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Returns the resource for `key`, loading it if absent. Every
    /// successful `acquire` must be paired with exactly one [`release`].
    ///
    /// [`release`]: RefCache::release
    pub fn acquire(&self, key: u64) -> Result<Arc<B::Item>> {
        loop {
            {
                let mut state = self.state.lock();

                if state.loading.contains(&key) {
                    // Another thread is loading this key; retry shortly.
                } else if let Some(item) = state.entries.get(&key).cloned() {
                    *state.refs.entry(key).or_insert(0) += 1;
                    return Ok(item);
                } else {
                    if self.max > 0 && state.entries.len() + state.loading.len() == self.max {
                        return Err(DbError::CacheFull.into());
                    }
                    state.loading.insert(key);
                    break;
                }
            }
            thread::sleep(LOADER_POLL);
        }

        // Slot reserved; load without holding the mutex.
        let item = match self.backing.load(key) {
            Ok(item) => Arc::new(item),
            Err(e) => {
                self.state.lock().loading.remove(&key);
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        state.loading.remove(&key);
        state.entries.insert(key, item.clone());
        state.refs.insert(key, 1);
        Ok(item)
    }

    /// Drops one reference to `key`; at refs-zero the resource is evicted
    /// and removed.
    pub fn release(&self, key: u64) -> Result<()> {
        let mut state = self.state.lock();
        let Some(count) = state.refs.get_mut(&key) else {
            return Ok(());
        };
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }
        state.refs.remove(&key);
        if let Some(item) = state.entries.remove(&key) {
            self.backing.evict(&item)?;
        }
        Ok(())
    }

    /// Evicts every resident resource regardless of reference count.
    /// Only sound once no holders remain.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        for (_, item) in state.entries.drain() {
            self.backing.evict(&item)?;
        }
        state.refs.clear();
        Ok(())
    }

    #[cfg(test)]
    fn resident(&self) -> usize {
        self.state.lock().entries.len()
    }
}
