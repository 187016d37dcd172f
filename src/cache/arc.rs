//! Adaptive Replacement Cache engine.
//!
//! Objects are accounted by size (overhead + key + fetched value) in four
//! lists: MRU and MFU hold resident objects, ghost-MRU and ghost-MFU remember
//! recently demoted keys without their data. The split target `p` moves
//! towards recency on ghost-MRU hits and towards frequency on ghost-MFU hits.
//!
//! ```text
//!   lookup(key)
//!     ├─ MRU / MFU hit ───────────────► MFU head
//!     ├─ ghost-MRU hit: p += δ ───────► fetch ─► MFU head
//!     ├─ ghost-MFU hit: p -= δ ───────► fetch ─► MFU head
//!     └─ miss: create ────────────────► fetch ─► MRU head
//!
//!   balance(needed)
//!     while mru + mfu + needed > c:   demote MRU LRU if mru > p, else MFU LRU
//!     while ghosts > c:               drop ghost-MFU LRU if ghost_mfu > p, else ghost-MRU LRU
//! ```
//!
//! A single structural lock guards the lists and the key index. It is released
//! while the backend fetches, and the fetching entry is marked in flight so
//! concurrent lookups of the same key wait for the outcome instead of issuing
//! a second fetch.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::backend::Backend;
use crate::cache::list::{ListKind, SlotId, StateLists};
use crate::cache::object::{CacheHandle, CacheObject, OBJECT_OVERHEAD};
use crate::config::CacheConfig;

/// Why an admission into MRU/MFU did not complete.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
enum AdmitError {
    #[error("backend fetch failed")]
    FetchFailed,

    #[error("object was removed while its fetch was in flight")]
    Removed,
}

struct Entry<B: Backend> {
    object: Arc<CacheObject<B>>,
    fetching: bool,
}

struct Inner<B: Backend> {
    lists: StateLists<Entry<B>>,
    index: FxHashMap<Box<[u8]>, SlotId>,
    capacity: usize,
    p: usize,
}

/// Point-in-time view of the engine's accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArcStats {
    /// Capacity `c` in bytes.
    pub capacity: usize,
    /// Adaptive MRU target `p`.
    pub p: usize,
    pub mru: usize,
    pub mfu: usize,
    pub ghost_mru: usize,
    pub ghost_mfu: usize,
    /// Keys currently known to the index (resident, ghost or in flight).
    pub entries: usize,
}

impl ArcStats {
    /// Bytes held by resident objects.
    pub fn resident(&self) -> usize {
        self.mru + self.mfu
    }

    /// Bytes remembered by the ghost lists.
    pub fn ghost(&self) -> usize {
        self.ghost_mru + self.ghost_mfu
    }
}

/// Size-bounded ARC cache shared by any number of worker threads.
pub struct ArcCache<B: Backend> {
    backend: Arc<B>,
    inner: Mutex<Inner<B>>,
    fetch_done: Condvar,
}

impl<B: Backend> ArcCache<B> {
    /// Create a cache holding at most `capacity` bytes of resident objects.
    pub fn new(backend: B, capacity: usize) -> Self {
        Self {
            backend: Arc::new(backend),
            inner: Mutex::new(Inner {
                lists: StateLists::new(),
                index: FxHashMap::default(),
                capacity,
                p: capacity >> 1,
            }),
            fetch_done: Condvar::new(),
        }
    }

    pub fn from_config(backend: B, config: &CacheConfig) -> Self {
        Self::new(backend, config.capacity)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Look up `key`, creating and fetching it on a miss.
    ///
    /// Returns `None` when the backend fails to fetch the value; the object's
    /// previous list state is restored and the caller may retry.
    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle<B>> {
        let mut inner = self.inner.lock();

        while let Some(&slot) = inner.index.get(key) {
            let Some(entry) = inner.lists.get(slot) else {
                break;
            };
            if entry.fetching {
                self.fetch_done.wait(&mut inner);
                continue;
            }

            let object = Arc::clone(&entry.object);
            let admitted = match inner.lists.list_of(slot) {
                Some(ListKind::Mru) | Some(ListKind::Mfu) => {
                    inner.lists.unlink(slot);
                    inner.lists.push_front(slot, ListKind::Mfu);
                    trace!(key = %KeyDisplay(key), "promoted to MFU");
                    Ok(())
                }
                Some(ListKind::GhostMru) => {
                    inner.adapt_towards_recency();
                    self.admit(&mut inner, slot, &object, ListKind::Mfu)
                }
                Some(ListKind::GhostMfu) => {
                    inner.adapt_towards_frequency();
                    self.admit(&mut inner, slot, &object, ListKind::Mfu)
                }
                None => {
                    let result = self.admit(&mut inner, slot, &object, ListKind::Mru);
                    if result == Err(AdmitError::FetchFailed) {
                        inner.destroy(slot);
                    }
                    result
                }
            };
            return admitted.ok().map(|()| CacheHandle::new(object));
        }

        // True miss. The lock has been held since the index check, so no
        // other thread can have created this key in between.
        let value = self.backend.create(key);
        let object = CacheObject::new(key, value, Arc::clone(&self.backend));
        let slot = inner.lists.insert(
            Entry {
                object: Arc::clone(&object),
                fetching: false,
            },
            object.base_size(),
        );
        inner.index.insert(key.into(), slot);
        trace!(key = %KeyDisplay(key), "created");

        match self.admit(&mut inner, slot, &object, ListKind::Mru) {
            Ok(()) => Some(CacheHandle::new(object)),
            Err(AdmitError::FetchFailed) => {
                inner.destroy(slot);
                None
            }
            Err(AdmitError::Removed) => None,
        }
    }

    /// Forget `key`. Outstanding handles stay valid until released.
    pub fn remove(&self, key: &[u8]) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.index.remove(key) else {
            return;
        };
        let entry = inner.lists.remove(slot);
        if entry.as_ref().is_some_and(|e| e.fetching) {
            self.fetch_done.notify_all();
        }
        drop(inner);
        trace!(key = %KeyDisplay(key), "removed");
        drop(entry);
    }

    /// Bytes held by resident (MRU + MFU) objects.
    pub fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.lists.size(ListKind::Mru) + inner.lists.size(ListKind::Mfu)
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Which list `key` currently sits in, if any.
    pub fn state_of(&self, key: &[u8]) -> Option<ListKind> {
        let inner = self.inner.lock();
        let slot = *inner.index.get(key)?;
        inner.lists.list_of(slot)
    }

    pub fn stats(&self) -> ArcStats {
        let inner = self.inner.lock();
        ArcStats {
            capacity: inner.capacity,
            p: inner.p,
            mru: inner.lists.size(ListKind::Mru),
            mfu: inner.lists.size(ListKind::Mfu),
            ghost_mru: inner.lists.size(ListKind::GhostMru),
            ghost_mfu: inner.lists.size(ListKind::GhostMfu),
            entries: inner.index.len(),
        }
    }

    /// Release every object the cache references. The cache stays usable.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let lists = std::mem::take(&mut inner.lists);
        inner.index.clear();
        inner.p = inner.capacity >> 1;
        self.fetch_done.notify_all();
        drop(inner);
        drop(lists);
    }

    /// Move an unlinked or ghost object into `target` (MRU or MFU), fetching
    /// its data from the backend with the structural lock released.
    fn admit(
        &self,
        inner: &mut MutexGuard<'_, Inner<B>>,
        slot: SlotId,
        object: &Arc<CacheObject<B>>,
        target: ListKind,
    ) -> Result<(), AdmitError> {
        let prior = inner.lists.unlink(slot);
        let needed = inner.lists.size_of(slot);
        inner.balance(needed, &self.backend);
        inner.set_fetching(slot, true);

        let fetched = MutexGuard::unlocked(inner, || self.backend.fetch(object.value()));

        if !inner.holds(slot, object) {
            self.fetch_done.notify_all();
            debug!(key = %KeyDisplay(object.key()), "removed during fetch");
            return Err(AdmitError::Removed);
        }
        inner.set_fetching(slot, false);
        self.fetch_done.notify_all();

        if fetched == 0 {
            if let Some(kind) = prior {
                inner.lists.push_front(slot, kind);
            }
            debug!(key = %KeyDisplay(object.key()), prior = ?prior, "backend fetch failed");
            return Err(AdmitError::FetchFailed);
        }

        let size = OBJECT_OVERHEAD + object.key().len() + fetched;
        inner.lists.set_size(slot, size);
        inner.balance(size, &self.backend);
        inner.lists.push_front(slot, target);
        trace!(key = %KeyDisplay(object.key()), size, to = %target, "admitted");
        Ok(())
    }
}

impl<B: Backend> Inner<B> {
    /// Evict from the resident lists until `needed` more bytes fit, then trim
    /// the ghost lists back to the capacity.
    fn balance(&mut self, needed: usize, backend: &B) {
        while self.lists.size(ListKind::Mru) + self.lists.size(ListKind::Mfu) + needed
            > self.capacity
        {
            if self.lists.size(ListKind::Mru) > self.p {
                let Some(victim) = self.lists.lru(ListKind::Mru) else {
                    break;
                };
                self.demote(victim, ListKind::GhostMru, backend);
            } else if self.lists.size(ListKind::Mfu) > 0 {
                let Some(victim) = self.lists.lru(ListKind::Mfu) else {
                    break;
                };
                self.demote(victim, ListKind::GhostMfu, backend);
            } else {
                break;
            }
        }

        while self.lists.size(ListKind::GhostMru) + self.lists.size(ListKind::GhostMfu)
            > self.capacity
        {
            let victim = if self.lists.size(ListKind::GhostMfu) > self.p {
                self.lists.lru(ListKind::GhostMfu)
            } else if self.lists.size(ListKind::GhostMru) > 0 {
                self.lists.lru(ListKind::GhostMru)
            } else {
                None
            };
            match victim {
                Some(slot) => self.destroy(slot),
                None => break,
            }
        }
    }

    fn demote(&mut self, slot: SlotId, ghost: ListKind, backend: &B) {
        self.lists.unlink(slot);
        if let Some(entry) = self.lists.get(slot) {
            backend.evict(entry.object.value());
            debug!(key = %KeyDisplay(entry.object.key()), to = %ghost, "evicted");
        }
        self.lists.push_front(slot, ghost);
    }

    /// Move to "no state": forget the key and drop the cache's reference.
    fn destroy(&mut self, slot: SlotId) {
        if let Some(entry) = self.lists.remove(slot) {
            self.index.remove(entry.object.key());
            debug!(key = %KeyDisplay(entry.object.key()), "destroyed");
        }
    }

    fn adapt_towards_recency(&mut self) {
        let ghost_mru = self.lists.size(ListKind::GhostMru);
        let ghost_mfu = self.lists.size(ListKind::GhostMfu);
        let delta = ghost_mfu.checked_div(ghost_mru).unwrap_or(0).max(1);
        self.p = self.p.saturating_add(delta).min(self.capacity);
    }

    fn adapt_towards_frequency(&mut self) {
        let ghost_mru = self.lists.size(ListKind::GhostMru);
        let ghost_mfu = self.lists.size(ListKind::GhostMfu);
        let delta = ghost_mru.checked_div(ghost_mfu).unwrap_or(0).max(1);
        self.p = self.p.saturating_sub(delta);
    }

    fn set_fetching(&mut self, slot: SlotId, fetching: bool) {
        if let Some(entry) = self.lists.get_mut(slot) {
            entry.fetching = fetching;
        }
    }

    /// Whether `slot` still holds `object` (it may have been removed and the
    /// slot reused while the lock was released).
    fn holds(&self, slot: SlotId, object: &Arc<CacheObject<B>>) -> bool {
        self.lists
            .get(slot)
            .is_some_and(|entry| Arc::ptr_eq(&entry.object, object))
    }
}

/// Lossy, bounded rendering of a key for log fields.
struct KeyDisplay<'a>(&'a [u8]);

impl std::fmt::Display for KeyDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = &self.0[..self.0.len().min(64)];
        write!(f, "{}", String::from_utf8_lossy(shown))?;
        if self.0.len() > shown.len() {
            write!(f, "...")?;
        }
        Ok(())
    }
}
