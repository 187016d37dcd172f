//! Cache objects and the handles returned by lookups.
//!
//! An object is shared between the cache's bookkeeping and every outstanding
//! [`CacheHandle`]. Removing a key drops the cache's reference immediately;
//! the backend's `destroy` hook runs only when the last handle is released.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::backend::Backend;

/// Fixed accounting overhead charged to every object on top of its key and
/// value sizes.
pub const OBJECT_OVERHEAD: usize = 32;

pub(crate) struct CacheObject<B: Backend> {
    key: Box<[u8]>,
    value: B::Value,
    backend: Arc<B>,
}

impl<B: Backend> CacheObject<B> {
    pub(crate) fn new(key: &[u8], value: B::Value, backend: Arc<B>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            value,
            backend,
        })
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn value(&self) -> &B::Value {
        &self.value
    }

    /// Size charged before the value has been fetched.
    pub(crate) fn base_size(&self) -> usize {
        OBJECT_OVERHEAD + self.key.len()
    }
}

impl<B: Backend> Drop for CacheObject<B> {
    fn drop(&mut self) {
        self.backend.destroy(&mut self.value);
    }
}

/// A retained reference to a cached object.
///
/// Holding a handle keeps the key and value alive even if the cache evicts or
/// removes the key in the meantime. The object's list state is not frozen by
/// the handle: a later lookup or rebalance may move it.
pub struct CacheHandle<B: Backend> {
    object: Arc<CacheObject<B>>,
}

impl<B: Backend> CacheHandle<B> {
    pub(crate) fn new(object: Arc<CacheObject<B>>) -> Self {
        Self { object }
    }

    pub fn key(&self) -> &[u8] {
        self.object.key()
    }

    pub fn value(&self) -> &B::Value {
        self.object.value()
    }

    /// Whether both handles refer to the same cache object.
    pub fn same_object(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }
}

impl<B: Backend> Deref for CacheHandle<B> {
    type Target = B::Value;

    fn deref(&self) -> &Self::Target {
        self.object.value()
    }
}

impl<B: Backend> Clone for CacheHandle<B> {
    fn clone(&self) -> Self {
        Self {
            object: Arc::clone(&self.object),
        }
    }
}

impl<B: Backend> fmt::Debug for CacheHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", &String::from_utf8_lossy(self.key()))
            .finish()
    }
}
