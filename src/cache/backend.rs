//! Backend hooks invoked by the ARC engine.

/// Storage backend that owns cached values.
///
/// The engine never inspects values. It asks the backend to create a value on
/// a miss, to fetch (load) it when the key is admitted into a real list, to
/// evict (unload) it when the key becomes a ghost, and to destroy it once the
/// last handle to the object is released.
pub trait Backend: Send + Sync + 'static {
    /// Backend-owned value associated with one key.
    type Value: Send + Sync;

    /// Create the (not yet loaded) value for `key`.
    ///
    /// Called with the structural lock held; must not block.
    fn create(&self, key: &[u8]) -> Self::Value;

    /// Load the value's data and return its size in bytes.
    ///
    /// Called without the structural lock and may block, but must not look up
    /// the key being fetched. Returning `0` signals failure; the engine then
    /// restores the object's previous state and reports a miss.
    fn fetch(&self, value: &Self::Value) -> usize;

    /// Drop the loaded data; the key is being demoted to a ghost list.
    ///
    /// Called with the structural lock held; must not block.
    fn evict(&self, value: &Self::Value);

    /// Final teardown, run exactly once when the object is deallocated.
    ///
    /// May run while the structural lock is held; must not call back into
    /// the cache.
    fn destroy(&self, _value: &mut Self::Value) {}
}
