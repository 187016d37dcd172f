//! Integration tests for the ARC cache engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use peer_cache::cache::{ArcCache, Backend, ListKind, OBJECT_OVERHEAD};
use peer_cache::config::CacheConfig;

/// Value slot whose data is loaded on fetch and dropped on evict.
struct Slot {
    key: Vec<u8>,
    data: Mutex<Option<Vec<u8>>>,
}

#[derive(Default)]
struct MemoryBackend {
    store: HashMap<Vec<u8>, Vec<u8>>,
    delay: Duration,
    creates: AtomicUsize,
    fetches: AtomicUsize,
    evictions: AtomicUsize,
    destroyed: AtomicUsize,
}

impl MemoryBackend {
    fn with_values(values: &[(&[u8], usize)]) -> Self {
        Self {
            store: values
                .iter()
                .map(|(key, len)| (key.to_vec(), vec![key[0]; *len]))
                .collect(),
            ..Default::default()
        }
    }
}

impl Backend for MemoryBackend {
    type Value = Slot;

    fn create(&self, key: &[u8]) -> Slot {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Slot {
            key: key.to_vec(),
            data: Mutex::new(None),
        }
    }

    fn fetch(&self, value: &Slot) -> usize {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        match self.store.get(&value.key) {
            Some(data) => {
                *value.data.lock() = Some(data.clone());
                data.len()
            }
            None => 0,
        }
    }

    fn evict(&self, value: &Slot) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
        *value.data.lock() = None;
    }

    fn destroy(&self, _value: &mut Slot) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Value length giving an object of `total` accounted bytes.
fn value_len(key: &[u8], total: usize) -> usize {
    total - OBJECT_OVERHEAD - key.len()
}

#[test]
fn test_lookup_returns_fetched_value() {
    let backend = MemoryBackend::with_values(&[(b"alpha", 5)]);
    let cache = ArcCache::from_config(backend, &CacheConfig { capacity: 1024 });

    let handle = cache.lookup(b"alpha").unwrap();
    assert_eq!(handle.key(), b"alpha");
    assert_eq!(handle.data.lock().as_deref(), Some(&b"aaaaa"[..]));
    assert_eq!(cache.size(), OBJECT_OVERHEAD + 5 + 5);
}

#[test]
fn test_missing_value_is_a_miss() {
    let cache = ArcCache::new(MemoryBackend::default(), 1024);
    assert!(cache.lookup(b"nothing").is_none());
    assert_eq!(cache.state_of(b"nothing"), None);
    assert_eq!(cache.size(), 0);
    // the object created for the miss is released immediately
    assert_eq!(cache.backend().destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_repeated_hits_stay_resident() {
    let backend = MemoryBackend::with_values(&[(b"hot", 10), (b"x", 10)]);
    let cache = ArcCache::new(backend, 200);

    for _ in 0..20 {
        cache.lookup(b"hot").unwrap();
        cache.lookup(b"x").unwrap();
        let state = cache.state_of(b"hot").unwrap();
        assert!(!state.is_ghost());
    }
    assert_eq!(cache.state_of(b"hot"), Some(ListKind::Mfu));
    assert_eq!(cache.backend().fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn test_capacity_pressure_evicts_lru() {
    let a = value_len(b"A", 60);
    let b = value_len(b"B", 60);
    let backend = MemoryBackend::with_values(&[(b"A", a), (b"B", b)]);
    let cache = ArcCache::new(backend, 100);

    let handle_a = cache.lookup(b"A").unwrap();
    cache.lookup(b"B").unwrap();

    assert_eq!(cache.state_of(b"A"), Some(ListKind::GhostMru));
    assert_eq!(cache.state_of(b"B"), Some(ListKind::Mru));
    assert_eq!(cache.backend().evictions.load(Ordering::SeqCst), 1);
    assert!(handle_a.data.lock().is_none());

    let stats = cache.stats();
    assert_eq!(stats.mru, 60);
    assert_eq!(stats.ghost_mru, 60);
}

#[test]
fn test_ghost_history_is_bounded() {
    let keys: Vec<Vec<u8>> = (0..50u8).map(|i| vec![b'g', i]).collect();
    let values: Vec<(&[u8], usize)> = keys
        .iter()
        .map(|k| (k.as_slice(), value_len(k, 40)))
        .collect();
    let cache = ArcCache::new(MemoryBackend::with_values(&values), 100);

    for key in &keys {
        cache.lookup(key).unwrap();
        let stats = cache.stats();
        assert!(stats.ghost() <= stats.capacity);
        assert!(stats.resident() <= stats.capacity);
    }
    // older ghosts have been forgotten entirely
    assert_eq!(cache.state_of(&keys[0]), None);
    assert!(cache.backend().destroyed.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_concurrent_lookups_fetch_once() {
    let mut backend = MemoryBackend::with_values(&[(b"shared", 100)]);
    backend.delay = Duration::from_millis(50);
    let cache = Arc::new(ArcCache::new(backend, 10_000));
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.lookup(b"shared")
            })
        })
        .collect();

    let handles: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().unwrap().unwrap())
        .collect();

    assert_eq!(cache.backend().creates.load(Ordering::SeqCst), 1);
    assert_eq!(cache.backend().fetches.load(Ordering::SeqCst), 1);
    assert!(handles.iter().all(|h| h.same_object(&handles[0])));
}

#[test]
fn test_parallel_workers_keep_accounting() {
    let keys: Vec<Vec<u8>> = (0..64u8).map(|i| vec![b'w', i]).collect();
    let values: Vec<(&[u8], usize)> = keys
        .iter()
        .map(|k| (k.as_slice(), 16 + (k[1] as usize % 7) * 8))
        .collect();
    let cache = Arc::new(ArcCache::new(MemoryBackend::with_values(&values), 1_000));
    let keys = Arc::new(keys);

    let workers: Vec<_> = (0..4usize)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let keys = Arc::clone(&keys);
            thread::spawn(move || {
                for i in 0..500usize {
                    let key = &keys[(i * (t + 3) + t) % keys.len()];
                    if i % 17 == 0 {
                        cache.remove(key);
                        continue;
                    }
                    if let Some(handle) = cache.lookup(key) {
                        assert_eq!(handle.key(), key.as_slice());
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = cache.stats();
    assert!(stats.p <= stats.capacity);
    assert!(stats.ghost() <= stats.capacity);

    cache.clear();
    assert_eq!(cache.size(), 0);
    drop(cache);
}

/// Spin until the backend has started `count` fetches.
fn wait_for_fetches(cache: &ArcCache<MemoryBackend>, count: usize) {
    while cache.backend().fetches.load(Ordering::SeqCst) < count {
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_remove_during_fetch_reports_miss() {
    let mut backend = MemoryBackend::with_values(&[(b"slow", 10), (b"other", 10)]);
    backend.delay = Duration::from_millis(100);
    let cache = Arc::new(ArcCache::new(backend, 10_000));

    let slow = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.lookup(b"slow").is_some())
    };
    wait_for_fetches(&cache, 1);

    // frees the slot while its fetch is outstanding; "other" may reuse it
    cache.remove(b"slow");
    assert!(cache.lookup(b"other").is_some());

    assert!(!slow.join().unwrap());
    assert_eq!(cache.state_of(b"slow"), None);
    assert_eq!(cache.state_of(b"other"), Some(ListKind::Mru));
    assert_eq!(cache.stats().entries, 1);
    assert_eq!(cache.size(), OBJECT_OVERHEAD + 5 + 10);
}

#[test]
fn test_clear_during_fetch_reports_miss() {
    let mut backend = MemoryBackend::with_values(&[(b"slow", 10)]);
    backend.delay = Duration::from_millis(50);
    let cache = Arc::new(ArcCache::new(backend, 10_000));

    let slow = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.lookup(b"slow").is_some())
    };
    wait_for_fetches(&cache, 1);
    cache.clear();

    assert!(!slow.join().unwrap());
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.stats().entries, 0);

    // the cache stays usable and fetches the key afresh
    assert!(cache.lookup(b"slow").is_some());
    assert_eq!(cache.state_of(b"slow"), Some(ListKind::Mru));
}
