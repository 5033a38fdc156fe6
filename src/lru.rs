//! Invalidating LRU store underlying the read-through cache.
//!
//! The store hands out [`ValueHandle`]s which share ownership of the stored
//! entry. Invalidation flips a validity bit observed by every outstanding
//! handle; eviction under capacity pressure does not.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

/// A cached value at rest, shared between the store and all handles given out
/// for it.
struct StoredValue<V> {
    value: V,

    /// Wall-clock time of when the value was fetched from the backing store.
    /// This value is not precise and must only be used for diagnostics; it
    /// cannot be relied on for recency comparisons.
    updated_at: SystemTime,

    valid: AtomicBool,
}

/// Smart reference to a cached value.
///
/// A handle may outlive its entry in the store: after the entry is
/// invalidated the handle's validity flag flips to false, but the underlying
/// value remains readable for as long as the handle is held.
pub struct ValueHandle<V> {
    entry: Option<Arc<StoredValue<V>>>,
}

impl<V> ValueHandle<V> {
    /// Creates a handle directly wrapping `value`, without going through a
    /// store. The handle is always valid and carries the sentinel timestamp
    /// [`SystemTime::UNIX_EPOCH`].
    ///
    /// This constructor exists to offset the fact that the cache does not
    /// support pinning items against eviction.
    pub fn new(value: V) -> Self {
        ValueHandle {
            entry: Some(Arc::new(StoredValue {
                value,
                updated_at: SystemTime::UNIX_EPOCH,
                valid: AtomicBool::new(true),
            })),
        }
    }

    fn from_entry(entry: Arc<StoredValue<V>>) -> Self {
        ValueHandle { entry: Some(entry) }
    }

    /// Whether this handle refers to a value at all.
    pub fn is_some(&self) -> bool {
        self.entry.is_some()
    }

    /// Whether the entry is still current: false once its key has been
    /// invalidated. Empty handles are never valid.
    pub fn is_valid(&self) -> bool {
        self.entry
            .as_ref()
            .is_some_and(|entry| entry.valid.load(Ordering::Acquire))
    }

    pub fn get(&self) -> Option<&V> {
        self.entry.as_ref().map(|entry| &entry.value)
    }

    /// See [`InvalidatingLruCache::insert_or_assign_and_get`]: the wall-clock
    /// fetch time, for diagnostics only.
    pub fn updated_at(&self) -> Option<SystemTime> {
        self.entry.as_ref().map(|entry| entry.updated_at)
    }
}

impl<V> Default for ValueHandle<V> {
    fn default() -> Self {
        ValueHandle { entry: None }
    }
}

impl<V> Clone for ValueHandle<V> {
    fn clone(&self) -> Self {
        ValueHandle {
            entry: self.entry.clone(),
        }
    }
}

impl<V> Deref for ValueHandle<V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.get().expect("dereferenced an empty ValueHandle")
    }
}

impl<V: fmt::Debug> fmt::Debug for ValueHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueHandle")
            .field("value", &self.get())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Per-entry snapshot returned by [`InvalidatingLruCache::info`].
#[derive(Clone, Debug)]
pub struct CachedItemInfo<K> {
    pub key: K,

    /// Number of handles to this entry currently held outside the store.
    pub use_count: usize,

    /// See [`ValueHandle::updated_at`].
    pub updated_at: SystemTime,
}

struct Entry<V> {
    stored: Arc<StoredValue<V>>,
    epoch: u64,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,

    // Eviction order, oldest epoch first. Kept strictly in sync with `map`.
    order: BTreeMap<u64, K>,

    next_epoch: u64,
}

/// Bounded key→value map with LRU eviction and externally observable
/// invalidation.
///
/// Internally synchronized; safe to probe without any outer locking.
pub struct InvalidatingLruCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> InvalidatingLruCache<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Creates a store holding at most `capacity` entries. A capacity of zero
    /// disables storage: every insert returns a handle, but nothing is kept.
    pub fn new(capacity: usize) -> Self {
        InvalidatingLruCache {
            capacity,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: BTreeMap::new(),
                next_epoch: 0,
            }),
        }
    }

    /// Returns a handle to `key`, marking the entry most recently used.
    pub fn get(&self, key: &K) -> Option<ValueHandle<V>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let entry = inner.map.get_mut(key)?;
        let epoch = inner.next_epoch;
        inner.next_epoch += 1;

        inner.order.remove(&entry.epoch);
        inner.order.insert(epoch, key.clone());
        entry.epoch = epoch;

        Some(ValueHandle::from_entry(Arc::clone(&entry.stored)))
    }

    /// Unconditionally replaces the value stored under `key`, invalidating
    /// handles to any previous entry, and returns a fresh handle to the new
    /// value.
    pub fn insert_or_assign_and_get(
        &self,
        key: K,
        value: V,
        updated_at: SystemTime,
    ) -> ValueHandle<V> {
        let stored = Arc::new(StoredValue {
            value,
            updated_at,
            valid: AtomicBool::new(true),
        });
        let handle = ValueHandle::from_entry(Arc::clone(&stored));

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(previous) = inner.map.remove(&key) {
            previous.stored.valid.store(false, Ordering::Release);
            inner.order.remove(&previous.epoch);
        }

        if self.capacity == 0 {
            return handle;
        }

        let epoch = inner.next_epoch;
        inner.next_epoch += 1;
        inner.order.insert(epoch, key.clone());
        inner.map.insert(key, Entry { stored, epoch });

        while inner.map.len() > self.capacity {
            let (_, oldest) = inner.order.pop_first().expect("order out of sync with map");
            // Eviction is not invalidation: outstanding handles stay valid.
            let evicted = inner.map.remove(&oldest);
            debug_assert!(evicted.is_some());
        }

        handle
    }

    /// Invalidates `key`: outstanding handles flip invalid and the entry is
    /// removed from the store.
    pub fn invalidate(&self, key: &K) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(entry) = inner.map.remove(key) {
            entry.stored.valid.store(false, Ordering::Release);
            inner.order.remove(&entry.epoch);
        }
    }

    /// Invalidates every entry whose key satisfies `predicate`.
    pub fn invalidate_if(&self, mut predicate: impl FnMut(&K) -> bool) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let matching: Vec<K> = inner
            .map
            .keys()
            .filter(|&key| predicate(key))
            .cloned()
            .collect();

        for key in matching {
            if let Some(entry) = inner.map.remove(&key) {
                entry.stored.valid.store(false, Ordering::Release);
                inner.order.remove(&entry.epoch);
            }
        }
    }

    /// Read-only snapshot of all cached entries.
    pub fn info(&self) -> Vec<CachedItemInfo<K>> {
        self.inner
            .lock()
            .map
            .iter()
            .map(|(key, entry)| CachedItemInfo {
                key: key.clone(),
                use_count: Arc::strong_count(&entry.stored) - 1,
                updated_at: entry.stored.updated_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        SystemTime::now()
    }

    #[test]
    fn test_insert_and_get() {
        let cache = InvalidatingLruCache::new(4);

        let inserted = cache.insert_or_assign_and_get("a", 1, now());
        assert!(inserted.is_some());
        assert!(inserted.is_valid());
        assert_eq!(*inserted, 1);

        let fetched = cache.get(&"a").unwrap();
        assert_eq!(*fetched, 1);
        assert_eq!(fetched.updated_at(), inserted.updated_at());
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = InvalidatingLruCache::new(2);

        cache.insert_or_assign_and_get("a", 1, now());
        cache.insert_or_assign_and_get("b", 2, now());

        // Touch "a" so "b" becomes the eviction candidate.
        cache.get(&"a").unwrap();
        cache.insert_or_assign_and_get("c", 3, now());

        assert!(cache.get(&"a").is_some());
        assert!(cache.get(&"b").is_none());
        assert!(cache.get(&"c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_eviction_keeps_handles_valid() {
        let cache = InvalidatingLruCache::new(1);

        let evicted = cache.insert_or_assign_and_get("a", 1, now());
        cache.insert_or_assign_and_get("b", 2, now());

        assert!(cache.get(&"a").is_none());
        assert!(evicted.is_valid());
        assert_eq!(*evicted, 1);
    }

    #[test]
    fn test_invalidate_flips_handles() {
        let cache = InvalidatingLruCache::new(4);

        let handle = cache.insert_or_assign_and_get("a", 1, now());
        assert!(handle.is_valid());

        cache.invalidate(&"a");

        assert!(!handle.is_valid());
        assert_eq!(*handle, 1);
        assert!(cache.get(&"a").is_none());
    }

    #[test]
    fn test_assign_invalidates_replaced_entry() {
        let cache = InvalidatingLruCache::new(4);

        let old = cache.insert_or_assign_and_get("a", 1, now());
        let new = cache.insert_or_assign_and_get("a", 2, now());

        assert!(!old.is_valid());
        assert!(new.is_valid());
        assert_eq!(*cache.get(&"a").unwrap(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_if() {
        let cache = InvalidatingLruCache::new(8);

        for key in 0..6u32 {
            cache.insert_or_assign_and_get(key, key, now());
        }

        cache.invalidate_if(|key| key % 2 == 0);

        assert_eq!(cache.len(), 3);
        assert!(cache.get(&0).is_none());
        assert!(cache.get(&1).is_some());
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache = InvalidatingLruCache::new(0);

        let handle = cache.insert_or_assign_and_get("a", 1, now());
        assert!(handle.is_some());
        assert!(handle.is_valid());
        assert_eq!(*handle, 1);

        assert!(cache.get(&"a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_info_reports_use_count() {
        let cache = InvalidatingLruCache::new(4);

        let held = cache.insert_or_assign_and_get("a", 1, now());
        cache.insert_or_assign_and_get("b", 2, now());

        let mut info = cache.info();
        info.sort_by_key(|item| item.key);

        assert_eq!(info.len(), 2);
        assert_eq!(info[0].key, "a");
        assert_eq!(info[0].use_count, 1);
        assert_eq!(info[1].key, "b");
        assert_eq!(info[1].use_count, 0);

        drop(held);
        let info = cache.info();
        assert!(info.iter().all(|item| item.use_count == 0));
    }

    #[test]
    fn test_direct_value_handle() {
        let handle = ValueHandle::new("pinned");

        assert!(handle.is_some());
        assert!(handle.is_valid());
        assert_eq!(*handle, "pinned");
        assert_eq!(handle.updated_at(), Some(SystemTime::UNIX_EPOCH));
    }

    #[test]
    fn test_empty_handle() {
        let handle = ValueHandle::<u32>::default();

        assert!(!handle.is_some());
        assert!(!handle.is_valid());
        assert_eq!(handle.get(), None);
        assert_eq!(handle.updated_at(), None);
    }
}
