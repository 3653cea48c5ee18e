//! A [SoftCache] holds decoded values that may be reclaimed at any time
//! under memory pressure, and routes every reclamation through a single
//! cleanup point so the owning resource can release its reader.
//!
//! Each `put` registers a fresh [RefId], the identity of that particular
//! installation of the value.  A reverse index maps reference identities
//! back to keys, so the eviction routine (which knows only which reference
//! died, not whose it was) can locate and clean up the owning entry.  The
//! listener attached to an entry is held weakly: the cache records a
//! relation to the owner, never ownership of it.
//!
//! Eviction is explicit and synchronous.  When the total estimated cost of
//! resident values exceeds the configured budget, oldest entries are
//! reclaimed first; [SoftCache::release_and_compact] reclaims everything at
//! once and is what the out-of-memory retry policy calls before trying a
//! failed decode again.
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use crate::traits::EstimateCost;

type CacheHashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Identity of one installed cache reference.
///
/// Replacing a key's value issues a new `RefId`; a stale id can no longer
/// evict the entry it once referred to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefId(u64);

/// Notified when a value leaves the cache through the eviction path.
///
/// This is where cache reclamation couples to resource cleanup: the owning
/// resource clears its cached flag and closes its reader here.  Failure to
/// route removals through this callback leaks open streams.
pub trait EvictionListener: Send + Sync {
    fn evicted(&self);
}

#[derive(Debug, Clone, derive_builder::Builder)]
pub struct SoftCacheConfig {
    /// Total estimated bytes of resident values before the oldest entries
    /// are reclaimed.
    pub max_cached_bytes: u64,
}

struct CacheSlot<V> {
    value: Arc<V>,
    ref_id: RefId,
    bytes: u64,
    listener: Weak<dyn EvictionListener>,
}

struct CacheInner<K, V> {
    forward: CacheHashMap<K, CacheSlot<V>>,
    reverse: CacheHashMap<RefId, K>,
    /// Reference identities in installation order.  May contain stale ids
    /// whose entry was since replaced; those are skipped during eviction.
    age: VecDeque<RefId>,
    total_bytes: u64,
    next_ref: u64,
}

impl<K: Copy + Eq + Hash, V> CacheInner<K, V> {
    /// Remove the entry behind `ref_id` from both indexes, returning the
    /// listener to notify.
    ///
    /// A `put` may have raced us and installed a newer value for the same
    /// key; the forward index is only touched if it still carries this
    /// exact reference, so a stale id can never evict its successor.
    fn remove_ref(&mut self, ref_id: RefId) -> Option<Weak<dyn EvictionListener>> {
        let key = self.reverse.remove(&ref_id)?;
        let is_current = matches!(self.forward.get(&key), Some(slot) if slot.ref_id == ref_id);
        if !is_current {
            return None;
        }
        let slot = self.forward.remove(&key).expect("Entry was just checked");
        self.total_bytes -= slot.bytes;
        Some(slot.listener)
    }
}

pub struct SoftCache<K: Copy + Eq + Hash, V: EstimateCost> {
    config: SoftCacheConfig,
    inner: Mutex<CacheInner<K, V>>,
}

impl<K: Copy + Eq + Hash, V: EstimateCost> SoftCache<K, V> {
    pub fn new(config: SoftCacheConfig) -> SoftCache<K, V> {
        SoftCache {
            config,
            inner: Mutex::new(CacheInner {
                forward: Default::default(),
                reverse: Default::default(),
                age: Default::default(),
                total_bytes: 0,
                next_ref: 0,
            }),
        }
    }

    /// Return the resident value for `key`, or `None` if it has been
    /// reclaimed (or was never installed).
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let inner = self.inner.lock().unwrap();
        inner.forward.get(key).map(|slot| slot.value.clone())
    }

    /// Install a value for `key`, replacing any existing mapping.
    ///
    /// Replacement is silent: the old entry leaves both indexes without a
    /// listener callback, since the owning resource is still cached, just
    /// through a newer reference.  Installing may push the total cost over
    /// budget, in which case oldest entries (possibly including this one)
    /// are reclaimed before returning.
    pub fn put(&self, key: K, value: Arc<V>, listener: Weak<dyn EvictionListener>) -> RefId {
        let bytes = value.estimate_cost() as u64;
        let mut reclaimed = Vec::new();
        let ref_id;
        {
            let mut inner = self.inner.lock().unwrap();
            ref_id = RefId(inner.next_ref);
            inner.next_ref += 1;
            if let Some(old) = inner.forward.remove(&key) {
                inner.reverse.remove(&old.ref_id);
                inner.total_bytes -= old.bytes;
            }
            inner.forward.insert(
                key,
                CacheSlot {
                    value,
                    ref_id,
                    bytes,
                    listener,
                },
            );
            inner.reverse.insert(ref_id, key);
            inner.age.push_back(ref_id);
            inner.total_bytes += bytes;

            while inner.total_bytes > self.config.max_cached_bytes {
                let oldest = match inner.age.pop_front() {
                    Some(r) => r,
                    None => break,
                };
                if let Some(l) = inner.remove_ref(oldest) {
                    reclaimed.push(l);
                }
            }
        }
        // Listeners run outside the index lock; they close readers, which
        // must never happen while holding cache internals.
        notify(reclaimed);
        ref_id
    }

    /// Reclaim the entry behind a dead or dying reference.
    ///
    /// Resolves the owning key through the reverse index, removes both
    /// index entries, and notifies the listener.  Returns `false` when the
    /// reference was stale (already reclaimed, or replaced by a newer
    /// value for the same key).
    pub fn remove_element(&self, ref_id: RefId) -> bool {
        let listener = self.inner.lock().unwrap().remove_ref(ref_id);
        match listener {
            Some(weak) => {
                notify(vec![weak]);
                true
            }
            None => false,
        }
    }

    /// Reclaim the current entry for `key`, routing through the same
    /// cleanup path as pressure eviction.
    pub fn remove_key(&self, key: &K) -> bool {
        let ref_id = {
            let inner = self.inner.lock().unwrap();
            inner.forward.get(key).map(|slot| slot.ref_id)
        };
        match ref_id {
            Some(r) => self.remove_element(r),
            None => false,
        }
    }

    /// Reclaim every resident entry.
    ///
    /// The out-of-memory retry policy calls this before re-attempting a
    /// failed decode, so that reclaimed entries' readers are closed and
    /// their buffers freed before further allocation.
    pub fn release_and_compact(&self) {
        let mut reclaimed = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            while let Some(ref_id) = inner.age.pop_front() {
                if let Some(l) = inner.remove_ref(ref_id) {
                    reclaimed.push(l);
                }
            }
        }
        notify(reclaimed);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total estimated bytes of resident values.
    pub fn cached_bytes(&self) -> u64 {
        self.inner.lock().unwrap().total_bytes
    }
}

fn notify(listeners: Vec<Weak<dyn EvictionListener>>) {
    for weak in listeners {
        if let Some(listener) = weak.upgrade() {
            listener.evicted();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;

    struct TestValue(usize);

    impl EstimateCost for TestValue {
        fn estimate_cost(&self) -> usize {
            self.0
        }
    }

    #[derive(Default)]
    struct CountingListener(AtomicUsize);

    impl EvictionListener for CountingListener {
        fn evicted(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingListener {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn build_cache(max: u64) -> SoftCache<u64, TestValue> {
        let config = SoftCacheConfigBuilder::default()
            .max_cached_bytes(max)
            .build()
            .expect("Should build");
        SoftCache::new(config)
    }

    fn listener() -> (Arc<CountingListener>, Weak<dyn EvictionListener>) {
        let strong = Arc::new(CountingListener::default());
        let weak = Arc::downgrade(&strong) as Weak<dyn EvictionListener>;
        (strong, weak)
    }

    #[test]
    fn put_get_remove() {
        let cache = build_cache(1000);
        let (l, weak) = listener();
        cache.put(1, Arc::new(TestValue(10)), weak);
        assert_eq!(cache.get(&1).unwrap().0, 10);
        assert_eq!(cache.cached_bytes(), 10);

        assert!(cache.remove_key(&1));
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.cached_bytes(), 0);
        assert_eq!(l.count(), 1);

        // Already gone.
        assert!(!cache.remove_key(&1));
        assert_eq!(l.count(), 1);
    }

    #[test]
    fn replace_is_silent_and_stale_ref_cannot_evict() {
        let cache = build_cache(1000);
        let (l, weak) = listener();
        let old_ref = cache.put(1, Arc::new(TestValue(10)), weak.clone());
        cache.put(1, Arc::new(TestValue(20)), weak);

        assert_eq!(l.count(), 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.cached_bytes(), 20);

        // The old reference must not evict the newer value.
        assert!(!cache.remove_element(old_ref));
        assert_eq!(cache.get(&1).unwrap().0, 20);
        assert_eq!(l.count(), 0);
    }

    #[test]
    fn pressure_evicts_oldest_first() {
        let cache = build_cache(100);
        let (la, wa) = listener();
        let (lb, wb) = listener();
        let (lc, wc) = listener();
        cache.put(1, Arc::new(TestValue(60)), wa);
        cache.put(2, Arc::new(TestValue(30)), wb);
        cache.put(3, Arc::new(TestValue(60)), wc);

        assert!(cache.get(&1).is_none());
        assert!(cache.get(&2).is_some());
        assert!(cache.get(&3).is_some());
        assert_eq!(la.count(), 1);
        assert_eq!(lb.count(), 0);
        assert_eq!(lc.count(), 0);
        assert_eq!(cache.cached_bytes(), 90);
    }

    #[test]
    fn remove_element_fires_exactly_once() {
        let cache = build_cache(1000);
        let (l, weak) = listener();
        let r = cache.put(1, Arc::new(TestValue(10)), weak);
        assert!(cache.remove_element(r));
        assert!(!cache.remove_element(r));
        assert_eq!(l.count(), 1);
    }

    #[test]
    fn release_and_compact_drains_everything() {
        let cache = build_cache(1000);
        let mut listeners = Vec::new();
        for k in 0..5u64 {
            let (l, weak) = listener();
            cache.put(k, Arc::new(TestValue(10)), weak);
            listeners.push(l);
        }

        cache.release_and_compact();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.cached_bytes(), 0);
        for l in &listeners {
            assert_eq!(l.count(), 1);
        }

        // A second compaction has nothing left to notify.
        cache.release_and_compact();
        for l in &listeners {
            assert_eq!(l.count(), 1);
        }
    }

    /// A straight-line model of the cache's residency policy: entries in
    /// installation order, replace-on-put, oldest-first eviction over
    /// budget.
    struct Model {
        entries: Vec<(u64, u64)>,
        max: u64,
    }

    impl Model {
        fn total(&self) -> u64 {
            self.entries.iter().map(|e| e.1).sum()
        }

        fn put(&mut self, key: u64, bytes: u64) {
            self.entries.retain(|e| e.0 != key);
            self.entries.push((key, bytes));
            while self.total() > self.max {
                self.entries.remove(0);
            }
        }

        fn remove(&mut self, key: u64) {
            self.entries.retain(|e| e.0 != key);
        }

        fn contains(&self, key: u64) -> bool {
            self.entries.iter().any(|e| e.0 == key)
        }
    }

    #[derive(Copy, Clone, Debug)]
    enum CacheCommand {
        Put(u64, u64),
        Get(u64),
        RemoveKey(u64),
        Compact,
    }

    fn cache_command_strat() -> prop::strategy::BoxedStrategy<CacheCommand> {
        proptest::prop_oneof![
            (0..8u64, 1..50u64).prop_map(|(k, b)| CacheCommand::Put(k, b)),
            (0..8u64).prop_map(CacheCommand::Get),
            (0..8u64).prop_map(CacheCommand::RemoveKey),
            Just(CacheCommand::Compact),
        ]
        .boxed()
    }

    proptest! {
        #[test]
        fn matches_residency_model(
            max in 1..200u64,
            commands in prop::collection::vec(cache_command_strat(), 0..200)
        ) {
            let cache = build_cache(max);
            let mut model = Model { entries: vec![], max };
            // Keep listeners alive so eviction callbacks stay observable.
            let mut keep = Vec::new();

            for c in commands {
                match c {
                    CacheCommand::Put(k, b) => {
                        let (l, weak) = listener();
                        keep.push(l);
                        cache.put(k, Arc::new(TestValue(b as usize)), weak);
                        model.put(k, b);
                    }
                    CacheCommand::Get(k) => {
                        prop_assert_eq!(cache.get(&k).is_some(), model.contains(k));
                    }
                    CacheCommand::RemoveKey(k) => {
                        prop_assert_eq!(cache.remove_key(&k), model.contains(k));
                        model.remove(k);
                    }
                    CacheCommand::Compact => {
                        cache.release_and_compact();
                        model.entries.clear();
                    }
                }

                prop_assert_eq!(cache.cached_bytes(), model.total());
                prop_assert_eq!(cache.len(), model.entries.len());
            }
        }
    }
}
