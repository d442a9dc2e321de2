mod families;

pub use families::{CacheKey, Caches, EntityKind, Snapshot};

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-process mirror of one entity family.
///
/// Entries are either the last committed value known to this process or
/// absent. Nothing expires; writers keep entries current. Every operation
/// works purely in memory, so none of them is a suspension point.
pub struct EntityCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for EntityCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> EntityCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    // A panic while holding the lock cannot leave a half-written HashMap
    // entry behind, so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.read().contains_key(key)
    }

    pub fn set(&self, key: K, value: V) {
        self.write().insert(key, value);
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        self.write().remove(key)
    }

    /// Point-in-time copy of every value; later writes do not affect it.
    pub fn all(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.read().values().cloned().collect()
    }

    /// Drop every entry.
    pub fn init(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Set many entries under one write lock.
    pub fn bulk_set(&self, entries: impl IntoIterator<Item = (K, V)>) {
        let mut map = self.write();
        for (k, v) in entries {
            map.insert(k, v);
        }
    }

    /// Read-modify-write under the write lock.
    ///
    /// `f` sees the current entry (if any) and returns the replacement;
    /// returning `None` leaves an absent key absent and removes a present one.
    pub fn update<F>(&self, key: K, f: F)
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let mut map = self.write();
        match f(map.get(&key)) {
            Some(v) => {
                map.insert(key, v);
            }
            None => {
                map.remove(&key);
            }
        }
    }

    /// Read-through lookup. On a miss, `loader` runs under the write lock so a
    /// fill can never land on top of a newer value set by a concurrent writer.
    /// A loader returning `None` leaves the key absent.
    pub fn get_or_load<F>(&self, key: &K, loader: F) -> Option<V>
    where
        K: Clone,
        V: Clone,
        F: FnOnce() -> Option<V>,
    {
        if let Some(v) = self.get(key) {
            return Some(v);
        }
        let mut map = self.write();
        if let Some(v) = map.get(key) {
            return Some(v.clone());
        }
        let loaded = loader()?;
        map.insert(key.clone(), loaded.clone());
        Some(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn get_set_delete() {
        let cache: EntityCache<i64, String> = EntityCache::new();
        assert_eq!(cache.get(&1), None);

        cache.set(1, "a".into());
        assert_eq!(cache.get(&1), Some("a".into()));

        cache.set(1, "b".into());
        assert_eq!(cache.get(&1), Some("b".into()));

        assert_eq!(cache.delete(&1), Some("b".into()));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.delete(&1), None);
    }

    #[test]
    fn init_empties() {
        let cache: EntityCache<String, i64> = EntityCache::new();
        cache.bulk_set([("a".to_string(), 1), ("b".to_string(), 2)]);
        assert_eq!(cache.len(), 2);
        cache.init();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn all_is_a_snapshot() {
        let cache: EntityCache<i64, i64> = EntityCache::new();
        cache.bulk_set((0..10).map(|i| (i, i * 10)));
        let snapshot = cache.all();
        cache.init();
        cache.set(100, 1);

        let mut values = snapshot;
        values.sort();
        assert_eq!(values, (0..10).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[test]
    fn update_appends_and_removes() {
        let cache: EntityCache<i64, Vec<i64>> = EntityCache::new();
        cache.update(1, |cur| {
            let mut v = cur.cloned().unwrap_or_default();
            v.push(10);
            Some(v)
        });
        cache.update(1, |cur| {
            let mut v = cur.cloned().unwrap_or_default();
            v.push(11);
            Some(v)
        });
        assert_eq!(cache.get(&1), Some(vec![10, 11]));

        cache.update(1, |_| None);
        assert!(!cache.contains(&1));
    }

    #[test]
    fn get_or_load_fills_once() {
        let cache: EntityCache<i64, &'static str> = EntityCache::new();
        assert_eq!(cache.get_or_load(&1, || Some("loaded")), Some("loaded"));
        // Second call hits; the loader must not run.
        assert_eq!(cache.get_or_load(&1, || panic!("loader ran on a hit")), Some("loaded"));
    }

    #[test]
    fn get_or_load_miss_stays_absent() {
        let cache: EntityCache<i64, i64> = EntityCache::new();
        assert_eq!(cache.get_or_load(&1, || None), None);
        assert!(!cache.contains(&1));
    }

    #[test]
    fn concurrent_updates_lose_nothing() {
        let cache: Arc<EntityCache<i64, Vec<i64>>> = Arc::new(EntityCache::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.update(0, |cur| {
                            let mut v = cur.cloned().unwrap_or_default();
                            v.push(t * 1000 + i);
                            Some(v)
                        });
                        let _ = cache.all();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.get(&0).map(|v| v.len()), Some(800));
    }
}
