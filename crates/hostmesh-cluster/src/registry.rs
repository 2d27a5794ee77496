//! Copy-on-write registries
//!
//! Readers take an immutable snapshot and never observe a half-updated map.
//! Writers rebuild the map and publish it with a single pointer swap.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

pub struct CowMap<K, V> {
    current: RwLock<Arc<HashMap<K, V>>>,
    writer: Mutex<()>,
}

impl<K, V> CowMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(HashMap::new())),
            writer: Mutex::new(()),
        }
    }

    /// The current immutable map
    pub fn snapshot(&self) -> Arc<HashMap<K, V>> {
        Arc::clone(&self.current.read())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.snapshot().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.snapshot().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Apply `f` to a copy of the map and publish the copy
    pub fn update<R>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        let _writer = self.writer.lock();
        let mut next = HashMap::clone(&self.snapshot());
        let result = f(&mut next);
        *self.current.write() = Arc::new(next);
        result
    }
}

impl<K, V> Default for CowMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_stable() {
        let map: CowMap<i32, &str> = CowMap::new();
        map.update(|m| m.insert(1, "a"));

        let before = map.snapshot();
        map.update(|m| {
            m.insert(2, "b");
            m.remove(&1);
        });

        assert_eq!(before.len(), 1);
        assert_eq!(before.get(&1), Some(&"a"));
        assert_eq!(map.get(&2), Some("b"));
        assert!(!map.contains_key(&1));
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_updates() {
        let map: Arc<CowMap<i32, i32>> = Arc::new(CowMap::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        map.update(|m| m.insert(t * 1000 + i, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 800);
    }
}
