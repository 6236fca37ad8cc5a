//! Volatile key-value engine.
//!
//! A RAM hash table with no durability at all. Used for scratch storages
//! (e.g. hash verification of snapshot files) and in tests.

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::StoreResult;
use crate::kvstore::KvStore;

/// Hash-map backed store. Contents are lost when dropped.
#[derive(Default)]
pub struct MemoryKvStore {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of key-value pairs held.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Sorted copy of all pairs under `prefix`.
    ///
    /// Iteration works on this snapshot so no lock is held while consumers run.
    fn prefix_scan(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let data = self.data.read();
        let mut results: Vec<(Vec<u8>, Vec<u8>)> = data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        results.sort_by(|(a, _), (b, _)| a.cmp(b));
        results
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.data.read().contains_key(key))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn iterate(
        &self,
        prefix: &[u8],
        consumer: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> StoreResult<()> {
        for (key, value) in self.prefix_scan(prefix) {
            if !consumer(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    fn iterate_keys(&self, prefix: &[u8], consumer: &mut dyn FnMut(&[u8]) -> bool) -> StoreResult<()> {
        let mut keys: Vec<Vec<u8>> = {
            let data = self.data.read();
            data.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
        };
        keys.sort();
        for key in keys {
            if !consumer(&key) {
                break;
            }
        }
        Ok(())
    }

    fn delete_prefix(&self, prefix: &[u8]) -> StoreResult<()> {
        self.data.write().retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKvStore")
            .field("entries", &self.len())
            .finish()
    }
}
