//! Durable key-value engine.
//!
//! `DurableKvStore` keeps the whole working set in a RAM hash table and
//! makes it crash-safe with a write-ahead log.
//!
//! **Read path**: RAM only, concurrent readers via RwLock
//! **Write path**: WAL first, then RAM; a failed WAL append never touches RAM
//! **Open**: replay the WAL, then checkpoint the live set into a fresh segment

use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::config::WalOptions;
use crate::error::{StoreError, StoreResult};
use crate::format::Operation;
use crate::kvstore::KvStore;
use crate::wal::{WalReader, WalWriter};

/// RAM hash table backed by a write-ahead log.
///
/// All methods take `&self`. Writers serialize through the WAL mutex and
/// then briefly hold the table's write lock.
pub struct DurableKvStore {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    wal: Mutex<WalWriter>,
    path: PathBuf,
}

impl DurableKvStore {
    /// Open or create a store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P, options: WalOptions) -> StoreResult<Self> {
        options.validate().map_err(StoreError::InvariantViolation)?;
        let path = path.as_ref().to_path_buf();
        let wal_dir = path.join("wal");

        let records = WalReader::new(&wal_dir).recover()?;
        let replayed = records.len();
        let mut data = HashMap::new();
        for record in records {
            match record.operation {
                Operation::Set => {
                    data.insert(record.key, record.value);
                }
                Operation::Delete => {
                    data.remove(&record.key);
                }
            }
        }

        let mut wal = WalWriter::open(&wal_dir, options)?;
        // any leftover bytes, torn or not, must not be followed by new appends
        if replayed > 0 || wal.current_size() > 0 {
            let live = wal.checkpoint(data.iter().map(|(k, v)| (k.as_slice(), v.as_slice())))?;
            info!(
                path = %wal_dir.display(),
                replayed,
                live,
                "recovered key-value store from WAL"
            );
        }

        Ok(Self { data: RwLock::new(data), wal: Mutex::new(wal), path })
    }

    /// Number of key-value pairs held.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Root directory of this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the WAL so it holds exactly the current live set.
    pub fn checkpoint(&self) -> StoreResult<usize> {
        let mut wal = self.wal.lock();
        let data = self.data.read();
        wal.checkpoint(data.iter().map(|(k, v)| (k.as_slice(), v.as_slice())))
    }

    fn sorted_matches(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
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

impl KvStore for DurableKvStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.data.read().contains_key(key))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut wal = self.wal.lock();
        wal.append(key, value, Operation::Set)?;
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let mut wal = self.wal.lock();
        if !self.data.read().contains_key(key) {
            return Ok(());
        }
        wal.append(key, &[], Operation::Delete)?;
        self.data.write().remove(key);
        Ok(())
    }

    fn iterate(
        &self,
        prefix: &[u8],
        consumer: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> StoreResult<()> {
        for (key, value) in self.sorted_matches(prefix) {
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

    fn flush(&self) -> StoreResult<()> {
        self.wal.lock().sync()
    }
}

impl std::fmt::Debug for DurableKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableKvStore")
            .field("path", &self.path)
            .field("entries", &self.len())
            .finish()
    }
}
