//! Node storage: every entity store of a node over one key-value store.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use tanglestore_core::{CacheOpts, DurableKvStore, KvStore, MemoryKvStore, ReleasePool, RetryPolicy, WalOptions};

use crate::error::{ModelError, ModelResult};
use crate::milestone::MilestoneStorage;
use crate::tag::TagStorage;

/// Configuration for a [`Storage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Cache profile of the milestone store
    pub milestones: CacheOpts,
    /// Cache profile of the tag store
    pub tags: CacheOpts,
    /// Threads of the shared release pool
    pub release_worker_count: usize,
    /// Retries for background releases whose persist failed
    pub retry_policy: RetryPolicy,
    /// Only used by [`Storage::open`]
    pub wal: WalOptions,
}

impl StorageConfig {
    /// Full node: every store persisted with the node cache profile.
    pub fn node() -> Self {
        Self {
            milestones: CacheOpts::node(),
            tags: CacheOpts::node(),
            release_worker_count: 2,
            retry_policy: RetryPolicy::default(),
            wal: WalOptions::durable(),
        }
    }

    /// Scratch storage that never reads or writes its key-value store.
    pub fn ephemeral() -> Self {
        Self {
            milestones: CacheOpts::ephemeral(),
            tags: CacheOpts::ephemeral(),
            release_worker_count: 1,
            ..Self::node()
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        self.milestones.validate().map_err(|e| format!("milestones: {}", e))?;
        self.tags.validate().map_err(|e| format!("tags: {}", e))?;
        if self.release_worker_count == 0 {
            return Err("release_worker_count must be > 0".into());
        }
        self.retry_policy.validate()?;
        self.wal.validate()?;
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self { Self::node() }
}

/// The entity stores of one node, sharing a key-value store and a release pool.
pub struct Storage {
    kv: Arc<dyn KvStore>,
    pool: Arc<ReleasePool>,
    milestones: MilestoneStorage,
    tags: TagStorage,
}

impl Storage {
    /// Build every store over `kv`, each in its own realm.
    pub fn new(kv: Arc<dyn KvStore>, config: StorageConfig) -> ModelResult<Self> {
        config.validate().map_err(ModelError::InvalidConfig)?;
        let pool = Arc::new(ReleasePool::new(config.release_worker_count, config.retry_policy)?);
        let milestones = MilestoneStorage::new(Arc::clone(&kv), config.milestones, Arc::clone(&pool))?;
        let tags = TagStorage::new(Arc::clone(&kv), config.tags, Arc::clone(&pool))?;
        Ok(Self { kv, pool, milestones, tags })
    }

    /// Open or create a durable storage at `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: StorageConfig) -> ModelResult<Self> {
        let path = path.as_ref();
        let kv = DurableKvStore::open(path, config.wal.clone())?;
        info!(path = %path.display(), entries = kv.len(), "storage opened");
        Self::new(Arc::new(kv), config)
    }

    /// In-memory storage with persistence disabled.
    ///
    /// Nothing is ever written anywhere: an entity lives only while it is
    /// leased and is gone for good once its last lease is released. Use it
    /// for scratch work, not for data that must be read back later.
    pub fn ephemeral() -> ModelResult<Self> {
        Self::new(Arc::new(MemoryKvStore::new()), StorageConfig::ephemeral())
    }

    pub fn milestones(&self) -> &MilestoneStorage {
        &self.milestones
    }

    pub fn tags(&self) -> &TagStorage {
        &self.tags
    }

    /// The shared key-value store.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Flush every store. All stores are attempted; the first error is returned.
    pub fn flush_storages(&self) -> ModelResult<()> {
        let results = [self.milestones.flush(), self.tags.flush()];
        first_error(results)
    }

    /// Shut down every store, then the release pool, then sync the
    /// key-value store. All steps run; the first error is returned.
    pub fn shutdown_storages(&self) -> ModelResult<()> {
        let mut results = vec![self.milestones.shutdown(), self.tags.shutdown()];
        self.pool.shutdown();
        results.push(self.kv.flush().map_err(ModelError::from));
        let result = first_error(results);
        match &result {
            Ok(()) => info!("storage shut down"),
            Err(err) => warn!(%err, "storage shut down with errors"),
        }
        result
    }
}

fn first_error(results: impl IntoIterator<Item = ModelResult<()>>) -> ModelResult<()> {
    results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("milestones", &self.milestones)
            .field("tags", &self.tags)
            .field("release_workers", &self.pool.worker_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{MessageId, MilestoneIndex};
    use tempfile::TempDir;

    #[test]
    fn test_presets_valid() {
        assert!(StorageConfig::node().validate().is_ok());
        assert!(StorageConfig::ephemeral().validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = StorageConfig::node();
        config.release_worker_count = 0;
        let err = Storage::new(Arc::new(MemoryKvStore::new()), config).unwrap_err();
        assert!(matches!(err, ModelError::InvalidConfig(_)));

        let mut config = StorageConfig::node();
        config.tags = config.tags.with_shard_count(3);
        let err = Storage::new(Arc::new(MemoryKvStore::new()), config).unwrap_err();
        assert!(err.to_string().contains("tags"));
    }

    #[test]
    fn test_operations_fail_after_shutdown() {
        let storage = Storage::ephemeral().unwrap();
        storage.shutdown_storages().unwrap();
        // idempotent
        storage.shutdown_storages().unwrap();
        let err = storage.milestones().cached_milestone_or_none(MilestoneIndex(1)).unwrap_err();
        assert!(matches!(err, ModelError::Store(ref e) if e.is_invariant_violation()));
    }

    #[test]
    fn test_open_durable() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path(), StorageConfig::node()).unwrap();
        storage
            .milestones()
            .store_milestone_if_absent(MilestoneIndex(5), MessageId([5; 32]), 50)
            .unwrap();
        storage.shutdown_storages().unwrap();
        assert!(format!("{:?}", storage).contains("Storage"));
    }
}
