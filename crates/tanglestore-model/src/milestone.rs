//! Milestone storage.
//!
//! Persisted layout, realm [`StorePrefix::Milestones`]:
//!
//! ```text
//!   key:   index (u32 LE)                          4 bytes
//!   value: message id (32) ++ timestamp (u64 LE)  40 bytes
//! ```
//!
//! Milestones are immutable. [`Milestone`] does not implement
//! [`Mutable`](tanglestore_core::Mutable), so once stored there is no
//! operation that could rewrite one:
//!
//! ```
//! use std::sync::Arc;
//! use tanglestore_core::{CacheOpts, MemoryKvStore, ObjectStorage, ReleasePool, RetryPolicy};
//! use tanglestore_model::{MessageId, Milestone, MilestoneIndex};
//!
//! let pool = Arc::new(ReleasePool::new(1, RetryPolicy::default()).unwrap());
//! let storage =
//!     ObjectStorage::<Milestone>::new("milestones", Arc::new(MemoryKvStore::new()), CacheOpts::ephemeral(), pool)
//!         .unwrap();
//! let milestone = Milestone { index: MilestoneIndex(1), message_id: MessageId([0; 32]), timestamp: 10 };
//! let (cached, inserted) = storage.store_if_absent(milestone).unwrap();
//! assert!(inserted);
//! assert_eq!(cached.get().timestamp, 10);
//! ```
//!
//! ```compile_fail
//! use std::sync::Arc;
//! use tanglestore_core::{CacheOpts, MemoryKvStore, ObjectStorage, ReleasePool, RetryPolicy};
//! use tanglestore_model::{MessageId, Milestone, MilestoneIndex};
//!
//! let pool = Arc::new(ReleasePool::new(1, RetryPolicy::default()).unwrap());
//! let storage =
//!     ObjectStorage::<Milestone>::new("milestones", Arc::new(MemoryKvStore::new()), CacheOpts::ephemeral(), pool)
//!         .unwrap();
//! let milestone = Milestone { index: MilestoneIndex(1), message_id: MessageId([0; 32]), timestamp: 10 };
//! let (cached, _) = storage.store_if_absent(milestone).unwrap();
//! cached.modify(|m| m.timestamp = 20); // `modify` needs `Milestone: Mutable`
//! ```

use std::sync::Arc;

use parking_lot::RwLockReadGuard;
use tracing::debug;

use tanglestore_core::{
    with_realm, CacheOpts, CachedObject, IteratorOptions, KvStore, ObjectStorage, ReadOptions, ReleasePool, Storable,
    StoreError, StoreResult,
};

use crate::error::{ModelError, ModelResult};
use crate::ids::{MessageId, MilestoneIndex, MESSAGE_ID_LENGTH};
use crate::prefixes::StorePrefix;

const TIMESTAMP_LENGTH: usize = 8;
const VALUE_LENGTH: usize = MESSAGE_ID_LENGTH + TIMESTAMP_LENGTH;

/// A confirmed milestone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Milestone {
    pub index: MilestoneIndex,
    pub message_id: MessageId,
    /// Unix time in seconds
    pub timestamp: u64,
}

impl Storable for Milestone {
    fn storage_key(&self) -> Vec<u8> {
        self.index.to_key().to_vec()
    }

    fn storage_value(&self) -> Vec<u8> {
        let mut value = Vec::with_capacity(VALUE_LENGTH);
        value.extend_from_slice(self.message_id.as_bytes());
        value.extend_from_slice(&self.timestamp.to_le_bytes());
        value
    }

    fn from_storage(key: &[u8], value: &[u8]) -> StoreResult<Self> {
        let index = MilestoneIndex::from_key(key)?;
        if value.len() != VALUE_LENGTH {
            return Err(StoreError::corruption(
                key,
                format!("milestone value must be {} bytes, got {}", VALUE_LENGTH, value.len()),
            ));
        }
        let (id, timestamp) = value.split_at(MESSAGE_ID_LENGTH);
        let message_id = MessageId::from_slice(id).ok_or_else(|| StoreError::corruption(key, "bad message id"))?;
        let timestamp: [u8; TIMESTAMP_LENGTH] = timestamp
            .try_into()
            .map_err(|_| StoreError::corruption(key, "bad timestamp"))?;
        Ok(Milestone { index, message_id, timestamp: u64::from_le_bytes(timestamp) })
    }
}

/// A lease on a cached milestone.
#[derive(Debug, Clone)]
pub struct CachedMilestone(CachedObject<Milestone>);

impl CachedMilestone {
    pub fn milestone(&self) -> RwLockReadGuard<'_, Milestone> {
        self.0.get()
    }

    /// Take another lease on the same milestone.
    pub fn retain(&self) -> Self {
        CachedMilestone(self.0.retain())
    }

    /// Give the lease back; `force` evicts right away if it was the last one.
    pub fn release(self, force: bool) {
        self.0.release(force);
    }
}

/// A batch of milestone leases, released together.
#[derive(Debug, Clone, Default)]
pub struct CachedMilestones(pub Vec<CachedMilestone>);

impl CachedMilestones {
    /// Take another lease on every milestone of the batch.
    pub fn retain(&self) -> Self {
        CachedMilestones(self.0.iter().map(CachedMilestone::retain).collect())
    }

    pub fn release(self, force: bool) {
        for cached in self.0 {
            cached.release(force);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CachedMilestone> {
        self.0.iter()
    }
}

impl From<Vec<CachedMilestone>> for CachedMilestones {
    fn from(milestones: Vec<CachedMilestone>) -> Self {
        CachedMilestones(milestones)
    }
}

/// Typed façade over the milestone object storage.
#[derive(Debug, Clone)]
pub struct MilestoneStorage {
    objects: ObjectStorage<Milestone>,
}

impl MilestoneStorage {
    /// Open the milestone realm of `kv`.
    pub fn new(kv: Arc<dyn KvStore>, opts: CacheOpts, pool: Arc<ReleasePool>) -> ModelResult<Self> {
        let realm = with_realm(kv, &StorePrefix::Milestones.realm());
        let objects = ObjectStorage::new("milestones", realm, opts, pool)?;
        Ok(Self { objects })
    }

    /// Store a new milestone unless one with `index` exists.
    ///
    /// Returns a lease on the stored milestone and whether this call created
    /// it. An existing milestone is returned unchanged.
    pub fn store_milestone_if_absent(
        &self,
        index: MilestoneIndex,
        message_id: MessageId,
        timestamp: u64,
    ) -> ModelResult<(CachedMilestone, bool)> {
        let (object, inserted) = self.objects.store_if_absent(Milestone { index, message_id, timestamp })?;
        if inserted {
            debug!(%index, %message_id, timestamp, "milestone stored");
        }
        Ok((CachedMilestone(object), inserted))
    }

    /// Lease milestone `index`, or `None` if it does not exist.
    pub fn cached_milestone_or_none(&self, index: MilestoneIndex) -> ModelResult<Option<CachedMilestone>> {
        Ok(self.objects.load(&index.to_key())?.map(CachedMilestone))
    }

    /// Unix timestamp of milestone `index`.
    pub fn milestone_timestamp_by_index(&self, index: MilestoneIndex) -> ModelResult<u64> {
        let cached = self
            .cached_milestone_or_none(index)?
            .ok_or_else(|| ModelError::NotFound(format!("milestone {}", index)))?;
        let timestamp = cached.milestone().timestamp;
        cached.release(true);
        Ok(timestamp)
    }

    pub fn contains_milestone(&self, index: MilestoneIndex, options: ReadOptions) -> ModelResult<bool> {
        Ok(self.objects.contains(&index.to_key(), options)?)
    }

    /// Highest milestone index in the key-value store, ignoring the cache.
    ///
    /// Meant for recovery, when cached state cannot be trusted. Returns
    /// index 0 for an empty store.
    pub fn search_latest_milestone_index_in_store(&self) -> ModelResult<MilestoneIndex> {
        let mut latest = MilestoneIndex::default();
        self.for_each_milestone_index(
            |index| {
                latest = latest.max(index);
                true
            },
            IteratorOptions::skip_cache(),
        )?;
        Ok(latest)
    }

    /// Visit the index of every milestone. The consumer returns `false` to stop.
    pub fn for_each_milestone_index<F>(&self, mut consumer: F, options: IteratorOptions) -> ModelResult<()>
    where
        F: FnMut(MilestoneIndex) -> bool,
    {
        let mut failure = None;
        self.objects.for_each_key_only(
            |key| match MilestoneIndex::from_key(key) {
                Ok(index) => consumer(index),
                Err(err) => {
                    failure = Some(err);
                    false
                }
            },
            options,
        )?;
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Like [`for_each_milestone_index`](Self::for_each_milestone_index) but
    /// always reads the key-value store only.
    pub fn for_each_milestone_index_non_cached<F>(&self, consumer: F, options: IteratorOptions) -> ModelResult<()>
    where
        F: FnMut(MilestoneIndex) -> bool,
    {
        self.for_each_milestone_index(consumer, IteratorOptions { skip_cache: true, ..options })
    }

    /// Remove milestone `index` from cache and store. Used when pruning or
    /// rolling back ledger state.
    pub fn delete_milestone(&self, index: MilestoneIndex) -> ModelResult<()> {
        Ok(self.objects.delete(&index.to_key())?)
    }

    pub fn flush(&self) -> ModelResult<()> {
        Ok(self.objects.flush()?)
    }

    pub fn shutdown(&self) -> ModelResult<()> {
        Ok(self.objects.shutdown()?)
    }

    /// Number of cached milestones.
    pub fn milestone_storage_size(&self) -> usize {
        self.objects.cached_len()
    }
}
