//! Entity codec traits and per-call options for object storages

use crate::error::StoreResult;

/// An entity that an [`ObjectStorage`](crate::ObjectStorage) can cache and persist.
///
/// `storage_key` and `storage_value` are the encoders; `from_storage` is the
/// inverse of both and must validate lengths before reading fields, returning
/// [`StoreError::Corruption`](crate::StoreError::Corruption) for malformed input.
///
/// Entities that do not also implement [`Mutable`] are immutable: the storage
/// offers no way to change them once created.
///
/// ```compile_fail
/// use tanglestore_core::{CacheOpts, ObjectStorage, ReleasePool, RetryPolicy, Storable, StoreResult};
/// use tanglestore_core::memory::MemoryKvStore;
/// use std::sync::Arc;
///
/// struct Fixed(u8);
/// impl Storable for Fixed {
///     fn storage_key(&self) -> Vec<u8> { vec![self.0] }
///     fn storage_value(&self) -> Vec<u8> { Vec::new() }
///     fn from_storage(key: &[u8], _: &[u8]) -> StoreResult<Self> { Ok(Fixed(key[0])) }
/// }
///
/// let pool = Arc::new(ReleasePool::new(1, RetryPolicy::default()).unwrap());
/// let storage = ObjectStorage::<Fixed>::new("fixed", Arc::new(MemoryKvStore::new()), CacheOpts::ephemeral(), pool).unwrap();
/// storage.store(Fixed(1)).unwrap(); // `store` needs `Fixed: Mutable`
/// ```
pub trait Storable: Sized + Send + Sync + 'static {
    /// Key of this entity, relative to its storage's realm.
    fn storage_key(&self) -> Vec<u8>;

    /// Persisted representation of everything not in the key.
    fn storage_value(&self) -> Vec<u8>;

    /// Rebuild an entity from its key and value.
    fn from_storage(key: &[u8], value: &[u8]) -> StoreResult<Self>;
}

/// An entity that may change after creation.
pub trait Mutable: Storable {
    /// Merge `other`, a newer version of the same entity, into `self`.
    fn update(&mut self, other: Self);
}

/// Options for point reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Ask the key-value store directly, ignoring cached objects
    pub skip_cache: bool,
}

impl ReadOptions {
    /// Read through the key-value store only.
    pub fn skip_cache() -> Self {
        Self { skip_cache: true }
    }
}

/// Options for key and object iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IteratorOptions {
    /// Iterate the key-value store only
    pub skip_cache: bool,
    /// Restrict iteration to keys starting with this prefix
    pub prefix: Vec<u8>,
}

impl IteratorOptions {
    /// Iterate the key-value store only.
    pub fn skip_cache() -> Self {
        Self { skip_cache: true, prefix: Vec::new() }
    }

    pub fn with_prefix(mut self, prefix: &[u8]) -> Self {
        self.prefix = prefix.to_vec();
        self
    }
}
