//! Leases on cached objects

use std::sync::Arc;

use parking_lot::RwLockReadGuard;

use crate::leak::ConsumerId;
use crate::objectstorage::{Entry, Inner};
use crate::storable::{Mutable, Storable};

/// A lease on one cached object.
///
/// While any lease exists the object stays in memory. Dropping the last one
/// starts the storage's cache-time countdown; [`release`](Self::release)
/// with `force = true` persists and evicts right away instead.
/// [`retain`](Self::retain) (or `clone`) takes an additional lease that must
/// be dropped on its own.
pub struct CachedObject<T: Storable> {
    storage: Arc<Inner<T>>,
    pub(crate) entry: Arc<Entry<T>>,
    consumer: Option<ConsumerId>,
    released: bool,
}

impl<T: Storable> CachedObject<T> {
    pub(crate) fn new(storage: Arc<Inner<T>>, entry: Arc<Entry<T>>, consumer: Option<ConsumerId>) -> Self {
        Self { storage, entry, consumer, released: false }
    }

    /// Key of the object within its storage.
    pub fn key(&self) -> &[u8] {
        &self.entry.key
    }

    /// Read access to the object.
    pub fn get(&self) -> RwLockReadGuard<'_, T> {
        self.entry.value.read()
    }

    /// Whether the object has changes not yet written to the key-value store.
    pub fn is_dirty(&self) -> bool {
        self.entry.meta.lock().dirty
    }

    /// Take another lease on the same object.
    pub fn retain(&self) -> Self {
        // our own lease keeps refs above zero, so the shard lock is not needed
        self.entry.meta.lock().refs += 1;
        self.storage.lease(Arc::clone(&self.entry))
    }

    /// Give the lease back. With `force`, a last lease persists and evicts
    /// the object synchronously instead of waiting for the cache time.
    pub fn release(mut self, force: bool) {
        self.release_lease(force);
    }

    fn release_lease(&mut self, force: bool) {
        if self.released {
            return;
        }
        self.released = true;
        if let (Some(id), Some(leaks)) = (self.consumer.take(), self.storage.leaks.as_ref()) {
            leaks.unregister(&self.entry.key, id);
        }
        self.storage.release(&self.entry, force);
    }
}

impl<T: Mutable> CachedObject<T> {
    /// Change the object in place and mark it dirty.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.entry.value.write());
        self.entry.meta.lock().dirty = true;
        result
    }
}

impl<T: Storable> Clone for CachedObject<T> {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl<T: Storable> Drop for CachedObject<T> {
    fn drop(&mut self) {
        self.release_lease(false);
    }
}

impl<T: Storable + std::fmt::Debug> std::fmt::Debug for CachedObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedObject")
            .field("key", &hex::encode(&self.entry.key))
            .field("value", &*self.get())
            .finish()
    }
}
