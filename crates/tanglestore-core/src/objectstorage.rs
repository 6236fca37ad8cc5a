//! Reference-counted write-back object cache
//!
//! An `ObjectStorage<T>` keeps at most one in-memory instance per key and
//! hands out [`CachedObject`] leases to it. When the last lease is dropped the
//! object is not evicted right away: a release is scheduled on the shared
//! [`ReleasePool`] after the configured cache time, and cancelled if the object
//! is acquired again in the meantime. The release persists the object if it
//! is dirty and then evicts it.
//!
//! # Locking
//!
//! Keys hash onto a fixed number of shards, each a mutex around a map of
//! slots. Per-key operations serialize on their shard; unrelated shards never
//! contend. A cache miss leaves a `Loading` slot in the shard and reads the
//! key-value store without holding the shard lock, so other keys of the same
//! shard stay available; concurrent callers for the same key wait on the
//! slot instead of reading again.
//!
//! Lock order is shard, then entry metadata, then entry value. Persisting and
//! evicting happen together under the shard lock, so a concurrent load never
//! reads a store value older than the cached one.
//!
//! # Iteration
//!
//! Iteration that includes the cache yields a snapshot of the cached keys
//! taken when iteration starts, followed by the store's keys that were not
//! in that snapshot. Changes made during iteration may or may not be seen.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::cached_object::CachedObject;
use crate::config::CacheOpts;
use crate::error::{StoreError, StoreResult};
use crate::kvstore::KvStore;
use crate::leak::{LeakDetector, LeakReport};
use crate::release::{ReleaseOutcome, ReleasePool, ReleaseTarget, TaskId};
use crate::storable::{IteratorOptions, Mutable, ReadOptions, Storable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// In the shard map, possibly leased
    Resident,
    /// In the shard map with no leases, waiting for its release task
    PendingRelease(TaskId),
    /// No longer in the shard map
    Released,
}

pub(crate) struct Meta {
    pub(crate) state: EntryState,
    pub(crate) refs: usize,
    pub(crate) dirty: bool,
    pub(crate) deleted: bool,
}

/// One cached object.
pub(crate) struct Entry<T> {
    pub(crate) key: Vec<u8>,
    pub(crate) value: RwLock<T>,
    pub(crate) meta: Mutex<Meta>,
}

impl<T> Entry<T> {
    fn new(key: Vec<u8>, value: T, refs: usize, dirty: bool) -> Self {
        Self {
            key,
            value: RwLock::new(value),
            meta: Mutex::new(Meta { state: EntryState::Resident, refs, dirty, deleted: false }),
        }
    }
}

type LoadOutcome<T> = StoreResult<Option<Arc<Entry<T>>>>;

/// An in-flight read of a missing key.
struct Pending<T> {
    state: Mutex<PendingState<T>>,
    done: Condvar,
}

struct PendingState<T> {
    /// Callers waiting for this load; each gets one lease if it succeeds
    waiters: usize,
    outcome: Option<LoadOutcome<T>>,
}

impl<T> Pending<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PendingState { waiters: 0, outcome: None }),
            done: Condvar::new(),
        })
    }

    fn finish(&self, outcome: LoadOutcome<T>) {
        self.state.lock().outcome = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> LoadOutcome<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.done.wait(&mut state);
        }
    }
}

enum Slot<T> {
    Loading(Arc<Pending<T>>),
    Cached(Arc<Entry<T>>),
}

type Shard<T> = Mutex<HashMap<Vec<u8>, Slot<T>>>;

pub(crate) struct Inner<T: Storable> {
    name: String,
    kv: Arc<dyn KvStore>,
    opts: CacheOpts,
    shards: Box<[Shard<T>]>,
    hasher: DefaultHashBuilder,
    pool: Arc<ReleasePool>,
    pub(crate) leaks: Option<LeakDetector>,
    shut_down: AtomicBool,
}

impl<T: Storable> Inner<T> {
    fn shard(&self, key: &[u8]) -> &Shard<T> {
        let index = (self.hasher.hash_one(key) as usize) & (self.shards.len() - 1);
        &self.shards[index]
    }

    fn ensure_running(&self) -> StoreResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(StoreError::InvariantViolation(format!(
                "object storage {} is shut down",
                self.name
            )));
        }
        Ok(())
    }

    /// Wrap an entry whose reference count already includes this lease.
    pub(crate) fn lease(self: &Arc<Self>, entry: Arc<Entry<T>>) -> CachedObject<T> {
        let consumer = self.leaks.as_ref().map(|leaks| leaks.register(&entry.key));
        CachedObject::new(Arc::clone(self), entry, consumer)
    }

    /// Count a new lease on a mapped entry. Caller holds the shard lock.
    fn acquire(&self, entry: &Entry<T>) {
        let mut meta = entry.meta.lock();
        meta.refs += 1;
        if let EntryState::PendingRelease(task) = meta.state {
            self.pool.cancel(task);
            meta.state = EntryState::Resident;
        }
    }

    fn is_mapped(map: &HashMap<Vec<u8>, Slot<T>>, entry: &Arc<Entry<T>>) -> bool {
        matches!(map.get(&entry.key), Some(Slot::Cached(mapped)) if Arc::ptr_eq(mapped, entry))
    }

    fn is_loading(map: &HashMap<Vec<u8>, Slot<T>>, key: &[u8], pending: &Arc<Pending<T>>) -> bool {
        matches!(map.get(key), Some(Slot::Loading(mapped)) if Arc::ptr_eq(mapped, pending))
    }

    fn read_from_store(&self, key: &[u8]) -> StoreResult<Option<T>> {
        match self.kv.get(key)? {
            Some(value) => T::from_storage(key, &value).map(Some),
            None => Ok(None),
        }
    }

    /// Replace a `Loading` slot with a cached entry leased once per waiter
    /// plus once for the loader.
    fn install(
        &self,
        map: &mut HashMap<Vec<u8>, Slot<T>>,
        key: &[u8],
        pending: &Pending<T>,
        value: T,
        dirty: bool,
    ) -> Arc<Entry<T>> {
        let refs = 1 + pending.state.lock().waiters;
        let entry = Arc::new(Entry::new(key.to_vec(), value, refs, dirty));
        map.insert(key.to_vec(), Slot::Cached(Arc::clone(&entry)));
        pending.finish(Ok(Some(Arc::clone(&entry))));
        entry
    }

    /// Write a dirty, live entry to the key-value store.
    fn persist(&self, entry: &Entry<T>, meta: &mut Meta) -> StoreResult<()> {
        if !meta.dirty || meta.deleted {
            return Ok(());
        }
        if self.opts.persistence_enabled {
            let value = entry.value.read().storage_value();
            self.kv.set(&entry.key, &value)?;
        }
        meta.dirty = false;
        Ok(())
    }

    fn load_entry(&self, key: &[u8]) -> LoadOutcome<T> {
        let shard = self.shard(key);
        let mut map = shard.lock();
        match map.get(key) {
            Some(Slot::Cached(entry)) => {
                self.acquire(entry);
                return Ok(Some(Arc::clone(entry)));
            }
            Some(Slot::Loading(pending)) => {
                let pending = Arc::clone(pending);
                pending.state.lock().waiters += 1;
                drop(map);
                return pending.wait();
            }
            None => {}
        }
        if !self.opts.persistence_enabled {
            return Ok(None);
        }

        let pending = Pending::new();
        map.insert(key.to_vec(), Slot::Loading(Arc::clone(&pending)));
        drop(map);

        let loaded = self.read_from_store(key);

        let mut map = shard.lock();
        if !Self::is_loading(&map, key, &pending) {
            // deleted while loading
            pending.finish(Ok(None));
            return Ok(None);
        }
        match loaded {
            Ok(Some(value)) => Ok(Some(self.install(&mut map, key, &pending, value, false))),
            Ok(None) => {
                map.remove(key);
                pending.finish(Ok(None));
                Ok(None)
            }
            Err(err) => {
                map.remove(key);
                pending.finish(Err(err.clone()));
                Err(err)
            }
        }
    }

    fn store_if_absent(self: &Arc<Self>, object: T) -> StoreResult<(CachedObject<T>, bool)> {
        let key = object.storage_key();
        let shard = self.shard(&key);
        loop {
            let mut map = shard.lock();
            match map.get(&key) {
                Some(Slot::Cached(entry)) => {
                    self.acquire(entry);
                    let entry = Arc::clone(entry);
                    drop(map);
                    return Ok((self.lease(entry), false));
                }
                Some(Slot::Loading(pending)) => {
                    let pending = Arc::clone(pending);
                    pending.state.lock().waiters += 1;
                    drop(map);
                    match pending.wait()? {
                        Some(entry) => return Ok((self.lease(entry), false)),
                        None => continue,
                    }
                }
                None => {}
            }

            if !self.opts.persistence_enabled {
                let entry = Arc::new(Entry::new(key.clone(), object, 1, true));
                map.insert(key, Slot::Cached(Arc::clone(&entry)));
                drop(map);
                return Ok((self.lease(entry), true));
            }

            let pending = Pending::new();
            map.insert(key.clone(), Slot::Loading(Arc::clone(&pending)));
            drop(map);

            let existing = self.read_from_store(&key);

            let mut map = shard.lock();
            if !Self::is_loading(&map, &key, &pending) {
                pending.finish(Ok(None));
                continue;
            }
            return match existing {
                Ok(Some(stored)) => {
                    let entry = self.install(&mut map, &key, &pending, stored, false);
                    drop(map);
                    Ok((self.lease(entry), false))
                }
                Ok(None) => {
                    let entry = self.install(&mut map, &key, &pending, object, true);
                    if self.opts.store_on_creation {
                        let mut meta = entry.meta.lock();
                        if let Err(err) = self.persist(&entry, &mut meta) {
                            warn!(storage = %self.name, key = %hex::encode(&key), %err, "persist on creation failed, object stays dirty");
                        }
                    }
                    drop(map);
                    trace!(storage = %self.name, key = %hex::encode(&key), "object created");
                    Ok((self.lease(entry), true))
                }
                Err(err) => {
                    map.remove(&key);
                    pending.finish(Err(err.clone()));
                    Err(err)
                }
            };
        }
    }

    /// Drop one lease. At zero the entry is evicted now or scheduled for a
    /// delayed release.
    pub(crate) fn release(self: &Arc<Self>, entry: &Arc<Entry<T>>, force: bool) {
        let shard = self.shard(&entry.key);
        let mut map = shard.lock();
        let mut meta = entry.meta.lock();
        if meta.refs == 0 {
            panic!(
                "{}",
                StoreError::InvariantViolation(format!(
                    "release of {} in {} without a matching acquire",
                    hex::encode(&entry.key),
                    self.name
                ))
            );
        }
        meta.refs -= 1;
        if meta.refs > 0 {
            return;
        }
        if meta.deleted || !Self::is_mapped(&map, entry) {
            meta.state = EntryState::Released;
            return;
        }

        let immediate = force || self.opts.cache_time.is_zero() || self.shut_down.load(Ordering::Acquire);
        if !immediate {
            self.schedule_release(entry, &mut meta, self.opts.cache_time);
            return;
        }
        match self.persist(entry, &mut meta) {
            Ok(()) => {
                map.remove(&entry.key);
                meta.state = EntryState::Released;
                trace!(storage = %self.name, key = %hex::encode(&entry.key), "object evicted");
            }
            Err(err) => {
                warn!(storage = %self.name, key = %hex::encode(&entry.key), %err, "persist on release failed, retrying in background");
                self.schedule_release(entry, &mut meta, Duration::ZERO);
            }
        }
    }

    fn schedule_release(self: &Arc<Self>, entry: &Entry<T>, meta: &mut Meta, after: Duration) {
        let target: Weak<dyn ReleaseTarget> = Arc::downgrade(self) as Weak<dyn ReleaseTarget>;
        match self.pool.schedule(target, &entry.key, after) {
            Ok(task) => meta.state = EntryState::PendingRelease(task),
            Err(err) => {
                // stays cached until the next flush
                debug!(storage = %self.name, key = %hex::encode(&entry.key), %err, "release not scheduled");
                meta.state = EntryState::Resident;
            }
        }
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let mut map = self.shard(key).lock();
        if let Some(Slot::Cached(entry)) = map.remove(key) {
            self.forget(&entry);
        }
        // a removed Loading slot is noticed by its loader
        if self.opts.persistence_enabled {
            self.kv.delete(key)?;
        }
        Ok(())
    }

    /// Mark an entry removed from its shard map as deleted.
    fn forget(&self, entry: &Entry<T>) {
        let mut meta = entry.meta.lock();
        meta.deleted = true;
        meta.dirty = false;
        if let EntryState::PendingRelease(task) = meta.state {
            self.pool.cancel(task);
        }
        meta.state = if meta.refs == 0 { EntryState::Released } else { EntryState::Resident };
    }

    fn cached_keys(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        for shard in self.shards.iter() {
            let map = shard.lock();
            keys.extend(
                map.iter()
                    .filter(|(key, slot)| matches!(slot, Slot::Cached(_)) && key.starts_with(prefix))
                    .map(|(key, _)| key.clone()),
            );
        }
        keys.sort();
        keys
    }

    fn for_each_key_only(&self, consumer: &mut dyn FnMut(&[u8]) -> bool, options: &IteratorOptions) -> StoreResult<()> {
        let include_cache = !options.skip_cache || !self.opts.persistence_enabled;
        let mut seen = HashSet::new();
        if include_cache {
            for key in self.cached_keys(&options.prefix) {
                if !consumer(&key) {
                    return Ok(());
                }
                seen.insert(key);
            }
        }
        if !self.opts.persistence_enabled {
            return Ok(());
        }
        self.kv.iterate_keys(&options.prefix, &mut |key| seen.contains(key) || consumer(key))
    }

    /// Persist every dirty entry and evict the unleased ones.
    fn flush_all(&self) -> StoreResult<()> {
        let mut first_error = None;
        let mut persisted = 0usize;
        let mut evicted = 0usize;
        for shard in self.shards.iter() {
            let mut map = shard.lock();
            let entries: Vec<Arc<Entry<T>>> = map
                .values()
                .filter_map(|slot| match slot {
                    Slot::Cached(entry) => Some(Arc::clone(entry)),
                    Slot::Loading(_) => None,
                })
                .collect();
            for entry in entries {
                let mut meta = entry.meta.lock();
                let was_dirty = meta.dirty;
                if let Err(err) = self.persist(&entry, &mut meta) {
                    warn!(storage = %self.name, key = %hex::encode(&entry.key), %err, "flush could not persist object");
                    first_error.get_or_insert(err);
                    continue;
                }
                if was_dirty {
                    persisted += 1;
                }
                if meta.refs == 0 {
                    if let EntryState::PendingRelease(task) = meta.state {
                        self.pool.cancel(task);
                    }
                    map.remove(&entry.key);
                    meta.state = EntryState::Released;
                    evicted += 1;
                }
            }
        }
        if self.opts.persistence_enabled {
            if let Err(err) = self.kv.flush() {
                first_error.get_or_insert(err);
            }
        }
        debug!(storage = %self.name, persisted, evicted, "object storage flushed");
        first_error.map_or(Ok(()), Err)
    }
}

impl<T: Storable> ReleaseTarget for Inner<T> {
    fn release_scheduled(&self, key: &[u8], task: TaskId) -> ReleaseOutcome {
        let mut map = self.shard(key).lock();
        let entry = match map.get(key) {
            Some(Slot::Cached(entry)) => Arc::clone(entry),
            _ => return ReleaseOutcome::Completed,
        };
        let mut meta = entry.meta.lock();
        if meta.refs > 0 || meta.state != EntryState::PendingRelease(task) {
            return ReleaseOutcome::Completed;
        }
        if let Err(err) = self.persist(&entry, &mut meta) {
            return ReleaseOutcome::Retry(err);
        }
        map.remove(key);
        meta.state = EntryState::Released;
        trace!(storage = %self.name, key = %hex::encode(key), task, "object released");
        ReleaseOutcome::Completed
    }

    fn abandon_release(&self, key: &[u8], task: TaskId, _error: &StoreError) {
        let map = self.shard(key).lock();
        if let Some(Slot::Cached(entry)) = map.get(key) {
            let mut meta = entry.meta.lock();
            if meta.state == EntryState::PendingRelease(task) {
                meta.state = EntryState::Resident;
            }
        }
    }
}

impl<T: Storable> Drop for Inner<T> {
    fn drop(&mut self) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.flush_all() {
            warn!(storage = %self.name, %err, "dirty objects lost when dropping object storage");
        }
    }
}

/// Cached object store for one entity type.
///
/// Cloning is cheap and yields another handle to the same storage.
pub struct ObjectStorage<T: Storable> {
    inner: Arc<Inner<T>>,
}

impl<T: Storable> Clone for ObjectStorage<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Storable> ObjectStorage<T> {
    /// Create a storage named `name` over `kv`, which should be a realm
    /// reserved for this entity type.
    pub fn new(name: &str, kv: Arc<dyn KvStore>, opts: CacheOpts, pool: Arc<ReleasePool>) -> StoreResult<Self> {
        opts.validate().map_err(StoreError::InvariantViolation)?;
        let leaks = if opts.leak_detection.enabled {
            Some(LeakDetector::new(name, opts.leak_detection.clone())?)
        } else {
            None
        };
        let shards = (0..opts.shard_count).map(|_| Mutex::new(HashMap::new())).collect();
        info!(
            storage = name,
            cache_time = ?opts.cache_time,
            persistence = opts.persistence_enabled,
            leak_detection = opts.leak_detection.enabled,
            "object storage created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                kv,
                opts,
                shards,
                hasher: DefaultHashBuilder::default(),
                pool,
                leaks,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &CacheOpts {
        &self.inner.opts
    }

    /// Lease the object stored under `key`, reading it from the key-value
    /// store on a cache miss. `None` if it does not exist.
    pub fn load(&self, key: &[u8]) -> StoreResult<Option<CachedObject<T>>> {
        self.inner.ensure_running()?;
        Ok(self.inner.load_entry(key)?.map(|entry| self.inner.lease(entry)))
    }

    /// Insert `object` unless its key already exists.
    ///
    /// Returns a lease on the stored object and whether `object` was the one
    /// inserted. Concurrent callers for one key see exactly one insertion;
    /// the others get the winner's object.
    pub fn store_if_absent(&self, object: T) -> StoreResult<(CachedObject<T>, bool)> {
        self.inner.ensure_running()?;
        self.inner.store_if_absent(object)
    }

    /// Whether `key` exists, consulting the cache first unless told otherwise.
    pub fn contains(&self, key: &[u8], options: ReadOptions) -> StoreResult<bool> {
        self.inner.ensure_running()?;
        let persistence = self.inner.opts.persistence_enabled;
        if !options.skip_cache || !persistence {
            let map = self.inner.shard(key).lock();
            if let Some(Slot::Cached(_)) = map.get(key) {
                return Ok(true);
            }
        }
        if !persistence {
            return Ok(false);
        }
        self.inner.kv.has(key)
    }

    /// Visit every key. The consumer returns `false` to stop.
    pub fn for_each_key_only<F>(&self, mut consumer: F, options: IteratorOptions) -> StoreResult<()>
    where
        F: FnMut(&[u8]) -> bool,
    {
        self.inner.ensure_running()?;
        self.inner.for_each_key_only(&mut consumer, &options)
    }

    /// Visit a lease on every object. The consumer returns `false` to stop.
    pub fn for_each<F>(&self, mut consumer: F, options: IteratorOptions) -> StoreResult<()>
    where
        F: FnMut(CachedObject<T>) -> bool,
    {
        self.inner.ensure_running()?;
        let mut failure = None;
        self.inner.for_each_key_only(
            &mut |key| match self.inner.load_entry(key) {
                Ok(Some(entry)) => consumer(self.inner.lease(entry)),
                Ok(None) => true,
                Err(err) => {
                    failure = Some(err);
                    false
                }
            },
            &options,
        )?;
        failure.map_or(Ok(()), Err)
    }

    /// Remove `key` from the cache and the key-value store. Existing leases
    /// stay readable but are never persisted again.
    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.inner.ensure_running()?;
        self.inner.delete(key)
    }

    /// Drop every cached object and delete every key of this storage.
    ///
    /// Writers should be quiesced; objects created while pruning may survive.
    pub fn prune(&self) -> StoreResult<()> {
        self.inner.ensure_running()?;
        for shard in self.inner.shards.iter() {
            let mut map = shard.lock();
            for (_, slot) in map.drain() {
                if let Slot::Cached(entry) = slot {
                    self.inner.forget(&entry);
                }
            }
        }
        if self.inner.opts.persistence_enabled {
            self.inner.kv.delete_prefix(&[])?;
        }
        info!(storage = %self.inner.name, "object storage pruned");
        Ok(())
    }

    /// Persist every dirty object, evict the unleased ones and sync the
    /// key-value store. Returns the first error after attempting all objects.
    pub fn flush(&self) -> StoreResult<()> {
        self.inner.ensure_running()?;
        self.inner.flush_all()
    }

    /// Flush and refuse further operations. Leases still held are released
    /// synchronously when dropped. Idempotent.
    pub fn shutdown(&self) -> StoreResult<()> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.inner.flush_all();
        info!(storage = %self.inner.name, "object storage shut down");
        result
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Number of objects currently cached.
    pub fn cached_len(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.lock().values().filter(|slot| matches!(slot, Slot::Cached(_))).count())
            .sum()
    }

    /// Leaks reported so far; always empty without leak detection.
    pub fn leak_reports(&self) -> Vec<LeakReport> {
        self.inner.leaks.as_ref().map(LeakDetector::reports).unwrap_or_default()
    }
}

impl<T: Mutable> ObjectStorage<T> {
    /// Insert `object`, or merge it into the cached instance via
    /// [`Mutable::update`]. Either way the object is marked dirty.
    pub fn store(&self, object: T) -> StoreResult<CachedObject<T>> {
        self.inner.ensure_running()?;
        let inner = &self.inner;
        let key = object.storage_key();
        let shard = inner.shard(&key);
        loop {
            let mut map = shard.lock();
            let entry = match map.get(&key) {
                Some(Slot::Cached(entry)) => {
                    inner.acquire(entry);
                    Arc::clone(entry)
                }
                Some(Slot::Loading(pending)) => {
                    let pending = Arc::clone(pending);
                    pending.state.lock().waiters += 1;
                    drop(map);
                    match pending.wait()? {
                        Some(entry) => entry,
                        None => continue,
                    }
                }
                None => {
                    let entry = Arc::new(Entry::new(key.clone(), object, 1, true));
                    map.insert(key, Slot::Cached(Arc::clone(&entry)));
                    if inner.opts.store_on_creation {
                        let mut meta = entry.meta.lock();
                        if let Err(err) = inner.persist(&entry, &mut meta) {
                            warn!(storage = %inner.name, %err, "persist on creation failed, object stays dirty");
                        }
                    }
                    drop(map);
                    return Ok(inner.lease(entry));
                }
            };
            entry.value.write().update(object);
            entry.meta.lock().dirty = true;
            return Ok(inner.lease(entry));
        }
    }
}

impl<T: Storable> std::fmt::Debug for ObjectStorage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("name", &self.inner.name)
            .field("options", &self.inner.opts)
            .field("cached", &self.cached_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LeakDetectionOptions, RetryPolicy};
    use crate::memory::MemoryKvStore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Counter {
        id: u32,
        count: u64,
    }

    impl Storable for Counter {
        fn storage_key(&self) -> Vec<u8> {
            self.id.to_le_bytes().to_vec()
        }

        fn storage_value(&self) -> Vec<u8> {
            self.count.to_le_bytes().to_vec()
        }

        fn from_storage(key: &[u8], value: &[u8]) -> StoreResult<Self> {
            let id: [u8; 4] = key.try_into().map_err(|_| StoreError::corruption(key, "bad key length"))?;
            let count: [u8; 8] = value.try_into().map_err(|_| StoreError::corruption(key, "bad value length"))?;
            Ok(Counter { id: u32::from_le_bytes(id), count: u64::from_le_bytes(count) })
        }
    }

    impl Mutable for Counter {
        fn update(&mut self, other: Self) {
            self.count = other.count;
        }
    }

    fn counter(id: u32, count: u64) -> Counter {
        Counter { id, count }
    }

    fn key(id: u32) -> Vec<u8> {
        id.to_le_bytes().to_vec()
    }

    /// Memory store that counts calls and can be told to fail writes.
    #[derive(Default)]
    struct TestKvStore {
        inner: MemoryKvStore,
        gets: AtomicUsize,
        sets: AtomicUsize,
        calls: AtomicUsize,
        failing_sets: AtomicUsize,
    }

    impl TestKvStore {
        fn fail_next_sets(&self, n: usize) {
            self.failing_sets.store(n, Ordering::SeqCst);
        }
    }

    impl KvStore for TestKvStore {
        fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key)
        }

        fn has(&self, key: &[u8]) -> StoreResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.has(key)
        }

        fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_sets.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_sets.store(failing - 1, Ordering::SeqCst);
                return Err(StoreError::Io {
                    path: None,
                    kind: std::io::ErrorKind::Other,
                    message: "injected write failure".into(),
                });
            }
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }

        fn delete(&self, key: &[u8]) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(key)
        }

        fn iterate(&self, prefix: &[u8], consumer: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.iterate(prefix, consumer)
        }

        fn flush(&self) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool() -> Arc<ReleasePool> {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        };
        Arc::new(ReleasePool::new(2, policy).unwrap())
    }

    fn storage_with(opts: CacheOpts) -> (ObjectStorage<Counter>, Arc<TestKvStore>) {
        let kv = Arc::new(TestKvStore::default());
        let storage = ObjectStorage::new("counters", kv.clone() as Arc<dyn KvStore>, opts, pool()).unwrap();
        (storage, kv)
    }

    fn short_cache() -> CacheOpts {
        CacheOpts::node().with_cache_time(Duration::from_millis(30)).with_shard_count(4)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_missing_key_loads_none() {
        let (storage, _kv) = storage_with(short_cache());
        assert!(storage.load(&key(1)).unwrap().is_none());
        assert_eq!(storage.cached_len(), 0);
    }

    #[test]
    fn test_read_your_write() {
        let (storage, _kv) = storage_with(short_cache());
        let (created, inserted) = storage.store_if_absent(counter(7, 42)).unwrap();
        assert!(inserted);
        drop(created);

        let loaded = storage.load(&key(7)).unwrap().unwrap();
        assert_eq!(*loaded.get(), counter(7, 42));
    }

    #[test]
    fn test_store_if_absent_keeps_first_object() {
        let (storage, _kv) = storage_with(short_cache());
        let (_first, inserted) = storage.store_if_absent(counter(1, 10)).unwrap();
        assert!(inserted);

        let (second, inserted) = storage.store_if_absent(counter(1, 99)).unwrap();
        assert!(!inserted);
        assert_eq!(second.get().count, 10);
    }

    #[test]
    fn test_store_if_absent_finds_persisted_object() {
        let (storage, kv) = storage_with(short_cache());
        kv.set(&key(3), &5u64.to_le_bytes()).unwrap();

        let (existing, inserted) = storage.store_if_absent(counter(3, 99)).unwrap();
        assert!(!inserted);
        assert_eq!(existing.get().count, 5);
    }

    #[test]
    fn test_concurrent_store_if_absent_inserts_once() {
        let (storage, _kv) = storage_with(short_cache());
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let storage = storage.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let (object, inserted) = storage.store_if_absent(counter(5, i as u64)).unwrap();
                    let count = object.get().count;
                    (inserted, count)
                })
            })
            .collect();

        let results: Vec<(bool, u64)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<u64> = results.iter().filter(|(inserted, _)| *inserted).map(|(_, c)| *c).collect();
        assert_eq!(winners.len(), 1);
        assert!(results.iter().all(|(_, count)| *count == winners[0]));
    }

    #[test]
    fn test_concurrent_misses_read_store_once() {
        let (storage, kv) = storage_with(CacheOpts::node().with_shard_count(4));
        kv.set(&key(9), &1u64.to_le_bytes()).unwrap();

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let storage = storage.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    storage.load(&key(9)).unwrap().unwrap().get().count
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
        assert_eq!(kv.gets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_every_lease_must_be_released_before_eviction() {
        let (storage, kv) = storage_with(short_cache().with_store_on_creation(false));
        let (first, _) = storage.store_if_absent(counter(1, 1)).unwrap();
        let second = first.retain();
        let third = second.clone();

        drop(first);
        drop(second);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(storage.cached_len(), 1);
        assert!(!kv.has(&key(1)).unwrap());
        assert_eq!(third.get().count, 1);

        drop(third);
        assert!(wait_for(|| storage.cached_len() == 0));
        assert!(kv.has(&key(1)).unwrap());
    }

    #[test]
    fn test_reacquire_cancels_pending_release() {
        let (storage, _kv) = storage_with(CacheOpts::node().with_cache_time(Duration::from_millis(50)));
        let (object, _) = storage.store_if_absent(counter(1, 1)).unwrap();
        drop(object);
        assert_eq!(storage.inner.pool.pending(), 1);

        let again = storage.load(&key(1)).unwrap().unwrap();
        assert_eq!(storage.inner.pool.pending(), 0);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(storage.cached_len(), 1);
        assert_eq!(again.get().count, 1);
    }

    #[test]
    fn test_delayed_release_persists_dirty_object_once() {
        let (storage, kv) = storage_with(short_cache().with_store_on_creation(false));
        let (object, _) = storage.store_if_absent(counter(2, 20)).unwrap();
        object.modify(|c| c.count = 21);
        drop(object);
        assert_eq!(kv.sets.load(Ordering::SeqCst), 0);

        assert!(wait_for(|| storage.cached_len() == 0));
        assert_eq!(kv.sets.load(Ordering::SeqCst), 1);
        assert_eq!(kv.get(&key(2)).unwrap(), Some(21u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_clean_object_released_without_write() {
        let (storage, kv) = storage_with(short_cache());
        kv.set(&key(4), &4u64.to_le_bytes()).unwrap();
        drop(storage.load(&key(4)).unwrap());
        assert!(wait_for(|| storage.cached_len() == 0));
        assert_eq!(kv.sets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forced_release_evicts_synchronously() {
        let (storage, kv) = storage_with(CacheOpts::node().with_store_on_creation(false));
        let (object, _) = storage.store_if_absent(counter(1, 1)).unwrap();
        object.release(true);
        assert_eq!(storage.cached_len(), 0);
        assert!(kv.has(&key(1)).unwrap());
    }

    #[test]
    fn test_zero_cache_time_evicts_on_last_release() {
        let (storage, _kv) = storage_with(CacheOpts::node().with_cache_time(Duration::ZERO));
        let (object, _) = storage.store_if_absent(counter(1, 1)).unwrap();
        drop(object);
        assert_eq!(storage.cached_len(), 0);
        assert_eq!(storage.inner.pool.pending(), 0);
    }

    #[test]
    fn test_failed_persist_is_retried_in_background() {
        let (storage, kv) = storage_with(short_cache().with_store_on_creation(false));
        kv.fail_next_sets(2);
        let (object, _) = storage.store_if_absent(counter(8, 8)).unwrap();
        drop(object);

        assert!(wait_for(|| kv.has(&key(8)).unwrap()));
        assert!(wait_for(|| storage.cached_len() == 0));
    }

    #[test]
    fn test_persist_failure_never_drops_object() {
        let (storage, kv) = storage_with(short_cache().with_store_on_creation(false));
        kv.fail_next_sets(usize::MAX);
        let (object, _) = storage.store_if_absent(counter(8, 8)).unwrap();
        drop(object);

        assert!(wait_for(|| storage.inner.pool.pending() == 0 && kv.failing_sets.load(Ordering::SeqCst) < usize::MAX - 2));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(storage.cached_len(), 1);
        let cached = storage.load(&key(8)).unwrap().unwrap();
        assert!(cached.is_dirty());
        drop(cached);

        kv.fail_next_sets(0);
        storage.flush().unwrap();
        assert_eq!(kv.get(&key(8)).unwrap(), Some(8u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_flush_reports_persist_failure() {
        let (storage, kv) = storage_with(CacheOpts::node().with_store_on_creation(false));
        let (object, _) = storage.store_if_absent(counter(1, 1)).unwrap();
        kv.fail_next_sets(1);
        assert!(storage.flush().is_err());
        assert!(object.is_dirty());
        storage.flush().unwrap();
        assert!(!object.is_dirty());
    }

    #[test]
    fn test_corrupt_value_fails_only_that_load() {
        let (storage, kv) = storage_with(short_cache());
        kv.set(&key(1), b"short").unwrap();
        kv.set(&key(2), &2u64.to_le_bytes()).unwrap();

        let err = storage.load(&key(1)).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(storage.cached_len(), 0);
        assert_eq!(storage.load(&key(2)).unwrap().unwrap().get().count, 2);
    }

    #[test]
    fn test_delete_removes_everywhere() {
        let (storage, kv) = storage_with(short_cache());
        let (object, _) = storage.store_if_absent(counter(1, 1)).unwrap();
        storage.delete(&key(1)).unwrap();

        assert!(!storage.contains(&key(1), ReadOptions::default()).unwrap());
        assert!(!storage.contains(&key(1), ReadOptions::skip_cache()).unwrap());
        assert!(!kv.has(&key(1)).unwrap());
        // an outstanding lease stays readable but is never written back
        object.modify(|c| c.count = 5);
        assert_eq!(object.get().count, 5);
        drop(object);
        storage.flush().unwrap();
        assert!(!kv.has(&key(1)).unwrap());

        storage.delete(&key(77)).unwrap();
    }

    #[test]
    fn test_contains_cache_and_store() {
        let (storage, kv) = storage_with(short_cache().with_store_on_creation(false));
        let (_object, _) = storage.store_if_absent(counter(1, 1)).unwrap();
        assert!(storage.contains(&key(1), ReadOptions::default()).unwrap());
        assert!(!storage.contains(&key(1), ReadOptions::skip_cache()).unwrap());

        kv.set(&key(2), &2u64.to_le_bytes()).unwrap();
        assert!(storage.contains(&key(2), ReadOptions::default()).unwrap());
        assert!(storage.contains(&key(2), ReadOptions::skip_cache()).unwrap());
    }

    #[test]
    fn test_store_merges_into_cached_object() {
        let (storage, kv) = storage_with(short_cache());
        let first = storage.store(counter(1, 1)).unwrap();
        let second = storage.store(counter(1, 2)).unwrap();
        assert_eq!(first.get().count, 2);
        assert!(second.is_dirty());
        drop((first, second));

        storage.flush().unwrap();
        assert_eq!(kv.get(&key(1)).unwrap(), Some(2u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_key_iteration_merges_cache_and_store() {
        let (storage, kv) = storage_with(short_cache().with_store_on_creation(false));
        kv.set(&key(1), &1u64.to_le_bytes()).unwrap();
        kv.set(&key(2), &2u64.to_le_bytes()).unwrap();
        let _cached_and_stored = storage.load(&key(2)).unwrap().unwrap();
        let (_only_cached, _) = storage.store_if_absent(counter(3, 3)).unwrap();

        let mut keys = Vec::new();
        storage
            .for_each_key_only(|k| { keys.push(k.to_vec()); true }, IteratorOptions::default())
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec![key(1), key(2), key(3)]);

        let mut stored = Vec::new();
        storage
            .for_each_key_only(|k| { stored.push(k.to_vec()); true }, IteratorOptions::skip_cache())
            .unwrap();
        assert_eq!(stored, vec![key(1), key(2)]);

        let mut visited = 0;
        storage
            .for_each_key_only(|_| { visited += 1; false }, IteratorOptions::default())
            .unwrap();
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_prefix_iteration() {
        let (storage, _kv) = storage_with(short_cache());
        for id in [0x0000_0101u32, 0x0000_0201, 0x0000_0102] {
            storage.store_if_absent(counter(id, 0)).unwrap();
        }
        let mut keys = Vec::new();
        storage
            .for_each_key_only(|k| { keys.push(k.to_vec()); true }, IteratorOptions::skip_cache().with_prefix(&[0x01]))
            .unwrap();
        assert_eq!(keys, vec![key(0x0000_0101), key(0x0000_0201)]);
    }

    #[test]
    fn test_for_each_yields_leases() {
        let (storage, kv) = storage_with(short_cache());
        kv.set(&key(1), &10u64.to_le_bytes()).unwrap();
        storage.store_if_absent(counter(2, 20)).unwrap();

        let mut total = 0;
        storage
            .for_each(|object| { total += object.get().count; true }, IteratorOptions::default())
            .unwrap();
        assert_eq!(total, 30);
    }

    #[test]
    fn test_prune_clears_cache_and_store() {
        let (storage, kv) = storage_with(short_cache());
        for id in 0..10 {
            storage.store_if_absent(counter(id, 0)).unwrap();
        }
        storage.prune().unwrap();
        assert_eq!(storage.cached_len(), 0);
        assert!(kv.inner.is_empty());
    }

    #[test]
    fn test_flush_evicts_unleased_objects() {
        let (storage, kv) = storage_with(CacheOpts::node().with_store_on_creation(false));
        let (held, _) = storage.store_if_absent(counter(1, 1)).unwrap();
        drop(storage.store_if_absent(counter(2, 2)).unwrap());
        assert_eq!(storage.cached_len(), 2);

        storage.flush().unwrap();
        assert_eq!(storage.cached_len(), 1);
        assert!(kv.has(&key(1)).unwrap());
        assert!(kv.has(&key(2)).unwrap());
        assert_eq!(storage.inner.pool.pending(), 0);
        drop(held);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_final() {
        let (storage, kv) = storage_with(CacheOpts::node().with_store_on_creation(false));
        let (held, _) = storage.store_if_absent(counter(1, 1)).unwrap();
        storage.shutdown().unwrap();
        storage.shutdown().unwrap();
        assert!(storage.is_shut_down());
        assert!(kv.has(&key(1)).unwrap());

        let err = storage.load(&key(1)).unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(storage.store_if_absent(counter(2, 2)).unwrap_err().is_invariant_violation());
        assert!(storage.flush().unwrap_err().is_invariant_violation());

        // leases outliving shutdown are released synchronously
        held.modify(|c| c.count = 3);
        drop(held);
        assert_eq!(storage.cached_len(), 0);
        assert_eq!(kv.get(&key(1)).unwrap(), Some(3u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_disabled_persistence_never_touches_store() {
        let (storage, kv) = storage_with(CacheOpts::ephemeral());
        let (object, inserted) = storage.store_if_absent(counter(1, 1)).unwrap();
        assert!(inserted);
        assert!(storage.contains(&key(1), ReadOptions::skip_cache()).unwrap());
        drop(object);
        assert!(storage.load(&key(1)).unwrap().is_none());
        storage.delete(&key(1)).unwrap();
        storage.flush().unwrap();
        storage.shutdown().unwrap();
        assert_eq!(kv.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_leak_detector_sees_every_lease() {
        let opts = short_cache().with_leak_detection(LeakDetectionOptions::enabled(2, Duration::from_secs(3600)));
        let (storage, _kv) = storage_with(opts);
        let (first, _) = storage.store_if_absent(counter(1, 1)).unwrap();
        let second = first.retain();
        assert!(storage.leak_reports().is_empty());

        let third = storage.load(&key(1)).unwrap().unwrap();
        let reports = storage.leak_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].key, key(1));
        assert_eq!(reports[0].storage, "counters");

        let leaks = storage.inner.leaks.as_ref().unwrap();
        assert_eq!(leaks.consumers_of(&key(1)), 3);
        drop((first, second, third));
        assert_eq!(leaks.consumers_of(&key(1)), 0);
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn test_unmatched_release_panics() {
        let (storage, _kv) = storage_with(short_cache());
        let (object, _) = storage.store_if_absent(counter(1, 1)).unwrap();
        let entry = Arc::clone(&object.entry);
        drop(object);
        storage.inner.release(&entry, false);
    }

    #[test]
    fn test_dropping_storage_persists_dirty_objects() {
        let kv = Arc::new(TestKvStore::default());
        {
            let storage: ObjectStorage<Counter> = ObjectStorage::new(
                "counters",
                kv.clone() as Arc<dyn KvStore>,
                CacheOpts::node().with_store_on_creation(false),
                pool(),
            )
            .unwrap();
            storage.store_if_absent(counter(1, 1)).unwrap();
        }
        assert!(kv.has(&key(1)).unwrap());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let result = ObjectStorage::<Counter>::new("bad", kv, CacheOpts::node().with_shard_count(3), pool());
        assert!(result.is_err());
    }
}
