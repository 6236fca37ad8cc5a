//! Key-value store interface and realm partitioning
//!
//! Every engine exposes the same byte-oriented surface. Object storages never
//! see the whole keyspace: each one works on a realm, a view that prepends a
//! fixed prefix to every key and strips it again on iteration, so entity
//! types sharing one engine can never overlap.

use std::sync::Arc;

use crate::error::StoreResult;

/// Byte-oriented key-value store.
///
/// Implementations must be safe for concurrent use by every object storage
/// of a node. Iteration visits keys in lexicographic byte order and must not
/// hold internal locks while the consumer runs, so consumers may call back
/// into the store.
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Check whether `key` exists.
    fn has(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or overwrite `key`.
    fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &[u8]) -> StoreResult<()>;

    /// Visit every pair whose key starts with `prefix`.
    ///
    /// The consumer returns `false` to stop early.
    fn iterate(
        &self,
        prefix: &[u8],
        consumer: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> StoreResult<()>;

    /// Visit every key that starts with `prefix`.
    fn iterate_keys(&self, prefix: &[u8], consumer: &mut dyn FnMut(&[u8]) -> bool) -> StoreResult<()> {
        self.iterate(prefix, &mut |key, _| consumer(key))
    }

    /// Remove every key that starts with `prefix`.
    fn delete_prefix(&self, prefix: &[u8]) -> StoreResult<()> {
        let mut keys = Vec::new();
        self.iterate_keys(prefix, &mut |key| {
            keys.push(key.to_vec());
            true
        })?;
        for key in keys {
            self.delete(&key)?;
        }
        Ok(())
    }

    /// Make all previous writes durable.
    fn flush(&self) -> StoreResult<()>;
}

/// A sub-namespace of another store.
///
/// Keys passed in are relative to the realm; keys handed to iteration
/// consumers have the realm prefix stripped.
pub struct Realm {
    parent: Arc<dyn KvStore>,
    prefix: Vec<u8>,
}

impl Realm {
    /// The prefix of this realm within its parent store.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn absolute(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(key);
        full
    }
}

/// Scope `store` to the keys starting with `prefix`.
pub fn with_realm(store: Arc<dyn KvStore>, prefix: &[u8]) -> Arc<dyn KvStore> {
    Arc::new(Realm { parent: store, prefix: prefix.to_vec() })
}

impl KvStore for Realm {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.parent.get(&self.absolute(key))
    }

    fn has(&self, key: &[u8]) -> StoreResult<bool> {
        self.parent.has(&self.absolute(key))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.parent.set(&self.absolute(key), value)
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.parent.delete(&self.absolute(key))
    }

    fn iterate(
        &self,
        prefix: &[u8],
        consumer: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> StoreResult<()> {
        let strip = self.prefix.len();
        self.parent
            .iterate(&self.absolute(prefix), &mut |key, value| consumer(&key[strip..], value))
    }

    fn iterate_keys(&self, prefix: &[u8], consumer: &mut dyn FnMut(&[u8]) -> bool) -> StoreResult<()> {
        let strip = self.prefix.len();
        self.parent
            .iterate_keys(&self.absolute(prefix), &mut |key| consumer(&key[strip..]))
    }

    fn delete_prefix(&self, prefix: &[u8]) -> StoreResult<()> {
        self.parent.delete_prefix(&self.absolute(prefix))
    }

    fn flush(&self) -> StoreResult<()> {
        self.parent.flush()
    }
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("prefix", &hex::encode(&self.prefix))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKvStore;

    fn collect_keys(store: &dyn KvStore, prefix: &[u8]) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        store
            .iterate_keys(prefix, &mut |key| {
                keys.push(key.to_vec());
                true
            })
            .unwrap();
        keys
    }

    #[test]
    fn test_realm_prefixes_keys() {
        let root: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let realm = with_realm(Arc::clone(&root), &[0x03]);

        realm.set(b"a", b"1").unwrap();
        assert_eq!(root.get(&[0x03, b'a']).unwrap(), Some(b"1".to_vec()));
        assert_eq!(realm.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert!(realm.has(b"a").unwrap());
        assert!(!root.has(b"a").unwrap());
    }

    #[test]
    fn test_realms_do_not_overlap() {
        let root: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let milestones = with_realm(Arc::clone(&root), &[0x03]);
        let tags = with_realm(Arc::clone(&root), &[0x05]);

        milestones.set(b"k", b"ms").unwrap();
        tags.set(b"k", b"tag").unwrap();

        assert_eq!(milestones.get(b"k").unwrap(), Some(b"ms".to_vec()));
        assert_eq!(tags.get(b"k").unwrap(), Some(b"tag".to_vec()));
        assert_eq!(collect_keys(milestones.as_ref(), &[]), vec![b"k".to_vec()]);

        milestones.delete_prefix(&[]).unwrap();
        assert!(!milestones.has(b"k").unwrap());
        assert!(tags.has(b"k").unwrap());
    }

    #[test]
    fn test_nested_realm_strips_full_prefix() {
        let root: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let outer = with_realm(Arc::clone(&root), b"o");
        let inner = with_realm(Arc::clone(&outer), b"i");

        inner.set(b"x1", b"v").unwrap();
        inner.set(b"x2", b"v").unwrap();
        assert!(root.has(b"oix1").unwrap());
        assert_eq!(collect_keys(inner.as_ref(), b"x"), vec![b"x1".to_vec(), b"x2".to_vec()]);
        assert_eq!(collect_keys(outer.as_ref(), &[]), vec![b"ix1".to_vec(), b"ix2".to_vec()]);
    }
}
