//! Tag index storage.
//!
//! Each entry links a 16-byte tag to one message carrying it. All data lives
//! in the key (tag ++ message id); the value is empty, so looking up the
//! messages of a tag is a prefix scan.

use std::sync::Arc;

use tanglestore_core::{
    with_realm, CacheOpts, CachedObject, IteratorOptions, KvStore, ObjectStorage, ReadOptions, ReleasePool, Storable,
    StoreError, StoreResult,
};

use crate::error::ModelResult;
use crate::ids::{MessageId, MESSAGE_ID_LENGTH};
use crate::prefixes::StorePrefix;

/// Length of a tag in bytes.
pub const TAG_LENGTH: usize = 16;

const KEY_LENGTH: usize = TAG_LENGTH + MESSAGE_ID_LENGTH;

/// Association of a tag with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub tag: [u8; TAG_LENGTH],
    pub message_id: MessageId,
}

impl Storable for Tag {
    fn storage_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(KEY_LENGTH);
        key.extend_from_slice(&self.tag);
        key.extend_from_slice(self.message_id.as_bytes());
        key
    }

    fn storage_value(&self) -> Vec<u8> {
        Vec::new()
    }

    fn from_storage(key: &[u8], value: &[u8]) -> StoreResult<Self> {
        if key.len() != KEY_LENGTH {
            return Err(StoreError::corruption(
                key,
                format!("tag key must be {} bytes, got {}", KEY_LENGTH, key.len()),
            ));
        }
        if !value.is_empty() {
            return Err(StoreError::corruption(key, format!("tag value must be empty, got {} bytes", value.len())));
        }
        let (tag, id) = key.split_at(TAG_LENGTH);
        let tag: [u8; TAG_LENGTH] = tag.try_into().map_err(|_| StoreError::corruption(key, "bad tag"))?;
        let message_id = MessageId::from_slice(id).ok_or_else(|| StoreError::corruption(key, "bad message id"))?;
        Ok(Tag { tag, message_id })
    }
}

/// A lease on a cached tag entry.
pub type CachedTag = CachedObject<Tag>;

/// Typed façade over the tag object storage.
#[derive(Debug, Clone)]
pub struct TagStorage {
    objects: ObjectStorage<Tag>,
}

impl TagStorage {
    pub fn new(kv: Arc<dyn KvStore>, opts: CacheOpts, pool: Arc<ReleasePool>) -> ModelResult<Self> {
        let realm = with_realm(kv, &StorePrefix::Tags.realm());
        Ok(Self { objects: ObjectStorage::new("tags", realm, opts, pool)? })
    }

    /// Record that `message_id` carries `tag`.
    pub fn store_tag_if_absent(&self, tag: [u8; TAG_LENGTH], message_id: MessageId) -> ModelResult<(CachedTag, bool)> {
        Ok(self.objects.store_if_absent(Tag { tag, message_id })?)
    }

    pub fn contains_tag(&self, tag: &[u8; TAG_LENGTH], message_id: &MessageId, options: ReadOptions) -> ModelResult<bool> {
        let key = Tag { tag: *tag, message_id: *message_id }.storage_key();
        Ok(self.objects.contains(&key, options)?)
    }

    /// Messages carrying `tag`, at most `max` of them.
    pub fn tag_message_ids(&self, tag: &[u8; TAG_LENGTH], max: Option<usize>) -> ModelResult<Vec<MessageId>> {
        let limit = max.unwrap_or(usize::MAX);
        let mut ids = Vec::new();
        if limit == 0 {
            return Ok(ids);
        }
        let mut failure = None;
        self.objects.for_each_key_only(
            |key| {
                match MessageId::from_slice(&key[TAG_LENGTH.min(key.len())..]) {
                    Some(id) => ids.push(id),
                    None => {
                        failure = Some(StoreError::corruption(key, "bad tag key"));
                        return false;
                    }
                }
                ids.len() < limit
            },
            IteratorOptions::default().with_prefix(tag),
        )?;
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(ids),
        }
    }

    pub fn delete_tag(&self, tag: &[u8; TAG_LENGTH], message_id: &MessageId) -> ModelResult<()> {
        let key = Tag { tag: *tag, message_id: *message_id }.storage_key();
        Ok(self.objects.delete(&key)?)
    }

    pub fn flush(&self) -> ModelResult<()> {
        Ok(self.objects.flush()?)
    }

    pub fn shutdown(&self) -> ModelResult<()> {
        Ok(self.objects.shutdown()?)
    }

    /// Number of cached tag entries.
    pub fn tag_storage_size(&self) -> usize {
        self.objects.cached_len()
    }
}
