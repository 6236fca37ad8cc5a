//! Identifiers shared by the entity stores

use std::fmt;

use tanglestore_core::{StoreError, StoreResult};

/// Length of a message identifier in bytes.
pub const MESSAGE_ID_LENGTH: usize = 32;

/// Sequence number of a confirmed milestone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MilestoneIndex(pub u32);

impl MilestoneIndex {
    /// Storage key: 4 bytes, little endian.
    pub fn to_key(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Inverse of [`to_key`](Self::to_key); any other length is corruption.
    pub fn from_key(key: &[u8]) -> StoreResult<Self> {
        let bytes: [u8; 4] = key
            .try_into()
            .map_err(|_| StoreError::corruption(key, format!("milestone key must be 4 bytes, got {}", key.len())))?;
        Ok(MilestoneIndex(u32::from_le_bytes(bytes)))
    }
}

impl From<u32> for MilestoneIndex {
    fn from(index: u32) -> Self {
        MilestoneIndex(index)
    }
}

impl fmt::Display for MilestoneIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a tangle message.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub [u8; MESSAGE_ID_LENGTH]);

impl MessageId {
    /// `None` unless `bytes` is exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(MessageId)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.to_hex())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
