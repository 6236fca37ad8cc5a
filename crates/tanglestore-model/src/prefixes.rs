//! Realm prefix assignments.
//!
//! Every entity type of a node lives in its own realm of the shared
//! key-value store, identified by a single prefix byte.

/// Prefix byte of each entity realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StorePrefix {
    Health = 0x00,
    Messages = 0x01,
    MessageMetadata = 0x02,
    Milestones = 0x03,
    Children = 0x04,
    Tags = 0x05,
    Unreferenced = 0x06,
    LedgerState = 0x07,
}

impl StorePrefix {
    pub const ALL: [StorePrefix; 8] = [
        StorePrefix::Health,
        StorePrefix::Messages,
        StorePrefix::MessageMetadata,
        StorePrefix::Milestones,
        StorePrefix::Children,
        StorePrefix::Tags,
        StorePrefix::Unreferenced,
        StorePrefix::LedgerState,
    ];

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Realm prefix for [`with_realm`](tanglestore_core::with_realm).
    pub fn realm(self) -> [u8; 1] {
        [self.as_byte()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_prefixes_unique() {
        let bytes: HashSet<u8> = StorePrefix::ALL.iter().map(|p| p.as_byte()).collect();
        assert_eq!(bytes.len(), StorePrefix::ALL.len());
    }

    #[test]
    fn test_persisted_prefix_values() {
        // changing these breaks existing databases
        assert_eq!(StorePrefix::Milestones.realm(), [0x03]);
        assert_eq!(StorePrefix::Tags.realm(), [0x05]);
    }
}
