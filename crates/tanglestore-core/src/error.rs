//! Error types for tanglestore operations
//!
//! All store errors are represented by the StoreError enum. Engine-level
//! variants carry file/offset context for recovery diagnostics; object
//! storage variants carry the affected key.
//!
//! "Not found" is not an error at this layer: lookups return `Option`.

use std::path::PathBuf;

use thiserror::Error;

/// Tanglestore error types with detailed context.
///
/// `Clone` so that a single failed load can be reported to every caller
/// waiting on the same in-flight key.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", .path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// WAL file is corrupted and cannot be recovered
    #[error("WAL corrupted in {} at offset {offset}: {reason}", .path.display())]
    WalCorrupted {
        /// Path to the corrupted WAL file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error("Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted data
        offset: u64,
    },

    /// Torn write detected (partial write at end of file)
    #[error("Torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", .path.display())]
    TornWrite {
        /// File with torn write
        path: PathBuf,
        /// Expected entry size
        expected_size: u32,
        /// Actual bytes available
        available_bytes: u64,
        /// Offset where torn write begins
        offset: u64,
    },

    /// Magic bytes not found at expected location
    #[error("Magic bytes not found in {} at offset {offset}: found {}", .path.display(), hex::encode(.found_bytes))]
    NoMagicFound {
        /// File being read
        path: PathBuf,
        /// Offset where magic was expected
        offset: u64,
        /// Bytes actually found
        found_bytes: [u8; 4],
    },

    /// Entry size exceeds maximum allowed
    #[error("Entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized entry
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: String,
    },

    /// A stored value could not be decoded into its entity type
    #[error("corrupt entry {}: {reason}", hex::encode(.key))]
    Corruption {
        /// Realm-relative key of the entry
        key: Vec<u8>,
        /// What the decoder rejected
        reason: String,
    },

    /// A caller broke the storage contract (e.g. used a shut down storage)
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl StoreError {
    /// Build a `Corruption` error for `key`.
    pub fn corruption(key: &[u8], reason: impl Into<String>) -> Self {
        StoreError::Corruption { key: key.to_vec(), reason: reason.into() }
    }

    /// True for errors caused by malformed persisted data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corruption { .. }
                | StoreError::WalCorrupted { .. }
                | StoreError::ChecksumMismatch { .. }
                | StoreError::NoMagicFound { .. }
        )
    }

    /// True for caller bugs rather than data or I/O faults.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, StoreError::InvariantViolation(_))
    }
}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for tanglestore operations
pub type StoreResult<T> = Result<T, StoreError>;
