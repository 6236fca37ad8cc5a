//! Error types for the typed entity stores

use thiserror::Error;

use tanglestore_core::StoreError;

/// Errors returned by milestone, tag and node storage operations.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The requested entity does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// A storage configuration was rejected
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    /// The object cache or key-value store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ModelError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ModelError::NotFound(_))
    }

    /// True when a persisted value could not be decoded.
    pub fn is_corruption(&self) -> bool {
        matches!(self, ModelError::Store(err) if err.is_corruption())
    }
}

/// Result type alias for model operations
pub type ModelResult<T> = Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct_from_store_errors() {
        let missing = ModelError::NotFound("milestone 101".into());
        assert!(missing.is_not_found());
        assert_eq!(missing.to_string(), "milestone 101 not found");

        let io: ModelError = StoreError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")).into();
        assert!(!io.is_not_found());
        assert!(io.to_string().contains("disk gone"));
    }

    #[test]
    fn test_corruption_passes_through() {
        let err: ModelError = StoreError::corruption(&[1, 2], "truncated").into();
        assert!(err.is_corruption());
    }
}
