//! Tanglestore Model: typed ledger entity stores
//!
//! Milestones and tags stored through the tanglestore object cache, plus the
//! [`Storage`] façade that puts every entity store of a node onto one shared
//! key-value store and release pool.
//!
//! # Layout
//!
//! Each entity type owns a realm of the key-value store, named by a
//! [`StorePrefix`] byte:
//! - `[0x03][index u32 LE]` → message id ++ timestamp (milestones)
//! - `[0x05][tag][message id]` → empty (tags)

pub mod error;
pub mod ids;
pub mod milestone;
pub mod prefixes;
pub mod storage;
pub mod tag;

pub use error::{ModelError, ModelResult};
pub use ids::{MessageId, MilestoneIndex, MESSAGE_ID_LENGTH};
pub use milestone::{CachedMilestone, CachedMilestones, Milestone, MilestoneStorage};
pub use prefixes::StorePrefix;
pub use storage::{Storage, StorageConfig};
pub use tag::{CachedTag, Tag, TagStorage, TAG_LENGTH};
