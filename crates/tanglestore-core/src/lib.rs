//! Tanglestore Core: cached object storage for ledger nodes
//!
//! A reference-counted write-back cache that sits in front of a byte-oriented
//! key-value store and is shared by every entity type of a node.
//!
//! # Architecture
//!
//! - **Key-value stores**: [`KvStore`] trait with realm partitioning, a
//!   volatile [`MemoryKvStore`] and a WAL-backed [`DurableKvStore`]
//! - **Object storage**: [`ObjectStorage`] keeps one in-memory instance per
//!   key and hands out [`CachedObject`] leases
//! - **Release pool**: [`ReleasePool`] persists and evicts released objects
//!   after their cache time, off the caller's path
//! - **Leak detection**: [`LeakDetector`] reports leases held by too many
//!   consumers or for too long
//!
//! Domain types plug in by implementing [`Storable`] (and [`Mutable`] if they
//! may change after creation). Domain stores live in separate crates
//! (e.g. tanglestore-model).

pub mod cached_object;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod kvstore;
pub mod leak;
pub mod memory;
pub mod objectstorage;
pub mod platform_durability;
pub mod release;
pub mod storable;
pub mod wal;

// Re-export key types for convenience
pub use cached_object::CachedObject;
pub use config::{CacheOpts, LeakDetectionOptions, RetryPolicy, WalOptions};
pub use engine::DurableKvStore;
pub use error::{StoreError, StoreResult};
pub use kvstore::{with_realm, KvStore, Realm};
pub use leak::{LeakDetector, LeakKind, LeakReport};
pub use memory::MemoryKvStore;
pub use objectstorage::ObjectStorage;
pub use release::{ReleasePool, TaskId};
pub use storable::{IteratorOptions, Mutable, ReadOptions, Storable};
