//! Configuration for tanglestore object storages and engines
//!
//! Provides cache profiles for object storages, the release retry policy,
//! and write-ahead log options for the durable engine. All option structs
//! follow the same shape: a preset constructor, `with_*` setters and a
//! `validate()` that rejects nonsensical combinations.

use std::time::Duration;

/// Leak detection thresholds for one object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakDetectionOptions {
    /// Whether consumers are tracked at all
    pub enabled: bool,
    /// More simultaneous consumers than this on one object is reported
    pub max_consumers_per_object: usize,
    /// A single consumer holding an object longer than this is reported
    pub max_consumer_hold_time: Duration,
}

impl LeakDetectionOptions {
    /// Detection switched off, default thresholds kept for later enabling.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_consumers_per_object: 20,
            max_consumer_hold_time: Duration::from_secs(100),
        }
    }

    /// Detection switched on with the given thresholds.
    pub fn enabled(max_consumers_per_object: usize, max_consumer_hold_time: Duration) -> Self {
        Self { enabled: true, max_consumers_per_object, max_consumer_hold_time }
    }
}

impl Default for LeakDetectionOptions {
    fn default() -> Self { Self::disabled() }
}

/// Cache profile for a single object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOpts {
    /// Delay between the last release of an object and its persist-and-evict
    pub cache_time: Duration,
    /// Whether objects are read from and written to the key-value store
    pub persistence_enabled: bool,
    /// Persist synchronously when an object is first created
    pub store_on_creation: bool,
    /// Number of lock shards (power of two)
    pub shard_count: usize,
    /// Consumer leak detection
    pub leak_detection: LeakDetectionOptions,
}

impl CacheOpts {
    /// Profile used by node storages: short residency, write-through on creation.
    pub fn node() -> Self {
        Self {
            cache_time: Duration::from_secs(1),
            persistence_enabled: true,
            store_on_creation: true,
            shard_count: 64,
            leak_detection: LeakDetectionOptions::disabled(),
        }
    }

    /// Scratch profile: nothing is persisted, objects are evicted on last release.
    ///
    /// An evicted object is lost, since it was never written to the
    /// key-value store. Keep a lease for as long as the object is needed.
    pub fn ephemeral() -> Self {
        Self {
            cache_time: Duration::ZERO,
            persistence_enabled: false,
            store_on_creation: false,
            shard_count: 16,
            leak_detection: LeakDetectionOptions::disabled(),
        }
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.persistence_enabled = enabled;
        self
    }

    pub fn with_store_on_creation(mut self, enabled: bool) -> Self {
        self.store_on_creation = enabled;
        self
    }

    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_leak_detection(mut self, options: LeakDetectionOptions) -> Self {
        self.leak_detection = options;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err("shard_count must be a power of two".into());
        }
        if self.shard_count > 4096 {
            return Err("shard_count must be <= 4096".into());
        }
        if self.store_on_creation && !self.persistence_enabled {
            return Err("store_on_creation requires persistence_enabled".into());
        }
        let leak = &self.leak_detection;
        if leak.enabled {
            if leak.max_consumers_per_object == 0 {
                return Err("max_consumers_per_object must be > 0".into());
            }
            if leak.max_consumer_hold_time.is_zero() {
                return Err("max_consumer_hold_time must be > 0".into());
            }
        }
        Ok(())
    }
}

impl Default for CacheOpts {
    fn default() -> Self { Self::node() }
}

/// Retry policy for background releases whose persist failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per release before it is handed back to the storage
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further attempt
    pub base_backoff: Duration,
    /// Upper bound for a single backoff delay
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".into());
        }
        if self.base_backoff > self.max_backoff {
            return Err("base_backoff must be <= max_backoff".into());
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Write-ahead log options for the durable engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalOptions {
    /// WAL file rotation threshold (bytes)
    pub rotation_size_bytes: u64,
    /// fdatasync after every write; otherwise only on flush
    pub sync_on_write: bool,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
}

impl WalOptions {
    /// Server-class: every write durable before it is acknowledged
    pub fn durable() -> Self {
        Self {
            rotation_size_bytes: 100 * 1024 * 1024,
            sync_on_write: true,
            max_key_size: 128,
            max_value_size: 32 * 1024 * 1024,
        }
    }

    /// Batched: writes reach the OS page cache, `flush` makes them durable
    pub fn batched() -> Self {
        Self { sync_on_write: false, ..Self::durable() }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.rotation_size_bytes < 1024 * 1024 {
            return Err("rotation_size_bytes must be >= 1MB".into());
        }
        if self.max_key_size == 0 || self.max_key_size > u16::MAX as usize {
            return Err("max_key_size must be in [1, 65535]".into());
        }
        if self.max_value_size == 0 || self.max_value_size > 128 * 1024 * 1024 {
            return Err("max_value_size must be in [1, 128MB]".into());
        }
        Ok(())
    }
}

impl Default for WalOptions {
    fn default() -> Self { Self::durable() }
}
