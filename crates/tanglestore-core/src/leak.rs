//! Consumer leak detection
//!
//! Leases release themselves on drop, so a leak here means a lease kept
//! alive far longer than intended: stored in a long-lived structure, moved
//! into a thread that never exits, or simply forgotten. The detector tracks
//! every live lease per object and reports
//!
//! - objects held by more consumers than `max_consumers_per_object`
//! - single consumers holding an object longer than `max_consumer_hold_time`
//!
//! Each offending consumer is reported once, with the backtrace of the site
//! that acquired it. Reports are diagnostics only and never fail an operation.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::config::LeakDetectionOptions;
use crate::error::{StoreError, StoreResult};

/// Identifies one registered consumer.
pub type ConsumerId = u64;

/// What a consumer did wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeakKind {
    /// The object had `count` simultaneous consumers, more than `max`
    TooManyConsumers { count: usize, max: usize },
    /// The consumer held the object for `held`, longer than `max`
    HeldTooLong { held: Duration, max: Duration },
}

/// A probable leak.
#[derive(Debug, Clone)]
pub struct LeakReport {
    pub storage: String,
    pub key: Vec<u8>,
    pub consumer: ConsumerId,
    pub kind: LeakKind,
    /// Where the lease was acquired
    pub backtrace: String,
}

struct Consumer {
    id: ConsumerId,
    since: Instant,
    backtrace: Backtrace,
    reported: bool,
}

struct State {
    storage: String,
    options: LeakDetectionOptions,
    consumers: Mutex<HashMap<Vec<u8>, Vec<Consumer>>>,
    reports: Mutex<Vec<LeakReport>>,
    next_id: AtomicU64,
    stop: Mutex<bool>,
    stopped: Condvar,
}

impl State {
    fn report(&self, key: &[u8], consumer: &mut Consumer, kind: LeakKind) {
        consumer.reported = true;
        let backtrace = consumer.backtrace.to_string();
        warn!(
            storage = %self.storage,
            key = %hex::encode(key),
            consumer = consumer.id,
            ?kind,
            "possible lease leak, acquired at:\n{}",
            backtrace
        );
        self.reports.lock().push(LeakReport {
            storage: self.storage.clone(),
            key: key.to_vec(),
            consumer: consumer.id,
            kind,
            backtrace,
        });
    }

    fn check_hold_times(&self, now: Instant) {
        let max = self.options.max_consumer_hold_time;
        let mut consumers = self.consumers.lock();
        for (key, list) in consumers.iter_mut() {
            for consumer in list.iter_mut().filter(|c| !c.reported) {
                let held = now.saturating_duration_since(consumer.since);
                if held > max {
                    self.report(key, consumer, LeakKind::HeldTooLong { held, max });
                }
            }
        }
    }
}

/// Tracks live leases of one object storage.
pub struct LeakDetector {
    state: Arc<State>,
    monitor: Option<thread::JoinHandle<()>>,
}

impl LeakDetector {
    /// Start a detector for the storage named `storage`.
    ///
    /// Spawns a monitor thread that checks hold times a few times per
    /// `max_consumer_hold_time`.
    pub fn new(storage: &str, options: LeakDetectionOptions) -> StoreResult<Self> {
        let interval = (options.max_consumer_hold_time / 4)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        let state = Arc::new(State {
            storage: storage.to_string(),
            options,
            consumers: Mutex::new(HashMap::new()),
            reports: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stop: Mutex::new(false),
            stopped: Condvar::new(),
        });

        let monitor_state = Arc::clone(&state);
        let monitor = thread::Builder::new()
            .name(format!("tanglestore-leaks-{}", storage))
            .spawn(move || {
                let mut stop = monitor_state.stop.lock();
                while !*stop {
                    monitor_state.stopped.wait_for(&mut stop, interval);
                    if *stop {
                        break;
                    }
                    parking_lot::MutexGuard::unlocked(&mut stop, || {
                        monitor_state.check_hold_times(Instant::now())
                    });
                }
            })
            .map_err(|e| StoreError::Io {
                path: None,
                kind: e.kind(),
                message: format!("failed to spawn leak monitor: {}", e),
            })?;

        Ok(Self { state, monitor: Some(monitor) })
    }

    /// Record a new consumer of `key`.
    pub fn register(&self, key: &[u8]) -> ConsumerId {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let mut consumers = self.state.consumers.lock();
        let list = consumers.entry(key.to_vec()).or_default();
        list.push(Consumer {
            id,
            since: Instant::now(),
            backtrace: Backtrace::force_capture(),
            reported: false,
        });

        let count = list.len();
        let max = self.state.options.max_consumers_per_object;
        if count > max {
            if let Some(consumer) = list.last_mut() {
                self.state.report(key, consumer, LeakKind::TooManyConsumers { count, max });
            }
        }
        id
    }

    /// Forget consumer `id` of `key`.
    pub fn unregister(&self, key: &[u8], id: ConsumerId) {
        let mut consumers = self.state.consumers.lock();
        if let Some(list) = consumers.get_mut(key) {
            list.retain(|c| c.id != id);
            if list.is_empty() {
                consumers.remove(key);
            }
        }
    }

    /// Live consumers of `key`.
    pub fn consumers_of(&self, key: &[u8]) -> usize {
        self.state.consumers.lock().get(key).map_or(0, Vec::len)
    }

    /// Every leak reported so far.
    pub fn reports(&self) -> Vec<LeakReport> {
        self.state.reports.lock().clone()
    }

    /// Run the hold-time check now instead of waiting for the monitor.
    pub fn check_now(&self) {
        self.state.check_hold_times(Instant::now());
    }
}

impl Drop for LeakDetector {
    fn drop(&mut self) {
        *self.state.stop.lock() = true;
        self.state.stopped.notify_all();
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for LeakDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakDetector")
            .field("storage", &self.state.storage)
            .field("options", &self.state.options)
            .finish()
    }
}
