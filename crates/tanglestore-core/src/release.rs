//! Release worker pool
//!
//! When the last lease on a cached object is dropped, the object storage does
//! not persist and evict it right away. It schedules a release task here,
//! due after the storage's cache time. A fixed set of worker threads sleeps
//! until the earliest deadline, runs due tasks, and requeues failed ones with
//! exponential backoff. One pool is shared by every object storage of a node,
//! which bounds background I/O during mass evictions.
//!
//! Tasks reference their storage weakly. A storage dropped while tasks are
//! pending simply makes those tasks no-ops.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::config::RetryPolicy;
use crate::error::{StoreError, StoreResult};

/// Identifies one scheduled release.
pub type TaskId = u64;

/// Result of running a release task.
#[derive(Debug)]
pub enum ReleaseOutcome {
    /// Done, or no longer applicable (the object was re-acquired or deleted)
    Completed,
    /// Persisting failed; the task should run again later
    Retry(StoreError),
}

/// Receiver of release tasks, implemented by object storages.
pub trait ReleaseTarget: Send + Sync {
    /// Persist-and-evict `key` if task `task` is still the one it waits for.
    fn release_scheduled(&self, key: &[u8], task: TaskId) -> ReleaseOutcome;

    /// Give up on task `task` after its retries ran out. The object must stay
    /// resident and dirty.
    fn abandon_release(&self, key: &[u8], task: TaskId, error: &StoreError);
}

struct ReleaseTask {
    target: Weak<dyn ReleaseTarget>,
    key: Vec<u8>,
    due: Instant,
    attempts: u32,
}

#[derive(Default)]
struct Queue {
    deadlines: BinaryHeap<Reverse<(Instant, TaskId)>>,
    tasks: HashMap<TaskId, ReleaseTask>,
    next_id: TaskId,
    shutdown: bool,
}

impl Queue {
    /// Pop the earliest task that is due at `now`. Heap entries whose task was
    /// cancelled or rescheduled are discarded on the way.
    fn pop_due(&mut self, now: Instant) -> Option<(TaskId, ReleaseTask)> {
        while let Some(Reverse((due, id))) = self.deadlines.peek().copied() {
            let live = self.tasks.get(&id).map_or(false, |task| task.due == due);
            if !live {
                self.deadlines.pop();
                continue;
            }
            if due > now && !self.shutdown {
                return None;
            }
            self.deadlines.pop();
            return self.tasks.remove(&id).map(|task| (id, task));
        }
        None
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|Reverse((due, _))| *due)
    }

    fn push(&mut self, id: TaskId, task: ReleaseTask) {
        self.deadlines.push(Reverse((task.due, id)));
        self.tasks.insert(id, task);
    }
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    policy: RetryPolicy,
}

/// Fixed-size pool of release workers.
pub struct ReleasePool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_count: usize,
}

impl ReleasePool {
    /// Spawn `worker_count` workers named `tanglestore-release-{i}`.
    pub fn new(worker_count: usize, policy: RetryPolicy) -> StoreResult<Self> {
        if worker_count == 0 {
            return Err(StoreError::InvariantViolation("release pool needs at least one worker".into()));
        }
        policy.validate().map_err(StoreError::InvariantViolation)?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
            policy,
        });

        let pool = Self { shared, workers: Mutex::new(Vec::with_capacity(worker_count)), worker_count };
        for i in 0..worker_count {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("tanglestore-release-{}", i))
                .spawn(move || worker_loop(shared))
                .map_err(|e| StoreError::Io {
                    path: None,
                    kind: e.kind(),
                    message: format!("failed to spawn release worker: {}", e),
                })?;
            pool.workers.lock().push(handle);
        }
        debug!(workers = worker_count, "release pool started");
        Ok(pool)
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Run a release of `key` on `target` once `after` has elapsed.
    pub fn schedule(&self, target: Weak<dyn ReleaseTarget>, key: &[u8], after: Duration) -> StoreResult<TaskId> {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(StoreError::InvariantViolation("release pool is shut down".into()));
        }
        let id = queue.next_id;
        queue.next_id += 1;
        let due = Instant::now() + after;
        let wake = queue.next_deadline().map_or(true, |earliest| due < earliest);
        queue.push(id, ReleaseTask { target, key: key.to_vec(), due, attempts: 0 });
        drop(queue);

        if wake {
            self.shared.wakeup.notify_one();
        }
        trace!(task = id, key = %hex::encode(key), ?after, "release scheduled");
        Ok(id)
    }

    /// Drop a pending task. Returns false if it already started or never existed.
    pub fn cancel(&self, task: TaskId) -> bool {
        // the stale heap entry is skipped by pop_due
        self.shared.queue.lock().tasks.remove(&task).is_some()
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Run every remaining task immediately, then stop and join the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
        }
        self.shared.wakeup.notify_all();

        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            // the last storage may be dropped by a worker running its task
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("release worker panicked");
            }
        }
        debug!("release pool stopped");
    }
}

impl Drop for ReleasePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReleasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleasePool")
            .field("workers", &self.worker_count)
            .field("pending", &self.pending())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut queue = shared.queue.lock();
    loop {
        if let Some((id, task)) = queue.pop_due(Instant::now()) {
            let stopping = queue.shutdown;
            drop(queue);
            let retry = run_task(&shared.policy, id, task, stopping);
            queue = shared.queue.lock();
            if let Some(task) = retry {
                queue.push(id, task);
                shared.wakeup.notify_one();
            }
            continue;
        }

        if queue.shutdown {
            return;
        }
        match queue.next_deadline() {
            Some(deadline) => {
                shared.wakeup.wait_until(&mut queue, deadline);
            }
            None => shared.wakeup.wait(&mut queue),
        }
    }
}

/// Run one task; returns it back when it has to be retried.
fn run_task(policy: &RetryPolicy, id: TaskId, mut task: ReleaseTask, stopping: bool) -> Option<ReleaseTask> {
    let Some(target) = task.target.upgrade() else {
        return None;
    };

    match target.release_scheduled(&task.key, id) {
        ReleaseOutcome::Completed => None,
        ReleaseOutcome::Retry(err) => {
            task.attempts += 1;
            if stopping || task.attempts >= policy.max_attempts {
                error!(
                    task = id,
                    key = %hex::encode(&task.key),
                    attempts = task.attempts,
                    %err,
                    "giving up on release, object stays resident and dirty"
                );
                target.abandon_release(&task.key, id, &err);
                return None;
            }
            let backoff = policy.backoff(task.attempts);
            warn!(
                task = id,
                key = %hex::encode(&task.key),
                attempt = task.attempts,
                ?backoff,
                %err,
                "release failed, retrying"
            );
            task.due = Instant::now() + backoff;
            Some(task)
        }
    }
}
