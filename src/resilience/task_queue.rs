//! Priority background task queue: a `parking_lot::Mutex`-guarded binary
//! heap plus a `tokio::sync::Notify` to wake an idle worker pool, the same
//! bounded-work-plus-background-task shape this codebase uses for
//! per-market order processing (see `market::coordinator`), generalized
//! from a single bounded `mpsc` channel to a shared priority heap so
//! higher-priority work can jump a backlog of lower-priority tasks.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::performance::queues::{QueueRegistry, QueueSnapshot};

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(50);
    pub const HIGH: Priority = Priority(100);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Retrying,
    Dead,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with full jitter: `uniform(0, base * 2^attempt)`,
    /// capped at `max_backoff`.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_backoff.as_millis().saturating_mul(1u128 << attempt.min(20));
        let capped = exp.min(self.max_backoff.as_millis());
        let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
        Duration::from_millis(jittered as u64)
    }
}

/// Knobs for constructing a [`TaskQueue`] from configuration, kept separate
/// from [`RetryPolicy`] (a per-job, not per-queue, setting) so a config file
/// can set the worker pool size and the default retry policy new jobs get
/// when a call site doesn't pick its own.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskQueueConfig {
    pub worker_count: usize,
    pub default_max_attempts: u32,
    pub default_base_backoff_ms: u64,
    pub default_max_backoff_ms: u64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            worker_count: 2,
            default_max_attempts: retry.max_attempts,
            default_base_backoff_ms: retry.base_backoff.as_millis() as u64,
            default_max_backoff_ms: retry.max_backoff.as_millis() as u64,
        }
    }
}

impl TaskQueueConfig {
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.default_max_attempts,
            base_backoff: Duration::from_millis(self.default_base_backoff_ms),
            max_backoff: Duration::from_millis(self.default_max_backoff_ms),
        }
    }
}

type TaskFn = Box<dyn FnMut() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send>;

struct QueuedTask {
    id: TaskId,
    priority: Priority,
    enqueue_seq: u64,
    next_run: Instant,
    attempt: u32,
    retry_policy: RetryPolicy,
    run: TaskFn,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for QueuedTask {}

// BinaryHeap is a max-heap; ordering is picked so `pop()` returns the task
// that should run next: highest priority, then earliest next-run, then
// earliest enqueue-seq (oldest first).
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.next_run.cmp(&self.next_run))
            .then_with(|| other.enqueue_seq.cmp(&self.enqueue_seq))
    }
}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub dead: u64,
    pub succeeded: u64,
}

struct Shared {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    statuses: Mutex<HashMap<TaskId, TaskStatus>>,
    notify: Notify,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    dead_count: AtomicU64,
    succeeded_count: AtomicU64,
    running_count: std::sync::atomic::AtomicUsize,
    queue_name: &'static str,
    metrics: Arc<QueueRegistry>,
}

/// A bounded-concurrency pool of workers draining a shared priority heap.
pub struct TaskQueue {
    shared: Arc<Shared>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(worker_count: usize, metrics: Arc<QueueRegistry>) -> Self {
        let queue_name = "task_queue";
        metrics.register(queue_name, usize::MAX);
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            statuses: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            dead_count: AtomicU64::new(0),
            succeeded_count: AtomicU64::new(0),
            running_count: std::sync::atomic::AtomicUsize::new(0),
            queue_name,
            metrics,
        });

        let workers = (0..worker_count.max(1))
            .map(|_| {
                let shared = shared.clone();
                tokio::spawn(async move { worker_loop(shared).await })
            })
            .collect();

        Self { shared, workers }
    }

    /// Enqueue a task. `run` is invoked on every attempt; it must be
    /// idempotent since a worker crash between execution and commit can
    /// cause at-least-once re-execution.
    pub fn enqueue<F, Fut>(&self, priority: Priority, retry_policy: RetryPolicy, mut run: F) -> TaskId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let task = QueuedTask {
            id,
            priority,
            enqueue_seq: seq,
            next_run: Instant::now(),
            attempt: 0,
            retry_policy,
            run: Box::new(move || Box::pin(run())),
        };
        {
            let mut heap = self.shared.heap.lock();
            heap.push(task);
            self.shared.metrics.update_depth(self.shared.queue_name, heap.len());
        }
        self.shared.statuses.lock().insert(id, TaskStatus::Queued);
        self.shared.metrics.record_enqueue(self.shared.queue_name, self.shared.heap.lock().len(), 0);
        self.shared.notify.notify_one();
        id
    }

    /// Cancel a task if it is still queued (not yet picked up by a worker).
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut statuses = self.shared.statuses.lock();
        match statuses.get(&id) {
            Some(TaskStatus::Queued) => {
                statuses.insert(id, TaskStatus::Cancelled);
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> QueueStats {
        let statuses = self.shared.statuses.lock();
        QueueStats {
            queued: statuses.values().filter(|s| **s == TaskStatus::Queued).count(),
            running: self.shared.running_count.load(Ordering::SeqCst),
            dead: self.shared.dead_count.load(Ordering::SeqCst),
            succeeded: self.shared.succeeded_count.load(Ordering::SeqCst),
        }
    }

    pub fn queue_snapshot(&self) -> Option<QueueSnapshot> {
        self.shared.metrics.get(self.shared.queue_name)
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        for w in &self.workers {
            w.abort();
        }
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = loop {
            let popped = {
                let mut heap = shared.heap.lock();
                let ready = heap.peek().is_some_and(|t| t.next_run <= Instant::now());
                if ready { heap.pop() } else { None }
            };
            match popped {
                Some(t) => break t,
                None => shared.notify.notified().await,
            }
        };

        {
            let mut statuses = shared.statuses.lock();
            if statuses.get(&task.id).copied() == Some(TaskStatus::Cancelled) {
                continue;
            }
            statuses.insert(task.id, TaskStatus::Running);
        }
        shared.running_count.fetch_add(1, Ordering::SeqCst);

        let QueuedTask { id, priority, enqueue_seq, mut run, attempt, retry_policy, .. } = task;
        let result = run().await;
        shared.running_count.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => {
                shared.statuses.lock().insert(id, TaskStatus::Succeeded);
                shared.succeeded_count.fetch_add(1, Ordering::SeqCst);
            }
            Err(reason) => {
                let next_attempt = attempt + 1;
                if next_attempt >= retry_policy.max_attempts {
                    shared.statuses.lock().insert(id, TaskStatus::Dead);
                    shared.dead_count.fetch_add(1, Ordering::SeqCst);
                    error!(task_id = id, reason = %reason, "task moved to dead-letter after exhausting retries");
                } else {
                    let delay = retry_policy.backoff(attempt);
                    warn!(task_id = id, attempt = next_attempt, delay_ms = delay.as_millis() as u64, "retrying task");
                    shared.statuses.lock().insert(id, TaskStatus::Retrying);
                    let mut heap = shared.heap.lock();
                    heap.push(QueuedTask {
                        id,
                        priority,
                        enqueue_seq,
                        next_run: Instant::now() + delay,
                        attempt: next_attempt,
                        retry_policy,
                        run,
                    });
                }
            }
        }
        shared.notify.notify_one();
    }
}
