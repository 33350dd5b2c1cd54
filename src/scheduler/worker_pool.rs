//! Bounded worker pool with one dedicated thread per worker.
//!
//! Each worker owns its own stateful [`Worker`] value for its whole
//! lifetime, so worker state never needs locking. Submissions go through a
//! single bounded queue; every accepted item yields a [`TaskHandle`] from
//! which the caller later retrieves the result.
//!
//! # Features
//!
//! - Admission policies when the queue is full ([`PushPolicy`])
//! - Admission toggle (`set_accept_push`) that leaves queued work untouched
//! - Panics inside a task are captured and delivered through the handle
//! - `stop` hands the worker values back so their state can be inspected
//! - Pool statistics tracking

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;

/// A stateful task body run by one pool thread.
pub trait Worker: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn process(&mut self, input: Self::Input) -> Self::Output;
}

/// What `push` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPolicy {
    /// Fail immediately with `PoolError::QueueFull`.
    ThrowIfFull,
    /// Suspend the caller until a slot frees up.
    BlockIfFull,
    /// Discard the item; `push` returns `Ok(None)`.
    DropIfFull,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum number of queued plus executing items.
    pub max_queue_size: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_queue_size: usize::MAX,
            thread_name_prefix: "pool-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            ..Default::default()
        }
    }

    /// Sets the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing a task.
    pub running: usize,
    /// Number of items waiting in the queue.
    pub queued: usize,
    /// Current queue bound.
    pub max_queue_size: usize,
    /// Tasks that returned normally.
    pub tasks_completed: u64,
    /// Tasks that panicked.
    pub tasks_panicked: u64,
    /// Items discarded under `PushPolicy::DropIfFull`.
    pub tasks_dropped: u64,
    /// Average task execution time.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks executed (completed + panicked).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_panicked
    }

    /// Returns the panic rate as a percentage.
    pub fn panic_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_panicked as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_panicked: AtomicU64,
    tasks_dropped: AtomicU64,
    total_duration_us: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            tasks_dropped: AtomicU64::new(0),
            total_duration_us: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    fn record_panic(&self, duration: Duration) {
        self.tasks_panicked.fetch_add(1, Ordering::SeqCst);
        self.total_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    fn record_drop(&self) {
        self.tasks_dropped.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self, num_workers: usize, running: usize, queued: usize, max_queue_size: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let panicked = self.tasks_panicked.load(Ordering::SeqCst);
        let total_duration_us = self.total_duration_us.load(Ordering::SeqCst);

        let total = completed + panicked;
        let average = if total > 0 {
            Duration::from_micros(total_duration_us / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            running,
            queued,
            max_queue_size,
            tasks_completed: completed,
            tasks_panicked: panicked,
            tasks_dropped: self.tasks_dropped.load(Ordering::SeqCst),
            average_task_duration: average,
        }
    }
}

type TaskResult<O> = Result<O, PoolError>;

struct Job<I, O> {
    input: I,
    tx: oneshot::Sender<TaskResult<O>>,
}

struct QueueState<I, O> {
    queue: VecDeque<Job<I, O>>,
    running: usize,
    max_queue_size: usize,
    accept_push: bool,
    started: bool,
    stopping: bool,
}

impl<I, O> QueueState<I, O> {
    fn occupancy(&self) -> usize {
        self.queue.len() + self.running
    }
}

struct Shared<I, O> {
    state: Mutex<QueueState<I, O>>,
    work_available: Condvar,
    space_available: Condvar,
    stats: SharedPoolStats,
}

impl<I, O> Shared<I, O> {
    fn lock(&self) -> MutexGuard<'_, QueueState<I, O>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the result of one submitted item.
///
/// Poll it without blocking through [`TaskHandle::try_take`], block on it
/// with [`TaskHandle::wait`], or `.await` it.
#[derive(Debug)]
pub struct TaskHandle<O> {
    rx: oneshot::Receiver<TaskResult<O>>,
}

impl<O> TaskHandle<O> {
    /// Takes the result if the task has finished.
    ///
    /// Returns `Some(Err(PoolError::Cancelled))` if the item was discarded
    /// before it ran, or if the result was already taken.
    pub fn try_take(&mut self) -> Option<TaskResult<O>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PoolError::Cancelled)),
        }
    }

    /// Blocks the current thread until the result is available.
    ///
    /// Must not be called from within an async runtime; `.await` the handle
    /// there instead.
    pub fn wait(self) -> TaskResult<O> {
        self.rx.blocking_recv().unwrap_or(Err(PoolError::Cancelled))
    }
}

impl<O> Future for TaskHandle<O> {
    type Output = TaskResult<O>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(PoolError::Cancelled)))
    }
}

/// Bounded pool of dedicated worker threads.
pub struct WorkerPool<W: Worker> {
    config: WorkerPoolConfig,
    shared: Arc<Shared<W::Input, W::Output>>,
    idle_workers: Vec<W>,
    handles: Vec<JoinHandle<W>>,
    num_workers: usize,
}

impl<W: Worker> WorkerPool<W> {
    /// Creates an empty pool. Workers are added with [`WorkerPool::add_worker`].
    pub fn new(config: WorkerPoolConfig) -> Self {
        let state = QueueState {
            queue: VecDeque::new(),
            running: 0,
            max_queue_size: config.max_queue_size,
            accept_push: false,
            started: false,
            stopping: false,
        };
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                work_available: Condvar::new(),
                space_available: Condvar::new(),
                stats: SharedPoolStats::new(),
            }),
            idle_workers: Vec::new(),
            handles: Vec::new(),
            num_workers: 0,
        }
    }

    /// Registers a worker; it gets its own thread at `start`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` once the pool has started.
    pub fn add_worker(&mut self, worker: W) -> Result<(), PoolError> {
        if self.shared.lock().started {
            return Err(PoolError::AlreadyRunning);
        }
        self.idle_workers.push(worker);
        self.num_workers += 1;
        Ok(())
    }

    /// Spawns one thread per registered worker.
    ///
    /// Admission stays closed until [`WorkerPool::set_accept_push`] opens it.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if started twice,
    /// `PoolError::NoWorkers` without workers, and `PoolError::SpawnFailed`
    /// if the OS refuses a thread.
    pub fn start(&mut self) -> Result<(), PoolError> {
        {
            let mut state = self.shared.lock();
            if state.started {
                return Err(PoolError::AlreadyRunning);
            }
            if self.idle_workers.is_empty() {
                return Err(PoolError::NoWorkers);
            }
            state.started = true;
        }

        for (index, worker) in self.idle_workers.drain(..).enumerate() {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.config.thread_name_prefix, index))
                .spawn(move || worker_loop(worker, shared, index))
                .map_err(PoolError::SpawnFailed)?;
            self.handles.push(handle);
        }

        info!(num_workers = self.num_workers, "Worker pool started");
        Ok(())
    }

    /// Submits one item.
    ///
    /// Returns `Ok(None)` only under `PushPolicy::DropIfFull` when the item
    /// was discarded.
    ///
    /// # Errors
    ///
    /// - `PoolError::NotRunning` before `start` or after `stop`
    /// - `PoolError::NotAccepting` while admission is closed
    /// - `PoolError::QueueFull` under `PushPolicy::ThrowIfFull`
    pub fn push(
        &self,
        policy: PushPolicy,
        input: W::Input,
    ) -> Result<Option<TaskHandle<W::Output>>, PoolError> {
        let mut state = self.shared.lock();
        loop {
            if !state.started || state.stopping {
                return Err(PoolError::NotRunning);
            }
            if !state.accept_push {
                return Err(PoolError::NotAccepting);
            }
            if state.occupancy() < state.max_queue_size {
                break;
            }
            match policy {
                PushPolicy::ThrowIfFull => {
                    return Err(PoolError::QueueFull {
                        capacity: state.max_queue_size,
                    })
                }
                PushPolicy::DropIfFull => {
                    self.shared.stats.record_drop();
                    debug!(capacity = state.max_queue_size, "Queue full, dropping item");
                    return Ok(None);
                }
                PushPolicy::BlockIfFull => {
                    state = self
                        .shared
                        .space_available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        state.queue.push_back(Job { input, tx });
        drop(state);
        self.shared.work_available.notify_one();

        Ok(Some(TaskHandle { rx }))
    }

    /// Bounds the number of queued plus executing items.
    pub fn set_max_queue_size(&self, max_queue_size: usize) {
        self.shared.lock().max_queue_size = max_queue_size;
        self.shared.space_available.notify_all();
    }

    pub fn max_queue_size(&self) -> usize {
        self.shared.lock().max_queue_size
    }

    /// Opens or closes admission. Queued and executing items are unaffected.
    pub fn set_accept_push(&self, accept: bool) {
        self.shared.lock().accept_push = accept;
        // Blocked pushers re-check admission.
        self.shared.space_available.notify_all();
    }

    pub fn accepts_push(&self) -> bool {
        self.shared.lock().accept_push
    }

    /// Capacity minus current occupancy (queued plus executing).
    pub fn free_slots(&self) -> usize {
        let state = self.shared.lock();
        state.max_queue_size.saturating_sub(state.occupancy())
    }

    /// Whether any item is queued or executing.
    pub fn active(&self) -> bool {
        self.shared.lock().occupancy() > 0
    }

    /// Number of workers currently executing an item.
    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    /// Number of items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn is_running(&self) -> bool {
        let state = self.shared.lock();
        state.started && !state.stopping
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let (running, queued, max_queue_size) = {
            let state = self.shared.lock();
            (state.running, state.queue.len(), state.max_queue_size)
        };
        self.shared
            .stats
            .snapshot(self.num_workers, running, queued, max_queue_size)
    }

    /// Stops the worker threads and hands the worker values back.
    ///
    /// With `finish_pending` queued items still run before the threads exit;
    /// otherwise they are discarded and their handles resolve to
    /// `PoolError::Cancelled`. Items already executing always complete.
    pub fn stop(&mut self, finish_pending: bool) -> Result<Vec<W>, PoolError> {
        let discarded = {
            let mut state = self.shared.lock();
            if !state.started {
                return Ok(std::mem::take(&mut self.idle_workers));
            }
            state.stopping = true;
            state.accept_push = false;
            if finish_pending {
                VecDeque::new()
            } else {
                std::mem::take(&mut state.queue)
            }
        };
        if !discarded.is_empty() {
            warn!(count = discarded.len(), "Discarding queued items on stop");
        }
        drop(discarded);

        self.shared.work_available.notify_all();
        self.shared.space_available.notify_all();

        let mut workers = Vec::with_capacity(self.handles.len());
        for (index, handle) in self.handles.drain(..).enumerate() {
            match handle.join() {
                Ok(worker) => workers.push(worker),
                Err(_) => error!(worker = index, "Worker thread panicked outside a task"),
            }
        }

        info!(num_workers = workers.len(), "Worker pool stopped");
        Ok(workers)
    }
}

impl<W: Worker> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            let _ = self.stop(false);
        }
    }
}

/// Main worker loop: pop, run, deliver, repeat until stopped and drained.
fn worker_loop<W: Worker>(mut worker: W, shared: Arc<Shared<W::Input, W::Output>>, index: usize) -> W {
    debug!(worker = index, "Worker started");

    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.running += 1;
                    break Some(job);
                }
                if state.stopping {
                    break None;
                }
                state = shared
                    .work_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some(Job { input, tx }) = job else {
            break;
        };

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.process(input)));
        let duration = start.elapsed();

        let result = match outcome {
            Ok(output) => {
                shared.stats.record_completion(duration);
                Ok(output)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(worker = index, panic = %message, "Task panicked");
                shared.stats.record_panic(duration);
                Err(PoolError::TaskPanicked(message))
            }
        };

        // Deliver before releasing the slot: once the pool reports inactive,
        // every result is already retrievable. The receiver may be gone.
        let _ = tx.send(result);

        shared.lock().running -= 1;
        shared.space_available.notify_one();
    }

    debug!(worker = index, "Worker stopped");
    worker
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
