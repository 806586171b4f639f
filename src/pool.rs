//! Bounded worker pool.
//!
//! A fixed queue feeds a small set of threads through a shared
//! receiver. The queue bound is the server's admission control: when it
//! is full, `submit` refuses immediately instead of letting work pile
//! up without limit. The pool grows toward `max_workers` under load and
//! never shrinks; idle threads blocked on `recv` are cheap enough that
//! reaping them is not worth the churn.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::ServerConfig;

struct Task {
    id: u64,
    queued_at: Instant,
    /// A task that sat queued longer than this is skipped unexecuted;
    /// the client it belongs to has long since timed out. `None` means
    /// the task never goes stale.
    max_queue_wait: Option<Duration>,
    job: Box<dyn FnOnce() + Send + 'static>,
}

enum QueueItem {
    Work(Task),
    Stop,
}

/// Counters shared between the pool handle and its worker threads.
struct PoolShared {
    receiver: Mutex<Receiver<QueueItem>>,
    shutting_down: AtomicBool,
    /// Forced shutdown: workers drop dequeued tasks instead of running
    /// them. Draining through the workers avoids touching the receiver
    /// from outside while an idle worker is parked in `recv` holding
    /// its lock.
    discard: AtomicBool,
    workers: AtomicUsize,
    pending: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    next_task_id: AtomicU64,
    next_worker_id: AtomicUsize,
}

/// A point-in-time snapshot of pool counters, serializable for status
/// endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub pending: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
}

pub struct WorkerPool {
    queue: SyncSender<QueueItem>,
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    max_workers: usize,
    default_queue_wait: Duration,
}

impl WorkerPool {
    pub fn new(config: &ServerConfig) -> WorkerPool {
        WorkerPool::with_limits(
            config.min_workers,
            config.max_workers,
            config.queue_size,
            config.timeout,
        )
    }

    pub fn with_limits(
        min_workers: usize,
        max_workers: usize,
        queue_size: usize,
        max_queue_wait: Duration,
    ) -> WorkerPool {
        let (sender, receiver) = sync_channel(queue_size);
        let shared = Arc::new(PoolShared {
            receiver: Mutex::new(receiver),
            shutting_down: AtomicBool::new(false),
            discard: AtomicBool::new(false),
            workers: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            next_task_id: AtomicU64::new(1),
            next_worker_id: AtomicUsize::new(1),
        });
        let pool = WorkerPool {
            queue: sender,
            shared,
            handles: Mutex::new(Vec::new()),
            max_workers,
            default_queue_wait: max_queue_wait,
        };
        for _ in 0..min_workers {
            pool.spawn_worker();
        }
        pool
    }

    /// Queue a job without blocking. Returns false when the pool
    /// refuses it, either because the queue is full or because
    /// shutdown has begun; the caller turns that into a 503.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_stale_after(job, Some(self.default_queue_wait))
    }

    /// Like `submit`, with an explicit staleness bound for this task
    /// instead of the pool default. `None` means the task runs no
    /// matter how long it sat in the queue.
    pub fn submit_stale_after<F>(&self, job: F, max_queue_wait: Option<Duration>) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let task = self.make_task(job, max_queue_wait);
        match self.queue.try_send(QueueItem::Work(task)) {
            Ok(()) => {
                self.note_queued();
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Queue a job, waiting for room. `None` waits indefinitely, a
    /// duration bounds the wait.
    pub fn submit_within<F>(&self, job: F, wait: Option<Duration>) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let mut item = QueueItem::Work(self.make_task(job, Some(self.default_queue_wait)));
        match wait {
            None => match self.queue.send(item) {
                Ok(()) => {
                    self.note_queued();
                    true
                }
                Err(_) => false,
            },
            Some(wait) => {
                let deadline = Instant::now() + wait;
                loop {
                    match self.queue.try_send(item) {
                        Ok(()) => {
                            self.note_queued();
                            return true;
                        }
                        Err(TrySendError::Full(returned)) => {
                            if Instant::now() >= deadline {
                                return false;
                            }
                            item = returned;
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(TrySendError::Disconnected(_)) => return false,
                    }
                }
            }
        }
    }

    fn make_task<F>(&self, job: F, max_queue_wait: Option<Duration>) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            id: self.shared.next_task_id.fetch_add(1, Ordering::SeqCst),
            queued_at: Instant::now(),
            max_queue_wait,
            job: Box::new(job),
        }
    }

    fn note_queued(&self) {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        // every worker busy with work still waiting means we are behind
        let workers = self.shared.workers.load(Ordering::SeqCst);
        if self.shared.active.load(Ordering::SeqCst) >= workers {
            self.scale_up();
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.shared.workers.load(Ordering::SeqCst),
            pending: self.shared.pending.load(Ordering::SeqCst),
            active: self.shared.active.load(Ordering::SeqCst),
            completed: self.shared.completed.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
        }
    }

    fn scale_up(&self) {
        let mut handles = match self.handles.lock() {
            Ok(handles) => handles,
            Err(_) => return,
        };
        if handles.len() >= self.max_workers {
            return;
        }
        self.spawn_locked(&mut handles);
    }

    fn spawn_worker(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            self.spawn_locked(&mut handles);
        }
    }

    fn spawn_locked(&self, handles: &mut Vec<JoinHandle<()>>) {
        let shared = self.shared.clone();
        let worker_id = shared.next_worker_id.fetch_add(1, Ordering::SeqCst);
        shared.workers.fetch_add(1, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name(format!("worker-{}", worker_id))
            .spawn(move || worker_loop(shared, worker_id));
        match handle {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                self.shared.workers.fetch_sub(1, Ordering::SeqCst);
                warn!("failed to spawn worker {}: {}", worker_id, err);
            }
        }
    }

    /// Stop the pool. With `drain` the workers finish everything
    /// already queued first; without it pending tasks are dropped and
    /// counted as failed. Either way every worker gets a stop marker
    /// and is joined, bounded by `timeout` per the whole pool.
    pub fn shutdown(&self, drain: bool, timeout: Duration) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("worker pool shutting down (drain: {})", drain);
        if !drain {
            self.shared.discard.store(true, Ordering::SeqCst);
        }
        let mut handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        // stop markers queue behind any drained work, one per worker
        let deadline = Instant::now() + timeout;
        'stops: for _ in 0..handles.len() {
            loop {
                match self.queue.try_send(QueueItem::Stop) {
                    Ok(()) => continue 'stops,
                    Err(TrySendError::Full(_)) if Instant::now() < deadline => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break 'stops,
                }
            }
        }
        for handle in handles.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("a worker did not stop within the shutdown timeout");
            }
        }
        let stats = self.stats();
        info!(
            "worker pool stopped: {} completed, {} failed",
            stats.completed, stats.failed
        );
    }
}

fn worker_loop(shared: Arc<PoolShared>, worker_id: usize) {
    debug!("worker {} started", worker_id);
    loop {
        let item = {
            let receiver = match shared.receiver.lock() {
                Ok(receiver) => receiver,
                Err(_) => break,
            };
            receiver.recv()
        };
        let task = match item {
            Ok(QueueItem::Work(task)) => task,
            Ok(QueueItem::Stop) | Err(_) => break,
        };
        shared.pending.fetch_sub(1, Ordering::SeqCst);
        if shared.discard.load(Ordering::SeqCst) {
            debug!("dropping queued task {}", task.id);
            shared.failed.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        let waited = task.queued_at.elapsed();
        if task.max_queue_wait.map_or(false, |bound| waited > bound) {
            warn!(
                "task {} waited {:?} in queue, skipping it",
                task.id, waited
            );
            shared.failed.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        shared.active.fetch_add(1, Ordering::SeqCst);
        let outcome = catch_unwind(AssertUnwindSafe(task.job));
        shared.active.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                shared.completed.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => {
                shared.failed.fetch_add(1, Ordering::SeqCst);
                warn!("task {} panicked in worker {}", task.id, worker_id);
            }
        }
    }
    shared.workers.fetch_sub(1, Ordering::SeqCst);
    debug!("worker {} stopped", worker_id);
}
