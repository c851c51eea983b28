//! Background pool for driving lazy-cell computations.
//!
//! The pool owns a set of OS threads that poll boxed futures. A spawned
//! future is wrapped in a [`Task`] whose waker pushes the task back onto a
//! lock-free queue, so a computation only occupies a worker while it is
//! actually making progress.
//!
//! ## Thread Lifecycle
//!
//! Threads are spawned lazily up to `max_threads` when work arrives and no
//! worker is idle. Workers above `min_threads` retire after sitting idle for
//! `idle_timeout`.
//!
//! ## Shutdown
//!
//! After [`BackgroundPool::shutdown`] new spawns are rejected. Queued tasks
//! are still polled. Once the last worker has exited, any task that is woken
//! again is dropped in place instead of being queued, which runs the drop
//! glue of its future.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use futures_lite::future::Boxed;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::runtime::config::{ConfigError, PoolConfig};
use crate::runtime::Spawn;
use crate::tracing_compat::{debug, trace, warn};

/// A future scheduled on the pool.
struct Task {
    future: Mutex<Option<Boxed<()>>>,
    /// Set while the task sits in the queue.
    scheduled: AtomicBool,
    pool: Weak<PoolInner>,
}

impl Task {
    fn schedule(self: Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.pool.upgrade() {
            Some(pool) => {
                if let Err(err) = pool.enqueue(self) {
                    trace!(error = %err, "woken task dropped");
                }
            }
            None => self.abandon(),
        }
    }

    fn run(self: &Arc<Self>) {
        self.scheduled.store(false, Ordering::Release);
        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return;
        };

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {}
            Ok(Poll::Ready(())) => *slot = None,
            Err(payload) => {
                *slot = None;
                warn!(
                    error = %Error::panicked(payload.as_ref()),
                    "background task panicked"
                );
            }
        }
    }

    /// Drops the future without polling it again.
    fn abandon(&self) {
        if let Some(mut slot) = self.future.try_lock() {
            let future = slot.take();
            drop(slot);
            drop(future);
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Arc::clone(self).schedule();
    }
}

#[derive(Debug, Default)]
struct WorkerCounts {
    /// Threads running the worker loop.
    active: usize,
    /// Threads parked on the condvar.
    idle: usize,
}

struct PoolInner {
    config: PoolConfig,
    queue: SegQueue<Arc<Task>>,
    shutdown: AtomicBool,
    workers: Mutex<WorkerCounts>,
    condvar: Condvar,
    next_thread_id: AtomicUsize,
    thread_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolInner {
    /// Queues a task, starting a worker if none is idle.
    ///
    /// Fails when no worker is left to poll the task; the task's future has
    /// been dropped by then.
    fn enqueue(self: &Arc<Self>, task: Arc<Task>) -> Result<()> {
        let start_worker = {
            let mut workers = self.workers.lock();
            if self.shutdown.load(Ordering::Acquire) && workers.active == 0 {
                drop(workers);
                task.abandon();
                return Err(Error::spawn("background pool has no workers left"));
            }
            self.queue.push(task);
            if workers.idle > 0 {
                self.condvar.notify_one();
                false
            } else if workers.active < self.config.max_threads
                && !self.shutdown.load(Ordering::Acquire)
            {
                workers.active += 1;
                true
            } else {
                false
            }
        };

        if start_worker {
            if let Err(err) = self.start_worker() {
                if self.workers.lock().active == 0 {
                    return Err(err);
                }
                warn!(error = %err, "failed to start extra background worker");
            }
        }
        Ok(())
    }

    /// Starts a worker thread. The caller has already counted it as active.
    fn start_worker(self: &Arc<Self>) -> Result<()> {
        let thread_id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-worker-{}", self.config.thread_name_prefix, thread_id);
        let inner = Arc::clone(self);

        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&inner));

        match spawned {
            Ok(handle) => {
                debug!(thread = %name, "background worker started");
                self.thread_handles.lock().push(handle);
                Ok(())
            }
            Err(err) => {
                let remaining = {
                    let mut workers = self.workers.lock();
                    workers.active -= 1;
                    workers.active
                };
                if remaining == 0 {
                    // Nothing left to drain the queue.
                    while let Some(task) = self.queue.pop() {
                        task.abandon();
                    }
                }
                Err(Error::spawn(format!("failed to start worker {name}: {err}")))
            }
        }
    }
}

fn worker_loop(inner: &Arc<PoolInner>) {
    loop {
        if let Some(task) = inner.queue.pop() {
            task.run();
            continue;
        }

        let mut workers = inner.workers.lock();
        if !inner.queue.is_empty() {
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            workers.active -= 1;
            trace!(active = workers.active, "worker exiting on shutdown");
            return;
        }

        workers.idle += 1;
        let timed_out = if workers.active > inner.config.min_threads {
            inner
                .condvar
                .wait_for(&mut workers, inner.config.idle_timeout)
                .timed_out()
        } else {
            inner.condvar.wait(&mut workers);
            false
        };
        workers.idle -= 1;

        if timed_out && inner.queue.is_empty() && workers.active > inner.config.min_threads {
            workers.active -= 1;
            trace!(active = workers.active, "idle worker retired");
            return;
        }
    }
}

/// Thread pool that drives spawned futures to completion.
pub struct BackgroundPool {
    inner: Arc<PoolInner>,
}

impl BackgroundPool {
    /// Creates a pool after validating `config`.
    ///
    /// `min_threads` workers are started eagerly.
    pub fn new(config: PoolConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    pub(crate) fn from_validated(mut config: PoolConfig) -> Self {
        config.normalize();
        let min_threads = config.min_threads;
        let inner = Arc::new(PoolInner {
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(WorkerCounts::default()),
            condvar: Condvar::new(),
            next_thread_id: AtomicUsize::new(0),
            thread_handles: Mutex::new(Vec::with_capacity(config.max_threads)),
            config,
        });

        for _ in 0..min_threads {
            inner.workers.lock().active += 1;
            if let Err(err) = inner.start_worker() {
                warn!(error = %err, "failed to start minimum worker");
            }
        }

        Self { inner }
    }

    /// Returns the configuration in effect.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns the number of live worker threads.
    pub fn active_threads(&self) -> usize {
        self.inner.workers.lock().active
    }

    /// Returns the number of tasks waiting for a worker.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.len()
    }

    /// Returns `true` if the pool is shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stops accepting new tasks. Queued tasks are still polled.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _workers = self.inner.workers.lock();
        self.inner.condvar.notify_all();
    }

    /// Shuts down and waits for all workers to exit.
    ///
    /// Returns `true` if every worker exited within `timeout`.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();

        let deadline = Instant::now() + timeout;
        while self.active_threads() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            {
                let _workers = self.inner.workers.lock();
                self.inner.condvar.notify_all();
            }
            thread::sleep(Duration::from_millis(5).min(remaining));
        }

        let handles = std::mem::take(&mut *self.inner.thread_handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        true
    }
}

impl Spawn for BackgroundPool {
    fn spawn(&self, task: Boxed<()>) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::spawn("background pool is shut down"));
        }

        let task = Arc::new(Task {
            future: Mutex::new(Some(task)),
            scheduled: AtomicBool::new(true),
            pool: Arc::downgrade(&self.inner),
        });
        self.inner.enqueue(task)
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for BackgroundPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let workers = self.inner.workers.lock();
        f.debug_struct("BackgroundPool")
            .field("min_threads", &self.inner.config.min_threads)
            .field("max_threads", &self.inner.config.max_threads)
            .field("active_threads", &workers.active)
            .field("idle_threads", &workers.idle)
            .field("pending_tasks", &self.inner.queue.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
