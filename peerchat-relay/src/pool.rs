//! Fixed-size worker pool draining a FIFO task queue.
//!
//! The relay hands every accepted connection to this pool as one task. A
//! connection handler runs until its client disconnects, so the number of
//! workers is a hard ceiling on concurrent sessions; further connections
//! wait in the (unbounded) queue until a worker frees up.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errors returned by [`WorkerPool`] and [`TaskHandle`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool has been shut down and accepts no more work.
    #[error("worker pool is stopped")]
    Stopped,
    /// The task panicked while running; the worker survived.
    #[error("task panicked: {0}")]
    TaskPanicked(String),
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Queue {
    jobs: VecDeque<Job>,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Handle to the eventual result of an enqueued task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    result: mpsc::Receiver<Result<T, PoolError>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has run and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::TaskPanicked`] if the task panicked, or
    /// [`PoolError::Stopped`] if the task was dropped without running.
    pub fn join(self) -> Result<T, PoolError> {
        self.result.recv().unwrap_or(Err(PoolError::Stopped))
    }
}

/// A fixed set of worker threads executing tasks in FIFO order.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` worker threads (at least one).
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] if the OS refuses to create a thread.
    pub fn new(size: usize) -> Result<Self, PoolError> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                stopped: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("peerchat-worker-{id}"))
                .spawn(move || worker_loop(id, &worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Release the workers that did start before bailing out.
                    let pool = Self {
                        shared,
                        workers: Mutex::new(workers),
                        size,
                    };
                    pool.shutdown();
                    return Err(PoolError::Spawn(e));
                }
            }
        }
        tracing::debug!(workers = size, "worker pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Queues `task` for execution and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Stopped`] if [`WorkerPool::shutdown`] has run.
    pub fn enqueue<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                .map_err(|payload| PoolError::TaskPanicked(panic_message(payload.as_ref())));
            if let Err(PoolError::TaskPanicked(msg)) = &outcome {
                tracing::error!(panic = %msg, "task panicked, worker continues");
            }
            // The caller may have dropped its handle.
            let _ = tx.send(outcome);
        });

        {
            let mut queue = self.shared.queue.lock();
            if queue.stopped {
                return Err(PoolError::Stopped);
            }
            queue.jobs.push_back(job);
        }
        self.shared.available.notify_one();
        Ok(TaskHandle { result: rx })
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.size
    }

    /// Number of tasks waiting for a free worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Returns `true` once [`WorkerPool::shutdown`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.queue.lock().stopped
    }

    /// Stops accepting tasks and waits for every worker to exit.
    ///
    /// Tasks already queued still run; a worker busy with a long task is
    /// waited for. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        self.shared.queue.lock().stopped = true;
        self.shared.available.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("worker thread terminated abnormally");
            }
        }
        tracing::debug!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            while queue.jobs.is_empty() && !queue.stopped {
                shared.available.wait(&mut queue);
            }
            match queue.jobs.pop_front() {
                Some(job) => job,
                None => break,
            }
        };
        job();
    }
    tracing::trace!(worker = id, "worker exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
