//! # Background Workers
//!
//! A resizable pool of named OS threads fed by one unbounded crossbeam
//! channel, plus the two signals every producer loop waits on
//! ([`StopLatch`] and [`WakeSignal`]).
//!
//! ## Pool lifecycle
//!
//! - `submit` queues a boxed closure; any idle worker picks it up.
//! - `resize` spawns extra workers, or queues one retire message per
//!   surplus worker. Retire messages sit behind already queued jobs, so
//!   shrinking never drops work.
//! - `shutdown` drops the sender: workers drain the remaining queue, then
//!   exit and are joined. Later submissions fail with
//!   [`WorkerError::ShutDown`].
//!
//! A panicking job is caught and logged; the worker thread survives.

mod signal;


pub use signal::{StopLatch, Wake, WakeSignal};

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info};

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errors returned by [`WorkerPool`] operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The pool no longer accepts work.
    #[error("worker pool {0} is shut down")]
    ShutDown(String),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

enum Message {
    Run(Job),
    Retire,
}

#[derive(Debug, Default)]
struct PoolStats {
    queued: AtomicUsize,
    active: AtomicUsize,
}

/// Fixed-size thread pool that can be resized between rounds.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Message>>>,
    receiver: Receiver<Message>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: AtomicUsize,
    next_id: AtomicUsize,
    stats: Arc<PoolStats>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.threads())
            .field("queued", &self.queued())
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawns `threads` workers named `{name}-{id}`.
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self, WorkerError> {
        let (sender, receiver) = crossbeam::channel::unbounded::<Message>();
        let pool = Self {
            name: name.into(),
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Vec::with_capacity(threads)),
            threads: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            stats: Arc::new(PoolStats::default()),
        };
        pool.resize(threads)?;
        info!(pool = %pool.name, threads, "worker pool started");
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target worker count.
    pub fn threads(&self) -> usize {
        self.threads.load(Ordering::Acquire)
    }

    /// Jobs submitted but not yet picked up.
    pub fn queued(&self) -> usize {
        self.stats.queued.load(Ordering::Acquire)
    }

    /// Jobs currently running.
    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::Acquire)
    }

    /// Queues `job` for execution.
    ///
    /// On failure the job is dropped without running, which releases
    /// anything it owns.
    pub fn submit(&self, job: Job) -> Result<(), WorkerError> {
        let guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = guard.as_ref() else {
            return Err(WorkerError::ShutDown(self.name.clone()));
        };
        self.stats.queued.fetch_add(1, Ordering::AcqRel);
        if sender.send(Message::Run(job)).is_err() {
            self.stats.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(WorkerError::ShutDown(self.name.clone()));
        }
        Ok(())
    }

    /// Grows or shrinks the pool to `threads` workers (at least one).
    pub fn resize(&self, threads: usize) -> Result<(), WorkerError> {
        let threads = threads.max(1);
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(WorkerError::ShutDown(self.name.clone()));
        };
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        workers.retain(|handle| !handle.is_finished());

        let current = self.threads();
        if threads > current {
            for _ in current..threads {
                workers.push(self.spawn_worker()?);
                self.threads.fetch_add(1, Ordering::AcqRel);
            }
        } else {
            for _ in threads..current {
                if sender.send(Message::Retire).is_err() {
                    break;
                }
                self.threads.fetch_sub(1, Ordering::AcqRel);
            }
        }
        if threads != current {
            debug!(pool = %self.name, from = current, to = threads, "worker pool resized");
        }
        Ok(())
    }

    /// Stops accepting work, drains the queue and joins every worker.
    /// Calling it more than once is harmless.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(sender) = sender else {
            return;
        };
        // Drop sender → workers drain remaining jobs then exit.
        drop(sender);

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for worker in workers {
            let _ = worker.join();
        }
        self.threads.store(0, Ordering::Release);
        info!(pool = %self.name, "worker pool stopped");
    }

    fn spawn_worker(&self) -> Result<JoinHandle<()>, WorkerError> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let rx = self.receiver.clone();
        let stats = Arc::clone(&self.stats);
        let pool = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("{pool}-{id}"))
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    let job = match message {
                        Message::Run(job) => job,
                        Message::Retire => break,
                    };
                    stats.queued.fetch_sub(1, Ordering::AcqRel);
                    stats.active.fetch_add(1, Ordering::AcqRel);
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(pool = %pool, worker = id, "background job panicked");
                    }
                    stats.active.fetch_sub(1, Ordering::AcqRel);
                }
            })?;
        Ok(handle)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns a named producer thread.
pub(crate) fn spawn_named<F>(name: impl Into<String>, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.into()).spawn(f)
}
