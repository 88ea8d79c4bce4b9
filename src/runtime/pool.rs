//! Bounded worker pool.
//!
//! A fixed set of named threads pull jobs from a bounded queue. Submitting
//! to a full queue blocks until a worker frees a slot.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool submission errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The pool no longer accepts work.
    ShutDown,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::ShutDown => write!(f, "Worker pool is shut down"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Cloneable handle for submitting jobs from other threads.
#[derive(Clone)]
pub struct Submitter {
    sender: Sender<Job>,
    discard: Arc<AtomicBool>,
}

impl Submitter {
    /// Queue a job, blocking while the queue is full.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.discard.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown);
        }
        self.sender
            .send(Box::new(job))
            .map_err(|_| PoolError::ShutDown)
    }
}

/// Fixed-size pool of persistent worker threads.
pub struct WorkerPool {
    submitter: Submitter,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a queue of `queue_depth` pending jobs.
    pub fn new(size: usize, queue_depth: usize) -> io::Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue_depth);
        let discard = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let receiver = receiver.clone();
            let discard = Arc::clone(&discard);

            let handle = thread::Builder::new()
                .name(format!("hermes-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver, discard))?;
            workers.push(handle);
        }

        info!(workers = size, queue_depth, "Worker pool started");

        Ok(Self {
            submitter: Submitter { sender, discard },
            workers,
        })
    }

    /// Queue a job, blocking while the queue is full.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submitter.submit(job)
    }

    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop the pool.
    ///
    /// Graceful shutdown runs every queued job and joins the workers once all
    /// submitters are gone. Forced shutdown drops queued jobs unrun and returns
    /// without waiting for jobs already in progress.
    pub fn shutdown(self, force: bool) {
        let WorkerPool { submitter, workers } = self;
        let discard = Arc::clone(&submitter.discard);
        drop(submitter);

        if force {
            discard.store(true, Ordering::Release);
            info!(workers = workers.len(), "Worker pool stopped without draining");
            return;
        }

        for handle in workers {
            if handle.join().is_err() {
                warn!("Worker panicked");
            }
        }
        info!("Worker pool drained");
    }
}

fn worker_loop(worker_id: usize, jobs: Receiver<Job>, discard: Arc<AtomicBool>) {
    for job in jobs.iter() {
        if discard.load(Ordering::Acquire) {
            debug!(worker = worker_id, "Discarding queued job");
            continue;
        }
        job();
    }
    debug!(worker = worker_id, "Worker exiting");
}
