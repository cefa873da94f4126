//! Fair scheduling of background jobs
//!
//! A [`JobManager`] runs jobs on a fixed pool of workers. Jobs are submitted
//! to named queues; the dispatcher takes one job from each non-empty queue
//! in turn, so a queue with a large backlog cannot starve the others. Within
//! a queue, jobs run in submission order.
//!
//! ```
//! use lessor_fairshare::{Job, JobError, JobManager};
//!
//! #[derive(Debug)]
//! struct Refresh(String);
//!
//! #[async_trait::async_trait]
//! impl Job for Refresh {
//!     fn id(&self) -> &str {
//!         &self.0
//!     }
//!
//!     async fn execute(&self) -> Result<(), JobError> {
//!         Ok(())
//!     }
//!
//!     fn on_failure(&self, error: JobError) {
//!         tracing::warn!(%error, "refresh failed");
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let manager = JobManager::new("refresh", 5);
//! manager.start();
//! manager.add_job(Refresh("token-a".into()), "token-a");
//! manager.stop().await;
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Number of workers used when none is specified
pub const DEFAULT_WORKERS: usize = 5;

/// The error a job reports on failure
pub type JobError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A unit of background work
#[async_trait]
pub trait Job: fmt::Debug + Send + Sync + 'static {
    /// Identifies the job in logs
    fn id(&self) -> &str;

    /// Runs the job
    async fn execute(&self) -> Result<(), JobError>;

    /// Called with the error if [`execute`][Job::execute] fails
    fn on_failure(&self, error: JobError);
}

type BoxedJob = Box<dyn Job>;

#[derive(Default)]
struct Queues {
    by_id: HashMap<String, VecDeque<BoxedJob>>,
    order: Vec<String>,
    cursor: usize,
    total: usize,
}

impl Queues {
    fn push(&mut self, queue_id: &str, job: BoxedJob) -> usize {
        let queue = match self.by_id.get_mut(queue_id) {
            Some(queue) => queue,
            None => {
                self.order.push(queue_id.to_owned());
                self.by_id.entry(queue_id.to_owned()).or_default()
            }
        };

        queue.push_back(job);
        self.total += 1;
        queue.len()
    }

    /// Takes the next job in round-robin order
    ///
    /// A queue emptied by this call is removed; the cursor then already
    /// points at the queue that followed it.
    fn pop(&mut self) -> Option<(String, BoxedJob, usize)> {
        if self.order.is_empty() {
            return None;
        }
        if self.cursor >= self.order.len() {
            self.cursor = 0;
        }

        let queue_id = self.order[self.cursor].clone();
        let queue = self.by_id.get_mut(&queue_id)?;
        let job = queue.pop_front()?;
        let remaining = queue.len();
        self.total -= 1;

        if remaining == 0 {
            self.by_id.remove(&queue_id);
            self.order.remove(self.cursor);
        } else {
            self.cursor += 1;
        }

        Some((queue_id, job, remaining))
    }
}

struct Inner {
    name: String,
    workers: usize,
    queues: Mutex<Queues>,
    new_work: Notify,
    shutdown: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// A worker pool scheduling jobs fairly across queues
///
/// Cloning produces another handle to the same manager.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.workers)
            .field("total_jobs", &self.total_jobs())
            .finish()
    }
}

impl JobManager {
    /// Constructs a manager with `workers` workers
    ///
    /// A worker count of zero uses [`DEFAULT_WORKERS`].
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };

        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                workers,
                queues: Mutex::new(Queues::default()),
                new_work: Notify::new(),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts the dispatcher and workers
    ///
    /// Starting more than once, or after [`stop`][Self::stop], does nothing.
    pub fn start(&self) {
        if self.inner.stopped.load(Ordering::Acquire)
            || self.inner.started.swap(true, Ordering::AcqRel)
        {
            return;
        }

        tracing::debug!(
            name = %self.inner.name,
            workers = self.inner.workers,
            "starting job manager"
        );

        let (tx, rx) = mpsc::channel::<BoxedJob>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = self.inner.handles.lock();
        handles.push(tokio::spawn(dispatch(self.inner.clone(), tx)));
        for worker_id in 0..self.inner.workers {
            handles.push(tokio::spawn(work(
                worker_id,
                rx.clone(),
                self.inner.shutdown.clone(),
            )));
        }
    }

    /// Stops the dispatcher and waits for the workers to exit
    ///
    /// A job already executing is allowed to finish. Jobs still queued are
    /// dropped. Stopping more than once does nothing.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(name = %self.inner.name, "stopping job manager");
        self.inner.shutdown.cancel();

        let handles = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::error!(name = %self.inner.name, "job manager task panicked");
                }
            }
        }
    }

    /// Whether [`stop`][Self::stop] has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Enqueues `job` on the queue `queue_id`, creating it if needed
    pub fn add_job<J: Job>(&self, job: J, queue_id: &str) {
        let (len, total) = {
            let mut queues = self.inner.queues.lock();
            let len = queues.push(queue_id, Box::new(job));
            (len, queues.total)
        };

        record_lengths(queue_id, len, total);
        self.inner.new_work.notify_one();
    }

    /// Number of jobs waiting in `queue_id`
    pub fn queue_len(&self, queue_id: &str) -> usize {
        self.inner
            .queues
            .lock()
            .by_id
            .get(queue_id)
            .map_or(0, VecDeque::len)
    }

    /// Number of jobs waiting across all queues
    pub fn total_jobs(&self) -> usize {
        self.inner.queues.lock().total
    }
}

fn record_lengths(queue_id: &str, len: usize, total: usize) {
    metrics::gauge!("job_manager.queue_length", "queue_id" => queue_id.to_owned()).set(len as f64);
    metrics::gauge!("job_manager.total_jobs").set(total as f64);
}

async fn dispatch(inner: Arc<Inner>, tx: mpsc::Sender<BoxedJob>) {
    loop {
        loop {
            let next = inner.queues.lock().pop();
            let Some((queue_id, job, remaining)) = next else {
                break;
            };

            let total = inner.queues.lock().total;
            record_lengths(&queue_id, remaining, total);

            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                sent = tx.send(job) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = inner.new_work.notified() => {}
        }
    }
}

async fn work(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BoxedJob>>>,
    shutdown: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };

        let Some(job) = job else {
            tracing::trace!(worker_id, "worker exiting");
            return;
        };

        tracing::trace!(worker_id, job = job.id(), "executing job");
        if let Err(error) = job.execute().await {
            tracing::debug!(worker_id, job = job.id(), %error, "job failed");
            job.on_failure(error);
        }
    }
}
