//! The worker pool and the parameters handed to every running job.
//!
//! The pool drains a multi-producer job queue with bounded parallelism.
//! Batch operations submit sub-jobs back into the same queue through
//! [`WorkerParams::queue`]; the outstanding-job count is what tells the pool
//! when the whole tree has drained.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::dispatch;
use crate::error::JobError;
use crate::job::Job;
use crate::stats::Stats;
use crate::store::ObjectStore;

/// Callback invoked by the `Abort` operation with the parsed exit code.
pub type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

/// The send side of the pool's job queue. Submitting is safe from any task.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    outstanding: Arc<AtomicUsize>,
}

impl JobQueue {
    pub(crate) fn unbounded() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                outstanding: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    pub fn submit(&self, job: Job) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        // the send only fails once the pool is gone; the job is then dropped
        if self.tx.send(job).is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn done(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Everything a job receives at execution time.
#[derive(Clone)]
pub struct WorkerParams {
    pub cancel: CancellationToken,
    pub store: Arc<dyn ObjectStore>,
    pub stats: Arc<Stats>,
    /// Configured multipart chunk size for uploads, in bytes.
    pub chunk_size_bytes: u64,
    pub queue: JobQueue,
    pub exit_fn: Option<ExitFn>,
}

impl std::fmt::Debug for WorkerParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerParams")
            .field("chunk_size_bytes", &self.chunk_size_bytes)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("has_exit_fn", &self.exit_fn.is_some())
            .finish()
    }
}

/// Runs one job to completion: dispatch, report, notify, queue successors.
/// Acceptable errors take the success path for notification and successor
/// scheduling.
pub(crate) async fn execute(mut job: Job, params: &WorkerParams) {
    tracing::debug!("running job: {}", &job);
    let result = dispatch::run(&job, params).await;
    let success = match &result {
        Ok(()) => {
            job.report_ok(None);
            true
        }
        Err(JobError::Acceptable(err)) => {
            job.report_ok(Some(err));
            true
        }
        Err(err) => {
            job.report_err(err);
            false
        }
    };
    job.notify(&params.cancel, success).await;
    if let Some(next) = job.take_next(success) {
        params.queue.submit(*next);
    }
}

pub struct WorkerPool {
    rx: mpsc::UnboundedReceiver<Job>,
    queue: JobQueue,
    params: WorkerParams,
    num_workers: usize,
}

impl WorkerPool {
    /// Builds a pool over `store`. Submit root jobs through [`Self::queue`]
    /// before calling [`Self::run`]; the run ends once every submitted job
    /// (sub-jobs and successors included) has finished.
    pub fn new(
        config: &PoolConfig,
        store: Arc<dyn ObjectStore>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        config.validate().map_err(anyhow::Error::msg)?;
        let (queue, rx) = JobQueue::unbounded();
        let params = WorkerParams {
            cancel,
            store,
            stats: Arc::new(Stats::new()),
            chunk_size_bytes: config.chunk_size.0,
            queue: queue.clone(),
            exit_fn: None,
        };
        Ok(Self {
            rx,
            queue,
            params,
            num_workers: config.effective_workers(),
        })
    }

    /// Installs the process-exit callback the `Abort` operation invokes.
    #[must_use]
    pub fn with_exit_fn(mut self, exit_fn: ExitFn) -> Self {
        self.params.exit_fn = Some(exit_fn);
        self
    }

    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.params.stats.clone()
    }

    /// A copy of the parameters jobs run with, for driving the dispatcher
    /// directly without scheduling.
    pub fn worker_params(&self) -> WorkerParams {
        self.params.clone()
    }

    /// Drains the queue until no job is outstanding. On cancellation the
    /// pool stops dispatching; queued jobs are discarded and running jobs
    /// finish on their own cancellation checks.
    pub async fn run(mut self) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.num_workers));
        let mut join_set = tokio::task::JoinSet::new();
        loop {
            if self.queue.outstanding() == 0 && join_set.is_empty() {
                break;
            }
            tokio::select! {
                maybe_job = self.rx.recv() => {
                    let Some(job) = maybe_job else { break };
                    if self.params.cancel.is_cancelled() {
                        self.queue.done();
                        continue;
                    }
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let params = self.params.clone();
                    let queue = self.queue.clone();
                    join_set.spawn(async move {
                        let _permit = permit;
                        execute(job, &params).await;
                        queue.done();
                    });
                }
                Some(_) = join_set.join_next(), if !join_set.is_empty() => {}
            }
        }
        while join_set.join_next().await.is_some() {}
    }
}
