//! Bounded, runtime-tunable executor
//!
//! A set of worker tasks pulling from one shared submission channel.
//! `tune` changes the worker count while submissions are in flight:
//! new workers are spawned directly, surplus workers are signalled and
//! exit between jobs. Submission is non-blocking; a full channel is a
//! pool-level error and the job is lost, because the dispatcher has
//! already dequeued it.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::job::{Job, JobResult};
use crate::types::{CoreError, Result};

struct WorkerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Counters shared with every worker task
#[derive(Default)]
struct Counters {
    waiting: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

pub(crate) struct Executor {
    submit_tx: mpsc::Sender<Box<dyn Job>>,
    submit_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<dyn Job>>>>,
    results_tx: mpsc::Sender<JobResult>,
    /// Worker handles plus the target they were sized to; target is
    /// written under this lock so snapshots never observe running above
    /// target.
    workers: Mutex<Vec<WorkerHandle>>,
    target: AtomicUsize,
    submitted: AtomicU64,
    rejected: AtomicU64,
    counters: Arc<Counters>,
    next_worker_id: AtomicUsize,
    cancel: CancellationToken,
}

impl Executor {
    /// `queue_bound` caps submissions waiting for a worker; `cancel`
    /// parents every worker's token.
    pub fn new(
        queue_bound: usize,
        results_tx: mpsc::Sender<JobResult>,
        cancel: CancellationToken,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(queue_bound.max(1));
        Self {
            submit_tx,
            submit_rx: Arc::new(tokio::sync::Mutex::new(submit_rx)),
            results_tx,
            workers: Mutex::new(Vec::new()),
            target: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            counters: Arc::new(Counters::default()),
            next_worker_id: AtomicUsize::new(0),
            cancel,
        }
    }

    /// Hand one job to the worker set without blocking.
    pub fn submit(&self, job: Box<dyn Job>) -> Result<()> {
        match self.submit_tx.try_send(job) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                self.counters.waiting.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(CoreError::PoolSaturated)
            }
            Err(TrySendError::Closed(_)) => Err(CoreError::Closed),
        }
    }

    /// Retarget the worker set. Safe concurrent with submission; surplus
    /// workers finish their in-flight job and exit.
    pub fn tune(&self, desired: usize) {
        let mut workers = self.workers.lock();
        self.target.store(desired, Ordering::Release);
        while workers.len() < desired {
            workers.push(self.spawn_worker());
        }
        while workers.len() > desired {
            if let Some(worker) = workers.pop() {
                worker.cancel.cancel();
                // The task drains its current job and exits on its own.
                drop(worker.handle);
            }
        }
    }

    fn spawn_worker(&self) -> WorkerHandle {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        let rx = Arc::clone(&self.submit_rx);
        let results_tx = self.results_tx.clone();
        let counters = Arc::clone(&self.counters);
        let worker_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            worker_loop(id, rx, results_tx, worker_cancel, counters).await;
        });
        WorkerHandle { cancel, handle }
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    /// Live worker tasks; never observed above `target`.
    pub fn running(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn waiting(&self) -> usize {
        self.counters.waiting.load(Ordering::Relaxed)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Cancel every worker and wait up to `timeout` for them to exit.
    /// Workers stuck inside a job body are abandoned to finish on their
    /// own; their results go nowhere.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock();
            self.target.store(0, Ordering::Release);
            workers.drain(..).map(|w| w.handle).collect()
        };
        if handles.is_empty() {
            return;
        }
        let total = handles.len();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("executor shutdown exceeded {timeout:?}; abandoning up to {total} workers");
        }
    }
}

async fn next_submission(
    rx: &tokio::sync::Mutex<mpsc::Receiver<Box<dyn Job>>>,
) -> Option<Box<dyn Job>> {
    let mut rx = rx.lock().await;
    rx.recv().await
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<dyn Job>>>>,
    results_tx: mpsc::Sender<JobResult>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    debug!("worker {id} started");
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = next_submission(&rx) => match job {
                Some(job) => job,
                None => break,
            },
        };
        counters.waiting.fetch_sub(1, Ordering::Relaxed);

        let mut job = job;
        job.set_start_time(Instant::now());
        let job_id = job.id();
        let class = job.class();

        match std::panic::AssertUnwindSafe(job.execute()).catch_unwind().await {
            Ok(result) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                if results_tx.send(result).await.is_err() {
                    // Result stream closed: shutdown is racing us and
                    // this is the one tolerated drop site.
                    debug!("worker {id}: result stream closed; result dropped");
                }
            }
            Err(panic) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    "worker {id}: job {job_id} ({class}) panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
    debug!("worker {id} stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_util::StubJob;
    use crate::job::{JobClass, ResultPayload};
    use async_trait::async_trait;
    use std::time::Instant;
    use uuid::Uuid;

    fn executor(bound: usize) -> (Arc<Executor>, mpsc::Receiver<JobResult>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Executor::new(bound, tx, CancellationToken::new())),
            rx,
        )
    }

    #[tokio::test]
    async fn executes_and_publishes_results() {
        let (exec, mut results) = executor(16);
        exec.tune(2);
        for i in 0..5 {
            exec.submit(StubJob::boxed(i)).unwrap();
        }
        for _ in 0..5 {
            let r = results.recv().await.expect("result published");
            assert!(r.error.is_none());
        }
        assert_eq!(exec.completed(), 5);
        assert_eq!(exec.failed(), 0);
        exec.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn tune_converges_and_never_overshoots() {
        let (exec, _results) = executor(16);
        exec.tune(4);
        assert_eq!(exec.target(), 4);
        assert_eq!(exec.running(), 4);
        exec.tune(1);
        assert_eq!(exec.target(), 1);
        assert!(exec.running() <= 1);
        exec.tune(3);
        assert_eq!(exec.running(), 3);
        exec.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn saturated_submission_is_rejected_and_counted() {
        // No workers: nothing drains the submission channel.
        let (exec, _results) = executor(2);
        exec.submit(StubJob::boxed(0)).unwrap();
        exec.submit(StubJob::boxed(1)).unwrap();
        assert!(matches!(
            exec.submit(StubJob::boxed(2)),
            Err(CoreError::PoolSaturated)
        ));
        assert_eq!(exec.rejected(), 1);
        assert_eq!(exec.submitted(), 2);
        exec.shutdown(Duration::from_secs(1)).await;
    }

    struct PanickingJob {
        id: Uuid,
    }

    #[async_trait]
    impl Job for PanickingJob {
        fn id(&self) -> Uuid {
            self.id
        }
        fn monitor_id(&self) -> Uuid {
            self.id
        }
        fn class(&self) -> JobClass {
            JobClass::Intervention
        }
        async fn execute(self: Box<Self>) -> JobResult {
            panic!("remediation body exploded");
        }
        fn clone_job(&self) -> Box<dyn Job> {
            Box::new(Self { id: self.id })
        }
        fn enqueue_time(&self) -> Option<Instant> {
            None
        }
        fn set_enqueue_time(&mut self, _t: Instant) {}
        fn start_time(&self) -> Option<Instant> {
            None
        }
        fn set_start_time(&mut self, _t: Instant) {}
        fn reset(&mut self) {}
    }

    #[tokio::test]
    async fn panicking_job_is_counted_failed_and_worker_survives() {
        let (exec, mut results) = executor(16);
        exec.tune(1);
        exec.submit(Box::new(PanickingJob { id: Uuid::new_v4() }))
            .unwrap();
        exec.submit(StubJob::boxed(1)).unwrap();

        // The panicked job publishes nothing; the next job still runs.
        let r = results.recv().await.expect("worker survived the panic");
        assert!(r.error.is_none());
        assert_eq!(exec.failed(), 1);
        assert_eq!(exec.completed(), 1);
        exec.shutdown(Duration::from_secs(1)).await;
    }
}
