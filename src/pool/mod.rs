//! Dynamic worker pool
//!
//! Pulls batches from the queue, executes each job on the tunable
//! executor, and batches results toward the router. Three long-lived
//! tasks: the dispatcher, the result processor, and (when enabled) the
//! auto-sizer. All are children of one cancellation token; shutdown is
//! cooperative and bounded.

pub(crate) mod executor;

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::job::JobResult;
use crate::queue::JobQueue;
use crate::router::{ResultRouter, ResultStreams};
use crate::sizing::AutoSizer;
use crate::types::{CoreError, Result};

use executor::Executor;

/// Pool lifecycle. Only `New -> Running` (via `start`) and
/// `Running -> Stopping` (via `drain_and_stop`) are user-initiated;
/// `Stopping -> Stopped` happens as the drain completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    New,
    Running,
    Stopping,
    Stopped,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PoolState::New,
            1 => PoolState::Running,
            2 => PoolState::Stopping,
            _ => PoolState::Stopped,
        }
    }
}

/// Snapshot of the pool's counters and sizing state
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Worker count the executor is currently sized to
    pub target: usize,
    /// Live worker tasks; at most `target`
    pub running: usize,
    /// Submissions waiting for a worker
    pub waiting: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub scaling_events: u64,
    pub last_scale: Option<DateTime<Utc>>,
    pub state: PoolState,
}

/// Scaling history shared between the pool and the auto-sizer
pub(crate) struct ScaleLog {
    events: AtomicU64,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl ScaleLog {
    fn new() -> Self {
        Self {
            events: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn record(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
        *self.last.lock() = Some(Utc::now());
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        *self.last.lock()
    }
}

pub struct DynamicPool {
    queue: Arc<dyn JobQueue>,
    config: PoolConfig,
    executor: Arc<Executor>,
    router: Arc<ResultRouter>,
    results_rx: Mutex<Option<mpsc::Receiver<JobResult>>>,
    scale: Arc<ScaleLog>,
    state: AtomicU8,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DynamicPool {
    /// Bind a pool to a queue. Returns the pool and the three outbound
    /// result streams whose consumers belong to the caller. Spawns the
    /// initial worker set, so it must run inside a tokio runtime.
    pub fn new(queue: Arc<dyn JobQueue>, config: PoolConfig) -> Result<(Self, ResultStreams)> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let stream_depth = (config.result_batch_size * 2).max(config.max_workers);
        let (results_tx, results_rx) = mpsc::channel(stream_depth);
        let (router, streams) = ResultRouter::new(config.max_workers, config.result_batch_timeout);
        let executor = Arc::new(Executor::new(
            config.max_workers * 2,
            results_tx,
            cancel.child_token(),
        ));
        executor.tune(config.min_workers);
        Ok((
            Self {
                queue,
                config,
                executor,
                router: Arc::new(router),
                results_rx: Mutex::new(Some(results_rx)),
                scale: Arc::new(ScaleLog::new()),
                state: AtomicU8::new(PoolState::New as u8),
                cancel,
                tasks: Mutex::new(Vec::new()),
            },
            streams,
        ))
    }

    /// Spin up the dispatcher, the result processor, and the auto-sizer
    /// when `adjust_interval` is non-zero.
    pub fn start(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(
                PoolState::New as u8,
                PoolState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(CoreError::InvalidConfig("pool already started".into()));
        }
        let results_rx = self
            .results_rx
            .lock()
            .take()
            .ok_or_else(|| CoreError::InvalidConfig("result stream already taken".into()))?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(dispatcher_loop(
            Arc::clone(&self.queue),
            Arc::clone(&self.executor),
            self.cancel.child_token(),
            self.config.result_batch_size,
        )));
        tasks.push(tokio::spawn(result_processor_loop(
            results_rx,
            Arc::clone(&self.router),
            self.cancel.child_token(),
            self.config.result_batch_size,
            self.config.result_batch_timeout,
        )));
        if !self.config.adjust_interval.is_zero() {
            let sizer = AutoSizer::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.executor),
                Arc::clone(&self.scale),
                self.config.clone(),
            );
            tasks.push(tokio::spawn(sizer.run(self.cancel.child_token())));
        }
        info!(
            "pool running: workers [{}, {}], auto-sizer {}",
            self.config.min_workers,
            self.config.max_workers,
            if self.config.adjust_interval.is_zero() {
                "disabled".to_string()
            } else {
                format!("every {:?}", self.config.adjust_interval)
            }
        );
        Ok(())
    }

    /// Manually retarget the worker set within the configured bounds.
    pub fn tune(&self, workers: usize) {
        let clamped = workers.clamp(self.config.min_workers, self.config.max_workers);
        if clamped != self.executor.target() {
            self.executor.tune(clamped);
            self.scale.record();
        }
    }

    /// Cooperatively stop: cancel the task tree, wait (capped at five
    /// times the target queue latency), close the result stream, release
    /// the executor. Idempotent.
    pub async fn drain_and_stop(&self) {
        match self.state.compare_exchange(
            PoolState::Running as u8,
            PoolState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(prev) if PoolState::from_u8(prev) == PoolState::New => {
                self.state
                    .store(PoolState::Stopped as u8, Ordering::Release);
                return;
            }
            Err(_) => return,
        }

        let ceiling = self.config.target_queue_latency * 5;
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = mem::take(&mut *self.tasks.lock());
        if tokio::time::timeout(ceiling, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("pool tasks exceeded drain ceiling {ceiling:?}; in-stream results dropped");
        }
        self.executor.shutdown(ceiling).await;
        self.router.close();
        self.state
            .store(PoolState::Stopped as u8, Ordering::Release);
        info!("pool stopped");
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            target: self.executor.target(),
            running: self.executor.running(),
            waiting: self.executor.waiting(),
            submitted: self.executor.submitted(),
            completed: self.executor.completed(),
            failed: self.executor.failed(),
            scaling_events: self.scale.events(),
            last_scale: self.scale.last(),
            state: self.state(),
        }
    }

    /// Submissions refused at the executor bound; each one is a lost job.
    pub fn rejected(&self) -> u64 {
        self.executor.rejected()
    }
}

/// Pull batches sized to the worker count and feed the executor.
async fn dispatcher_loop(
    queue: Arc<dyn JobQueue>,
    executor: Arc<Executor>,
    cancel: CancellationToken,
    result_batch_size: usize,
) {
    debug!("dispatcher started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let batch_target = executor.target().clamp(1, result_batch_size);
        match queue.dequeue_batch(batch_target) {
            Err(CoreError::Closed) => {
                info!("dispatcher: queue closed and drained; exiting");
                break;
            }
            Err(e) => {
                error!("dispatcher: dequeue failed: {e}");
                if pause(&cancel, Duration::from_millis(100)).await {
                    break;
                }
            }
            Ok(batch) if batch.is_empty() => {
                if pause(&cancel, Duration::from_millis(10)).await {
                    break;
                }
            }
            Ok(batch) => {
                for job in batch {
                    match executor.submit(job) {
                        Ok(()) => {}
                        Err(CoreError::PoolSaturated) => {
                            // Already dequeued, so this job is lost.
                            error!("dispatcher: executor saturated; job lost");
                        }
                        Err(_) => {
                            // Submission channel closed mid-shutdown; the
                            // silent drop is tolerated only here.
                        }
                    }
                }
            }
        }
    }
    debug!("dispatcher stopped");
}

/// Returns true when cancelled during the pause.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Accumulate results and flush batches to the router on size or age.
async fn result_processor_loop(
    mut results_rx: mpsc::Receiver<JobResult>,
    router: Arc<ResultRouter>,
    cancel: CancellationToken,
    batch_size: usize,
    batch_timeout: Duration,
) {
    let mut batch: Vec<JobResult> = Vec::with_capacity(batch_size);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = results_rx.recv() => match maybe {
                Some(result) => {
                    batch.push(result);
                    if batch.len() >= batch_size {
                        router.route(mem::take(&mut batch)).await;
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep(batch_timeout), if !batch.is_empty() => {
                router.route(mem::take(&mut batch)).await;
            }
        }
    }
    if !batch.is_empty() {
        router.route(batch).await;
    }
    debug!("result processor stopped");
}
