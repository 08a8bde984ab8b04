//! Batch collector: coalesces per-job producers into batch admits
//!
//! Sits between code that mints one job at a time and a queue that is
//! cheapest to feed in batches. Flushes when the buffer reaches
//! `batch_size` or when the background ticker finds the buffer older
//! than `flush_timeout`.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CollectorConfig;
use crate::job::{Batch, Job};
use crate::queue::JobQueue;
use crate::types::{CoreError, Result};

struct FlushBuffer {
    jobs: Batch,
    last_flush: Instant,
}

struct Inner {
    queue: Arc<dyn JobQueue>,
    buffer: Mutex<FlushBuffer>,
    config: CollectorConfig,
}

impl Inner {
    /// Move the buffer out and admit it downstream. The buffer lock is
    /// released before the admit so readers never wait on the queue.
    fn flush(&self) -> Result<usize> {
        let batch = {
            let mut buffer = self.buffer.lock();
            buffer.last_flush = Instant::now();
            mem::take(&mut buffer.jobs)
        };
        if batch.is_empty() {
            return Ok(0);
        }
        self.queue.enqueue_batch(batch)
    }

    fn flush_if_stale(&self) {
        let stale = {
            let buffer = self.buffer.lock();
            !buffer.jobs.is_empty() && buffer.last_flush.elapsed() >= self.config.flush_timeout
        };
        if stale {
            if let Err(e) = self.flush() {
                warn!("collector timed flush failed: {e}");
            }
        }
    }
}

/// Single-producer-facing adapter in front of a batch-oriented queue
pub struct BatchCollector {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BatchCollector {
    /// Create the collector and start its flush ticker.
    pub fn new(queue: Arc<dyn JobQueue>, config: CollectorConfig) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(Inner {
            queue,
            buffer: Mutex::new(FlushBuffer {
                jobs: Vec::with_capacity(config.batch_size),
                last_flush: Instant::now(),
            }),
            config: config.clone(),
        });
        let cancel = CancellationToken::new();

        let ticker = {
            let inner = Arc::clone(&inner);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(inner.config.flush_timeout);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => inner.flush_if_stale(),
                    }
                }
                debug!("collector ticker stopped");
            })
        };

        Ok(Self {
            inner,
            cancel,
            ticker: Mutex::new(Some(ticker)),
            closed: AtomicBool::new(false),
        })
    }

    /// Append one job; flushes synchronously when the buffer fills.
    pub fn add(&self, job: Box<dyn Job>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        let full = {
            let mut buffer = self.inner.buffer.lock();
            buffer.jobs.push(job);
            buffer.jobs.len() >= self.inner.config.batch_size
        };
        if full {
            self.inner.flush()?;
        }
        Ok(())
    }

    /// Flush whatever is buffered right now.
    pub fn flush(&self) -> Result<usize> {
        self.inner.flush()
    }

    /// Buffered jobs not yet admitted downstream.
    pub fn pending(&self) -> usize {
        self.inner.buffer.lock().jobs.len()
    }

    /// Stop the ticker, wait for it, and perform a final flush.
    /// Idempotent; later calls flush nothing.
    pub async fn close(&self) -> Result<usize> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        self.cancel.cancel();
        let handle = self.ticker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.flush()
    }
}
