//! Hybrid queue: lock-free ring fast path plus a mutex-guarded overflow
//! list for bursts
//!
//! Consumers drain the overflow *before* the ring. Spilled jobs are the
//! ones that have already waited longest, so draining them first bounds
//! their residency and keeps the ring hot; the cost is that an
//! overflowed job can be observed later than ring jobs admitted after
//! it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{DropPolicy, QueueConfig};
use crate::job::{Batch, Job};
use crate::queue::ring::RingBuffer;
use crate::queue::stats::{QueueStats, StatsRecorder};
use crate::queue::JobQueue;
use crate::types::{CoreError, Result};

/// Fraction of ring capacity below which the saturation alert clears
const RING_CLEAR_FRACTION: f64 = 0.8;

pub struct HybridQueue {
    ring: RingBuffer,
    overflow: Mutex<VecDeque<Box<dyn Job>>>,
    overflow_capacity: usize,
    /// Admission bound: hard watermark applied to the overflow capacity
    overflow_limit: usize,
    soft_threshold: usize,
    hard_threshold: usize,
    drop_policy: DropPolicy,
    ring_clear_depth: usize,
    closed: AtomicBool,
    // One-shot alert latches, re-armed when the level recrosses
    soft_alert: AtomicBool,
    hard_alert: AtomicBool,
    ring_saturated: AtomicBool,
    stats: StatsRecorder,
}

/// Outcome of an overflow admit attempt, resolved under the mutex
enum Spill {
    Admitted,
    AdmittedEvicting,
    Refused,
}

impl HybridQueue {
    pub fn new(config: &QueueConfig) -> Result<Self> {
        config.validate()?;
        if config.kind != crate::config::QueueKind::Hybrid {
            return Err(CoreError::InvalidConfig(format!(
                "hybrid queue constructed with kind {:?}",
                config.kind
            )));
        }
        let cap = config.overflow_capacity;
        let hard_threshold = (config.hard_watermark * cap as f64).ceil() as usize;
        let soft_threshold = (config.soft_watermark * cap as f64).ceil() as usize;
        Ok(Self {
            ring: RingBuffer::new(config.capacity),
            overflow: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            overflow_capacity: cap,
            overflow_limit: hard_threshold.min(cap),
            soft_threshold,
            hard_threshold,
            drop_policy: config.drop_policy,
            ring_clear_depth: (config.capacity as f64 * RING_CLEAR_FRACTION) as usize,
            closed: AtomicBool::new(false),
            soft_alert: AtomicBool::new(false),
            hard_alert: AtomicBool::new(false),
            ring_saturated: AtomicBool::new(false),
            stats: StatsRecorder::new(),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Emit one-shot alerts when the overflow depth crosses a watermark
    /// in either direction.
    fn update_watermarks(&self, depth: usize) {
        let above_soft = depth >= self.soft_threshold && self.soft_threshold > 0;
        if self.soft_alert.swap(above_soft, Ordering::Relaxed) != above_soft {
            if above_soft {
                warn!(
                    "overflow depth {} crossed soft watermark ({}/{})",
                    depth, self.soft_threshold, self.overflow_capacity
                );
            } else {
                info!(
                    "overflow depth {} back below soft watermark ({}/{})",
                    depth, self.soft_threshold, self.overflow_capacity
                );
            }
        }
        let above_hard = depth >= self.hard_threshold && self.hard_threshold > 0;
        if self.hard_alert.swap(above_hard, Ordering::Relaxed) != above_hard {
            if above_hard {
                warn!(
                    "overflow depth {} crossed hard watermark ({}/{})",
                    depth, self.hard_threshold, self.overflow_capacity
                );
            } else {
                info!(
                    "overflow depth {} back below hard watermark ({}/{})",
                    depth, self.hard_threshold, self.overflow_capacity
                );
            }
        }
    }

    fn note_spill(&self) {
        if !self.ring_saturated.swap(true, Ordering::Relaxed) {
            warn!(
                "ring saturated at {} slots; spilling to overflow",
                self.ring.capacity()
            );
        }
    }

    fn maybe_clear_saturation(&self) {
        if self.ring_saturated.load(Ordering::Relaxed)
            && self.ring.len() < self.ring_clear_depth
            && self.ring_saturated.swap(false, Ordering::Relaxed)
        {
            info!(
                "ring depth back below {} of {}; overflow spill cleared",
                self.ring_clear_depth,
                self.ring.capacity()
            );
        }
    }

    /// Admit one job into the overflow list. The mutex guards only the
    /// list itself; never a ring admit, never user code.
    fn spill(&self, job: Box<dyn Job>) -> Spill {
        self.note_spill();
        let (outcome, depth) = {
            let mut overflow = self.overflow.lock();
            if overflow.len() < self.overflow_limit {
                overflow.push_back(job);
                (Spill::Admitted, overflow.len())
            } else {
                match self.drop_policy {
                    DropPolicy::Reject | DropPolicy::DropNewest => {
                        (Spill::Refused, overflow.len())
                    }
                    DropPolicy::DropOldest => {
                        if self.overflow_limit == 0 {
                            (Spill::Refused, overflow.len())
                        } else {
                            overflow.pop_front();
                            overflow.push_back(job);
                            (Spill::AdmittedEvicting, overflow.len())
                        }
                    }
                }
            }
        };
        self.update_watermarks(depth);
        outcome
    }

    fn pop_overflow(&self) -> Option<Box<dyn Job>> {
        let (job, depth) = {
            let mut overflow = self.overflow.lock();
            (overflow.pop_front(), overflow.len())
        };
        if job.is_some() {
            self.update_watermarks(depth);
        }
        job
    }

    fn record_dequeues(&self, jobs: &[Box<dyn Job>]) {
        let now = Instant::now();
        for job in jobs {
            let wait = job.enqueue_time().map(|t| now.duration_since(t));
            self.stats.note_dequeue(wait, now);
        }
    }
}

impl JobQueue for HybridQueue {
    fn enqueue(&self, mut job: Box<dyn Job>) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        let now = Instant::now();
        job.set_enqueue_time(now);
        let job = match self.ring.try_push(job) {
            Ok(()) => {
                self.stats.note_enqueue(1, now);
                return Ok(());
            }
            Err(job) => job,
        };
        self.stats.note_enqueue(1, now);
        match self.spill(job) {
            Spill::Admitted => Ok(()),
            Spill::AdmittedEvicting => {
                self.stats.note_drop(1);
                Ok(())
            }
            Spill::Refused => {
                self.stats.note_drop(1);
                Err(CoreError::Full)
            }
        }
    }

    fn enqueue_batch(&self, mut jobs: Batch) -> Result<usize> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        if jobs.is_empty() {
            return Ok(0);
        }
        let now = Instant::now();
        for job in jobs.iter_mut() {
            job.set_enqueue_time(now);
        }
        let offered = jobs.len();
        self.stats.note_enqueue(offered as u64, now);

        let mut admitted = 0usize;
        let mut lost = 0u64;
        for job in jobs {
            let job = match self.ring.try_push(job) {
                Ok(()) => {
                    admitted += 1;
                    continue;
                }
                Err(job) => job,
            };
            match self.spill(job) {
                Spill::Admitted => admitted += 1,
                Spill::AdmittedEvicting => {
                    admitted += 1;
                    lost += 1;
                }
                Spill::Refused => lost += 1,
            }
        }
        if lost > 0 {
            self.stats.note_drop(lost);
        }
        if admitted == 0 {
            Err(CoreError::Full)
        } else {
            Ok(admitted)
        }
    }

    fn dequeue(&self) -> Result<Option<Box<dyn Job>>> {
        // Overflow first: spilled jobs have waited longest.
        let job = self.pop_overflow().or_else(|| self.ring.pop());
        match job {
            Some(job) => {
                let now = Instant::now();
                let wait = job.enqueue_time().map(|t| now.duration_since(t));
                self.stats.note_dequeue(wait, now);
                self.maybe_clear_saturation();
                Ok(Some(job))
            }
            None if self.is_closed() => Err(CoreError::Closed),
            None => Ok(None),
        }
    }

    fn dequeue_batch(&self, max: usize) -> Result<Batch> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut out: Batch = Vec::with_capacity(max.min(1024));
        let depth = {
            let mut overflow = self.overflow.lock();
            while out.len() < max {
                match overflow.pop_front() {
                    Some(job) => out.push(job),
                    None => break,
                }
            }
            overflow.len()
        };
        if !out.is_empty() {
            self.update_watermarks(depth);
        }
        if out.len() < max {
            out.extend(self.ring.pop_batch(max - out.len()));
        }
        if out.is_empty() {
            return if self.is_closed() {
                Err(CoreError::Closed)
            } else {
                Ok(out)
            };
        }
        self.record_dequeues(&out);
        self.maybe_clear_saturation();
        Ok(out)
    }

    fn is_empty(&self) -> bool {
        self.ring.is_empty() && self.overflow.lock().is_empty()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn stats(&self) -> QueueStats {
        let depth = self.ring.len() + self.overflow.lock().len();
        self.stats
            .snapshot(depth, self.ring.capacity() + self.overflow_capacity)
    }
}
