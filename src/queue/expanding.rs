//! Expanding queue: ring segments that double in capacity as they fill
//!
//! Producers always admit into the newest segment; when it is full a new
//! segment of twice its capacity is linked and admission retries. The
//! segment table only ever grows (doubling keeps it O(log total) long),
//! so drained segments stay in place as empty husks and no unsafe
//! reclamation is needed. Emptiness is decided by the monotone
//! enqueued/dequeued counters, not by scanning segments.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::QueueConfig;
use crate::job::{Batch, Job};
use crate::queue::ring::{Backoff, RingBuffer};
use crate::queue::stats::{QueueStats, StatsRecorder};
use crate::queue::JobQueue;
use crate::types::{CoreError, Result};

pub struct ExpandingQueue {
    /// Live segments in admission order; append-only, write-locked only
    /// while linking a new segment.
    segments: RwLock<Vec<Arc<RingBuffer>>>,
    /// Index of the first segment that may still hold jobs
    head_idx: AtomicUsize,
    closed: AtomicBool,
    stats: StatsRecorder,
}

impl ExpandingQueue {
    pub fn new(config: &QueueConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "expanding queue capacity must be > 0".into(),
            ));
        }
        let seed = config.capacity.next_power_of_two();
        Ok(Self {
            segments: RwLock::new(vec![Arc::new(RingBuffer::new(seed))]),
            head_idx: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            stats: StatsRecorder::new(),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Link a new tail segment with double the capacity of the current
    /// one, unless another producer already did.
    fn grow(&self, observed_len: usize) {
        let mut segments = self.segments.write();
        if segments.len() != observed_len {
            // Lost the race; the winner's segment has room.
            return;
        }
        let next_capacity = segments
            .last()
            .map(|seg| seg.capacity() * 2)
            .unwrap_or(1)
            .max(1);
        debug!(
            "expanding queue growing to segment {} of {} slots",
            segments.len(),
            next_capacity
        );
        segments.push(Arc::new(RingBuffer::new(next_capacity)));
    }

    /// Admit into the tail segment, growing until it sticks. Always
    /// succeeds: capacity is unbounded by design.
    fn push(&self, job: Box<dyn Job>) {
        let mut job = job;
        loop {
            let (tail, len) = {
                let segments = self.segments.read();
                (
                    Arc::clone(segments.last().expect("segment table is never empty")),
                    segments.len(),
                )
            };
            match tail.try_push(job) {
                Ok(()) => return,
                Err(back) => {
                    job = back;
                    self.grow(len);
                }
            }
        }
    }

    /// True once every job ever admitted has been dequeued.
    fn drained(&self) -> bool {
        // Load dequeued first so a concurrent admit cannot make the pair
        // look drained when it is not.
        let dequeued = self.stats.dequeued();
        let enqueued = self.stats.enqueued();
        enqueued == dequeued
    }

    /// Take the oldest job, walking the head segment forward past husks.
    fn take(&self) -> Option<Box<dyn Job>> {
        let mut backoff = Backoff::new();
        loop {
            let (seg, idx, len) = {
                let segments = self.segments.read();
                let idx = self.head_idx.load(Ordering::Acquire).min(segments.len() - 1);
                (Arc::clone(&segments[idx]), idx, segments.len())
            };
            if let Some(job) = seg.pop() {
                return Some(job);
            }
            if idx + 1 < len && seg.is_empty() {
                // Head segment fully drained and a newer one exists.
                let _ = self.head_idx.compare_exchange(
                    idx,
                    idx + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            if self.drained() {
                return None;
            }
            // A concurrent admit has claimed but not yet published, or a
            // concurrent consumer holds the counter update; yield and
            // look again.
            backoff.snooze();
        }
    }
}

impl JobQueue for ExpandingQueue {
    fn enqueue(&self, mut job: Box<dyn Job>) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        let now = Instant::now();
        job.set_enqueue_time(now);
        self.push(job);
        self.stats.note_enqueue(1, now);
        Ok(())
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
        let count = jobs.len();
        for job in jobs {
            self.push(job);
        }
        self.stats.note_enqueue(count as u64, now);
        Ok(count)
    }

    fn dequeue(&self) -> Result<Option<Box<dyn Job>>> {
        match self.take() {
            Some(job) => {
                let now = Instant::now();
                let wait = job.enqueue_time().map(|t| now.duration_since(t));
                self.stats.note_dequeue(wait, now);
                Ok(Some(job))
            }
            None if self.is_closed() => Err(CoreError::Closed),
            None => Ok(None),
        }
    }

    fn dequeue_batch(&self, max: usize) -> Result<Batch> {
        let mut out: Batch = Vec::new();
        while out.len() < max {
            match self.take() {
                Some(job) => out.push(job),
                None => break,
            }
        }
        if out.is_empty() {
            return if self.is_closed() && max > 0 {
                Err(CoreError::Closed)
            } else {
                Ok(out)
            };
        }
        let now = Instant::now();
        for job in &out {
            let wait = job.enqueue_time().map(|t| now.duration_since(t));
            self.stats.note_dequeue(wait, now);
        }
        Ok(out)
    }

    fn is_empty(&self) -> bool {
        self.drained()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn stats(&self) -> QueueStats {
        let capacity: usize = self.segments.read().iter().map(|s| s.capacity()).sum();
        let enqueued = self.stats.enqueued();
        let dequeued = self.stats.dequeued();
        let depth = enqueued.saturating_sub(dequeued) as usize;
        self.stats.snapshot(depth, capacity)
    }
}
