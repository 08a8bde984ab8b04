//! Lock-free MPMC ring queue
//!
//! Head and tail are monotonic 64-bit counters claimed by compare-and-
//! swap; a slot is addressed by `index & (capacity - 1)`. Each slot
//! carries a sequence number that publishes the post-claim store to the
//! claiming consumer (and the slot's release back to producers), so the
//! CAS is the commit point and the store itself is infallible: no
//! allocation, no user code, just a box move. Wrap-around is a non-issue
//! at u64 widths.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::config::QueueConfig;
use crate::job::{Batch, Job};
use crate::queue::stats::{QueueStats, StatsRecorder};
use crate::queue::JobQueue;
use crate::types::{CoreError, Result};

/// Cooperative back-off for contended CAS loops: the yield count doubles
/// from 1 to 1024, after which each call yields once.
pub(crate) struct Backoff {
    yields: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { yields: 1 }
    }

    pub fn snooze(&mut self) {
        if self.yields <= 1024 {
            for _ in 0..self.yields {
                std::thread::yield_now();
            }
            self.yields *= 2;
        } else {
            std::thread::yield_now();
        }
    }
}

/// One ring slot. `seq` encodes whose turn the slot is: equal to the
/// claim index while free for that lap's producer, claim index + 1 once
/// a job is published, claim index + capacity once the consumer has
/// nulled it again.
struct Slot {
    seq: AtomicU64,
    cell: UnsafeCell<Option<Box<dyn Job>>>,
}

#[repr(align(64))]
struct CachePadded<T>(T);

/// The bare ring mechanics, shared by the ring queue itself, the hybrid
/// queue's fast path, and the expanding queue's segments. Stamping,
/// closed-flag handling, and statistics live with the owning queue.
pub(crate) struct RingBuffer {
    mask: u64,
    capacity: usize,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    slots: Box<[Slot]>,
}

// A claimed slot is written by exactly one producer and read by exactly
// one consumer, ordered by the slot's sequence number; everything else
// is atomics.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// `capacity` must be a non-zero power of two, checked by the caller.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity > 0);
        let slots = (0..capacity as u64)
            .map(|i| Slot {
                seq: AtomicU64::new(i),
                cell: UnsafeCell::new(None),
            })
            .collect();
        Self {
            mask: capacity as u64 - 1,
            capacity,
            head: CachePadded(AtomicU64::new(0)),
            tail: CachePadded(AtomicU64::new(0)),
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Observed depth; may be stale the moment it returns.
    pub fn len(&self) -> usize {
        let t = self.tail.0.load(Ordering::Acquire);
        let h = self.head.0.load(Ordering::Acquire);
        t.saturating_sub(h) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim `n` tail slots; fails when the ring lacks the room.
    fn claim_tail(&self, n: u64) -> std::result::Result<u64, ()> {
        let mut backoff = Backoff::new();
        loop {
            let t = self.tail.0.load(Ordering::Acquire);
            let h = self.head.0.load(Ordering::Acquire);
            if t - h + n > self.capacity as u64 {
                return Err(());
            }
            if self
                .tail
                .0
                .compare_exchange(t, t + n, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(t);
            }
            backoff.snooze();
        }
    }

    /// Claim up to `max` head slots; returns the claimed range start and
    /// length, zero when empty.
    fn claim_head(&self, max: u64) -> (u64, u64) {
        let mut backoff = Backoff::new();
        loop {
            let h = self.head.0.load(Ordering::Acquire);
            let t = self.tail.0.load(Ordering::Acquire);
            let avail = t.saturating_sub(h);
            if avail == 0 {
                return (h, 0);
            }
            let n = avail.min(max);
            if self
                .head
                .0
                .compare_exchange(h, h + n, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return (h, n);
            }
            backoff.snooze();
        }
    }

    /// Publish a job into a claimed slot. Infallible by construction.
    fn write(&self, idx: u64, job: Box<dyn Job>) {
        let slot = &self.slots[(idx & self.mask) as usize];
        let mut backoff = Backoff::new();
        while slot.seq.load(Ordering::Acquire) != idx {
            // The previous lap's consumer is still nulling the slot.
            backoff.snooze();
        }
        unsafe { *slot.cell.get() = Some(job) };
        slot.seq.store(idx + 1, Ordering::Release);
    }

    /// Take the job out of a claimed slot, nulling it to break the
    /// reference and releasing the slot for the next lap.
    fn read(&self, idx: u64) -> Box<dyn Job> {
        let slot = &self.slots[(idx & self.mask) as usize];
        let mut backoff = Backoff::new();
        while slot.seq.load(Ordering::Acquire) != idx + 1 {
            // The claiming producer has not published yet.
            backoff.snooze();
        }
        let job = unsafe { (*slot.cell.get()).take() };
        slot.seq.store(idx + self.capacity as u64, Ordering::Release);
        job.expect("claimed ring slot holds a job")
    }

    /// Admit one job, handing it back on `Full`.
    pub fn try_push(&self, job: Box<dyn Job>) -> std::result::Result<(), Box<dyn Job>> {
        match self.claim_tail(1) {
            Ok(t) => {
                self.write(t, job);
                Ok(())
            }
            Err(()) => Err(job),
        }
    }

    /// Admit a whole batch or nothing, handing the batch back on `Full`.
    pub fn try_push_all(&self, jobs: Batch) -> std::result::Result<(), Batch> {
        if jobs.is_empty() {
            return Ok(());
        }
        match self.claim_tail(jobs.len() as u64) {
            Ok(t) => {
                for (i, job) in jobs.into_iter().enumerate() {
                    self.write(t + i as u64, job);
                }
                Ok(())
            }
            Err(()) => Err(jobs),
        }
    }

    pub fn pop(&self) -> Option<Box<dyn Job>> {
        let (h, n) = self.claim_head(1);
        (n == 1).then(|| self.read(h))
    }

    /// Dequeue up to `max` jobs in FIFO order within one claimed range.
    pub fn pop_batch(&self, max: usize) -> Batch {
        if max == 0 {
            return Vec::new();
        }
        let (h, n) = self.claim_head(max as u64);
        (h..h + n).map(|idx| self.read(idx)).collect()
    }
}

/// Fixed-capacity lock-free queue, the fast-path building block.
pub struct RingQueue {
    ring: RingBuffer,
    closed: AtomicBool,
    stats: StatsRecorder,
}

impl RingQueue {
    pub fn new(config: &QueueConfig) -> Result<Self> {
        if config.capacity == 0 || !config.capacity.is_power_of_two() {
            return Err(CoreError::InvalidConfig(format!(
                "ring capacity must be a power of two, got {}",
                config.capacity
            )));
        }
        Ok(Self {
            ring: RingBuffer::new(config.capacity),
            closed: AtomicBool::new(false),
            stats: StatsRecorder::new(),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl JobQueue for RingQueue {
    fn enqueue(&self, mut job: Box<dyn Job>) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        let now = Instant::now();
        job.set_enqueue_time(now);
        self.ring.try_push(job).map_err(|_| CoreError::Full)?;
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
        self.ring.try_push_all(jobs).map_err(|_| CoreError::Full)?;
        self.stats.note_enqueue(count as u64, now);
        Ok(count)
    }

    fn dequeue(&self) -> Result<Option<Box<dyn Job>>> {
        match self.ring.pop() {
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
        let jobs = self.ring.pop_batch(max);
        if jobs.is_empty() {
            return if self.is_closed() && max > 0 {
                Err(CoreError::Closed)
            } else {
                Ok(jobs)
            };
        }
        let now = Instant::now();
        for job in &jobs {
            let wait = job.enqueue_time().map(|t| now.duration_since(t));
            self.stats.note_dequeue(wait, now);
        }
        Ok(jobs)
    }

    fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn stats(&self) -> QueueStats {
        self.stats.snapshot(self.ring.len(), self.ring.capacity())
    }
}
