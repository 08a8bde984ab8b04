//! Atomic queue statistics
//!
//! Counters are monotone over the queue's lifetime; rates are computed
//! against the construction timestamp, so consumers needing windowed
//! rates must difference successive snapshots themselves. Averages are
//! derived from a (sum, count) pair read non-atomically, which can be
//! momentarily inconsistent under concurrency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Point-in-time view of a queue's counters and derived rates
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Jobs currently buffered (ring + overflow where applicable)
    pub depth: usize,
    /// Total buffer capacity
    pub capacity: usize,
    /// Jobs offered to the queue (accepted or dropped) since construction
    pub enqueued: u64,
    /// Jobs handed to consumers since construction
    pub dequeued: u64,
    /// Jobs lost at the queue: refused admits and evictions
    pub dropped: u64,
    /// Longest observed admit-to-dequeue wait
    pub max_wait: Duration,
    /// Mean admit-to-dequeue wait
    pub avg_wait: Duration,
    /// Offered arrival rate in jobs/second over the queue's lifetime
    pub enqueue_rate: f64,
    /// Drain rate in jobs/second over the queue's lifetime
    pub dequeue_rate: f64,
    /// Wall-clock time of the most recent admit
    pub last_enqueue: Option<DateTime<Utc>>,
    /// Wall-clock time of the most recent dequeue
    pub last_dequeue: Option<DateTime<Utc>>,
}

/// Shared recorder behind every queue variant
pub(crate) struct StatsRecorder {
    created_at: Instant,
    created_wall: DateTime<Utc>,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    wait_total_ns: AtomicU64,
    wait_max_ns: AtomicU64,
    // Nanoseconds since created_at, clamped to >= 1; zero means never
    last_enqueue_ns: AtomicU64,
    last_dequeue_ns: AtomicU64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            created_wall: Utc::now(),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            wait_total_ns: AtomicU64::new(0),
            wait_max_ns: AtomicU64::new(0),
            last_enqueue_ns: AtomicU64::new(0),
            last_dequeue_ns: AtomicU64::new(0),
        }
    }

    fn mark(&self, cell: &AtomicU64, at: Instant) {
        let ns = at.duration_since(self.created_at).as_nanos() as u64;
        cell.store(ns.max(1), Ordering::Relaxed);
    }

    pub fn note_enqueue(&self, count: u64, at: Instant) {
        self.enqueued.fetch_add(count, Ordering::Relaxed);
        self.mark(&self.last_enqueue_ns, at);
    }

    /// Record one dequeued job; `wait` is `now - enqueue_time` when the
    /// job carried a stamp.
    pub fn note_dequeue(&self, wait: Option<Duration>, at: Instant) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        self.mark(&self.last_dequeue_ns, at);
        if let Some(wait) = wait {
            let ns = wait.as_nanos() as u64;
            self.wait_total_ns.fetch_add(ns, Ordering::Relaxed);
            let mut cur = self.wait_max_ns.load(Ordering::Relaxed);
            while ns > cur {
                match self.wait_max_ns.compare_exchange_weak(
                    cur,
                    ns,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => cur = observed,
                }
            }
        }
    }

    pub fn note_drop(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    fn wall(&self, cell: &AtomicU64) -> Option<DateTime<Utc>> {
        match cell.load(Ordering::Relaxed) {
            0 => None,
            ns => Some(self.created_wall + chrono::Duration::nanoseconds(ns as i64)),
        }
    }

    pub fn snapshot(&self, depth: usize, capacity: usize) -> QueueStats {
        let enqueued = self.enqueued.load(Ordering::Relaxed);
        let dequeued = self.dequeued.load(Ordering::Relaxed);
        let dropped = self.dropped.load(Ordering::Relaxed);
        let wait_total = self.wait_total_ns.load(Ordering::Relaxed);
        let max_wait = Duration::from_nanos(self.wait_max_ns.load(Ordering::Relaxed));
        let avg_wait = if dequeued > 0 {
            Duration::from_nanos(wait_total / dequeued)
        } else {
            Duration::ZERO
        };
        let uptime = self.created_at.elapsed().as_secs_f64().max(f64::EPSILON);
        QueueStats {
            depth,
            capacity,
            enqueued,
            dequeued,
            dropped,
            max_wait,
            avg_wait,
            enqueue_rate: enqueued as f64 / uptime,
            dequeue_rate: dequeued as f64 / uptime,
            last_enqueue: self.wall(&self.last_enqueue_ns),
            last_dequeue: self.wall(&self.last_dequeue_ns),
        }
    }
}
