//! Bounded job queues
//!
//! One interface, three implementations. The hybrid variant is the
//! default: a lock-free ring for the hot path with a mutex-guarded
//! overflow list for bursts. The factory picks by configuration.

pub mod expanding;
pub mod hybrid;
pub mod ring;
pub mod stats;

use std::sync::Arc;

use crate::config::{QueueConfig, QueueKind};
use crate::job::{Batch, Job};
use crate::types::Result;

pub use expanding::ExpandingQueue;
pub use hybrid::HybridQueue;
pub use ring::RingQueue;
pub use stats::QueueStats;

/// The queue contract every variant satisfies.
///
/// Operations never block, with one exception: the hybrid variant takes
/// a short mutex around its overflow list. All methods are safe to call
/// from async context without `.await`.
pub trait JobQueue: Send + Sync {
    /// Admit one job, stamping its enqueue time. Fails with `Full` when
    /// saturated under the configured policy, `Closed` after close.
    fn enqueue(&self, job: Box<dyn Job>) -> Result<()>;

    /// Admit a batch; every job shares one enqueue stamp. The ring
    /// variant admits the whole batch or fails; the hybrid variant
    /// admits individually and may partially succeed. Returns the number
    /// of jobs admitted.
    fn enqueue_batch(&self, jobs: Batch) -> Result<usize>;

    /// Return the oldest job, or `None` when empty. Fails with `Closed`
    /// only once the queue is closed *and* drained.
    fn dequeue(&self) -> Result<Option<Box<dyn Job>>>;

    /// Return up to `max` oldest jobs in FIFO order, with the same
    /// empty/closed rules as `dequeue`.
    fn dequeue_batch(&self, max: usize) -> Result<Batch>;

    /// Observed emptiness; may be stale under concurrency.
    fn is_empty(&self) -> bool;

    /// Idempotent. Admits fail afterwards; dequeues drain first.
    fn close(&self);

    /// Counter and rate snapshot.
    fn stats(&self) -> QueueStats;
}

/// Build the queue variant the configuration selects.
pub fn build(config: &QueueConfig) -> Result<Arc<dyn JobQueue>> {
    config.validate()?;
    Ok(match config.kind {
        QueueKind::Ring => Arc::new(RingQueue::new(config)?),
        QueueKind::Expanding => Arc::new(ExpandingQueue::new(config)?),
        QueueKind::Hybrid => Arc::new(HybridQueue::new(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DropPolicy;
    use crate::job::test_util::StubJob;

    #[test]
    fn factory_selects_by_kind() {
        for kind in [QueueKind::Ring, QueueKind::Expanding, QueueKind::Hybrid] {
            let q = build(&QueueConfig {
                kind,
                capacity: 8,
                overflow_capacity: 4,
                ..QueueConfig::default()
            })
            .expect("factory builds every kind");
            q.enqueue(StubJob::boxed(1)).unwrap();
            assert_eq!(q.stats().enqueued, 1);
        }
    }

    #[test]
    fn factory_rejects_invalid_config() {
        let cfg = QueueConfig {
            kind: QueueKind::Hybrid,
            capacity: 12,
            ..QueueConfig::default()
        };
        assert!(build(&cfg).is_err());

        let cfg = QueueConfig {
            soft_watermark: 1.5,
            drop_policy: DropPolicy::Reject,
            ..QueueConfig::default()
        };
        assert!(build(&cfg).is_err());
    }
}
