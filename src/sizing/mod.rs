//! Auto-sizing controller
//!
//! Samples queue and pool statistics every `adjust_interval` and
//! retargets the executor: throughput baseline from the observed
//! per-worker drain rate, then a Little's-Law correction toward the
//! latency target. The `oracle` submodule holds the pure closed forms.

pub mod oracle;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::pool::executor::Executor;
use crate::pool::ScaleLog;
use crate::queue::JobQueue;

pub use oracle::{SizingPlan, WorldSummary};

/// Periodic controller owned by the pool's task tree
pub(crate) struct AutoSizer {
    queue: Arc<dyn JobQueue>,
    executor: Arc<Executor>,
    scale: Arc<ScaleLog>,
    config: PoolConfig,
}

impl AutoSizer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        executor: Arc<Executor>,
        scale: Arc<ScaleLog>,
        config: PoolConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            scale,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.adjust_interval);
        interval.tick().await; // the immediate first tick carries no sample
        debug!("auto-sizer started ({:?} cadence)", self.config.adjust_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.adjust(),
            }
        }
        debug!("auto-sizer stopped");
    }

    /// One sizing pass over the current statistics.
    pub fn adjust(&self) {
        let stats = self.queue.stats();
        let running = self.executor.running();
        let current = self.executor.target();
        let desired = compute_target(
            stats.enqueue_rate,
            stats.dequeue_rate,
            running,
            stats.depth,
            current,
            self.config.min_workers,
            self.config.max_workers,
            self.config.target_queue_latency,
        );
        if desired != current {
            info!(
                "auto-sizer: workers {current} -> {desired} (lambda={:.0}/s drain={:.0}/s depth={})",
                stats.enqueue_rate, stats.dequeue_rate, stats.depth
            );
            self.executor.tune(desired);
            self.scale.record();
        }
    }
}

/// The sizing procedure, pure over its observed inputs.
///
/// 1. Per-worker throughput estimate: drain rate over running workers.
/// 2. Throughput baseline: ceil(lambda / mu-hat) when both are known.
/// 3. Little's-Law correction against the target depth L* = lambda * W:
///    inflate by depth/L* when over, shave 20% when under half of it.
/// 4. Clamp to the configured worker bounds.
///
/// The depth/L* multiplier carries no damping term, so consecutive deep
/// samples compound; the max bound is the only brake.
#[allow(clippy::too_many_arguments)]
pub fn compute_target(
    lambda: f64,
    dequeue_rate: f64,
    running: usize,
    depth: usize,
    current: usize,
    min_workers: usize,
    max_workers: usize,
    target_latency: Duration,
) -> usize {
    let mu_hat = if running > 0 && dequeue_rate > 0.0 {
        dequeue_rate / running as f64
    } else {
        0.0
    };

    let mut desired = current as f64;
    if mu_hat > 0.0 && lambda > 0.0 {
        desired = (lambda / mu_hat).ceil();
    }

    let target_depth = (lambda * target_latency.as_secs_f64()).max(min_workers as f64);
    let depth = depth as f64;
    if depth > target_depth {
        desired *= depth / target_depth;
    } else if depth < target_depth / 2.0 && desired > min_workers as f64 {
        desired *= 0.8;
    }

    (desired.ceil() as usize).clamp(min_workers, max_workers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_toward_observed_load() {
        // lambda = 2000/s against 1900/s drained by 20 workers: the
        // baseline asks for 22, the depth overshoot (500 vs L* = 100)
        // multiplies by 5, and the max bound caps the answer at 100.
        let target = compute_target(
            2000.0,
            1900.0,
            20,
            500,
            20,
            10,
            100,
            Duration::from_millis(50),
        );
        assert_eq!(target, 100);
    }

    #[test]
    fn idle_system_settles_at_minimum_without_thrash() {
        let mut current = 14;
        for _ in 0..20 {
            let next = compute_target(0.0, 0.0, current, 0, current, 10, 100, Duration::from_millis(50));
            assert!(next <= current, "an idle system never scales up");
            current = next;
        }
        assert_eq!(current, 10);
        // At the floor the answer is a fixed point.
        assert_eq!(
            compute_target(0.0, 0.0, 10, 0, 10, 10, 100, Duration::from_millis(50)),
            10
        );
    }

    #[test]
    fn shallow_queue_shaves_capacity() {
        // Healthy throughput, queue nearly empty: desired drops by 20%.
        let target = compute_target(
            100.0,
            100.0,
            10,
            0,
            10,
            2,
            100,
            Duration::from_millis(50),
        );
        // baseline ceil(100/10) = 10, then * 0.8 = 8
        assert_eq!(target, 8);
    }

    #[test]
    fn result_respects_bounds() {
        let target = compute_target(
            1_000_000.0,
            10.0,
            1,
            100_000,
            1,
            2,
            64,
            Duration::from_millis(50),
        );
        assert_eq!(target, 64);

        let target = compute_target(1.0, 1000.0, 100, 0, 100, 5, 64, Duration::from_millis(50));
        assert!(target >= 5);
    }
}
