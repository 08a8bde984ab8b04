//! End-to-end pipeline tests: collector -> queue -> pool -> router

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use watchman_core::{
    BatchCollector, CollectorConfig, DynamicPool, Job, JobClass, JobQueue, JobResult, PoolConfig,
    PoolState, QueueConfig, QueueKind, ResultPayload, ResultStreams,
};

/// Probe-shaped job whose sequence number is encoded in its id, so
/// assertions can recover it from results.
struct ProbeJob {
    id: Uuid,
    monitor: Uuid,
    class: JobClass,
    work: Duration,
    enqueue_time: Option<Instant>,
    start_time: Option<Instant>,
}

impl ProbeJob {
    fn new(seq: u64, class: JobClass, work: Duration) -> Box<dyn Job> {
        Box::new(Self {
            id: Uuid::from_u128(seq as u128),
            monitor: Uuid::new_v4(),
            class,
            work,
            enqueue_time: None,
            start_time: None,
        })
    }
}

#[async_trait]
impl Job for ProbeJob {
    fn id(&self) -> Uuid {
        self.id
    }

    fn monitor_id(&self) -> Uuid {
        self.monitor
    }

    fn class(&self) -> JobClass {
        self.class
    }

    async fn execute(self: Box<Self>) -> JobResult {
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        let payload = match self.class {
            JobClass::Pulse => ResultPayload::Pulse {
                healthy: true,
                latency: self.work,
            },
            JobClass::Intervention => ResultPayload::Intervention {
                action: "container-restart".into(),
                recovered: true,
            },
            JobClass::Code => ResultPayload::Code {
                channel: "slack".into(),
                color: "green".into(),
            },
        };
        JobResult::ok(self.id, self.monitor, payload)
    }

    fn clone_job(&self) -> Box<dyn Job> {
        Box::new(Self {
            id: self.id,
            monitor: self.monitor,
            class: self.class,
            work: self.work,
            enqueue_time: self.enqueue_time,
            start_time: self.start_time,
        })
    }

    fn enqueue_time(&self) -> Option<Instant> {
        self.enqueue_time
    }

    fn set_enqueue_time(&mut self, t: Instant) {
        self.enqueue_time = Some(t);
    }

    fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    fn set_start_time(&mut self, t: Instant) {
        self.start_time = Some(t);
    }

    fn reset(&mut self) {
        self.enqueue_time = None;
        self.start_time = None;
    }
}

fn class_for(seq: u64) -> JobClass {
    match seq % 3 {
        0 => JobClass::Pulse,
        1 => JobClass::Intervention,
        _ => JobClass::Code,
    }
}

fn hybrid_queue(capacity: usize, overflow: usize) -> Arc<dyn JobQueue> {
    watchman_core::queue::build(&QueueConfig {
        kind: QueueKind::Hybrid,
        capacity,
        overflow_capacity: overflow,
        ..QueueConfig::default()
    })
    .expect("valid queue config")
}

async fn recv_all(streams: &mut ResultStreams, expected: usize) -> Vec<JobResult> {
    let mut results = Vec::with_capacity(expected);
    let deadline = Duration::from_secs(10);
    while results.len() < expected {
        let next = tokio::time::timeout(deadline, async {
            tokio::select! {
                Some(batch) = streams.pulse.recv() => batch,
                Some(batch) = streams.intervention.recv() => batch,
                Some(batch) = streams.code.recv() => batch,
            }
        })
        .await
        .expect("pipeline delivered results before the deadline");
        results.extend(next);
    }
    results
}

#[tokio::test]
async fn collector_to_router_round_trip() {
    const JOBS: u64 = 30;

    let queue = hybrid_queue(256, 256);
    let (pool, mut streams) = DynamicPool::new(
        Arc::clone(&queue),
        PoolConfig {
            min_workers: 2,
            max_workers: 8,
            target_queue_latency: Duration::from_millis(50),
            result_batch_size: 8,
            result_batch_timeout: Duration::from_millis(20),
            adjust_interval: Duration::ZERO,
        },
    )
    .unwrap();
    pool.start().unwrap();

    let collector = BatchCollector::new(
        Arc::clone(&queue),
        CollectorConfig {
            batch_size: 5,
            flush_timeout: Duration::from_millis(20),
        },
    )
    .unwrap();

    for seq in 0..JOBS {
        collector
            .add(ProbeJob::new(seq, class_for(seq), Duration::ZERO))
            .unwrap();
    }
    collector.close().await.unwrap();

    let results = recv_all(&mut streams, JOBS as usize).await;
    assert_eq!(results.len(), JOBS as usize);

    // Every job came back exactly once, on the stream of its class.
    let mut seen: Vec<u64> = results.iter().map(|r| r.job_id.as_u128() as u64).collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), JOBS as usize, "no result may appear twice");
    for result in &results {
        assert_eq!(result.class(), class_for(result.job_id.as_u128() as u64));
        assert!(result.error.is_none());
    }

    // Orderly shutdown: producers closed, then the queue, then the pool.
    queue.close();
    pool.drain_and_stop().await;
    assert_eq!(pool.state(), PoolState::Stopped);

    let qs = queue.stats();
    assert_eq!(qs.enqueued, JOBS);
    assert_eq!(qs.dequeued, JOBS);
    assert_eq!(qs.enqueued, qs.dequeued + qs.depth as u64 + qs.dropped);
    assert!(qs.avg_wait <= qs.max_wait);

    let ps = pool.stats();
    assert_eq!(ps.completed, JOBS);
    assert_eq!(ps.failed, 0);
}

#[tokio::test]
async fn closing_the_queue_ends_the_dispatcher() {
    let queue = hybrid_queue(64, 64);
    let (pool, mut streams) = DynamicPool::new(
        Arc::clone(&queue),
        PoolConfig {
            min_workers: 1,
            max_workers: 2,
            target_queue_latency: Duration::from_millis(50),
            result_batch_size: 4,
            result_batch_timeout: Duration::from_millis(10),
            adjust_interval: Duration::ZERO,
        },
    )
    .unwrap();
    pool.start().unwrap();

    for seq in 0..6 {
        queue
            .enqueue(ProbeJob::new(seq, JobClass::Pulse, Duration::ZERO))
            .unwrap();
    }
    queue.close();

    // Everything admitted before close still flows through.
    let results = recv_all(&mut streams, 6).await;
    assert_eq!(results.len(), 6);

    pool.drain_and_stop().await;
    assert_eq!(pool.state(), PoolState::Stopped);
    assert!(matches!(
        queue.dequeue(),
        Err(watchman_core::CoreError::Closed)
    ));
}

#[tokio::test]
async fn auto_sizer_scales_up_under_backlog() {
    let queue = hybrid_queue(512, 512);
    let (pool, mut streams) = DynamicPool::new(
        Arc::clone(&queue),
        PoolConfig {
            min_workers: 2,
            max_workers: 8,
            target_queue_latency: Duration::from_millis(50),
            result_batch_size: 16,
            result_batch_timeout: Duration::from_millis(20),
            adjust_interval: Duration::from_millis(50),
        },
    )
    .unwrap();
    pool.start().unwrap();

    // Slow jobs against two workers: a backlog forms and the sizer must
    // push the target above the minimum.
    for seq in 0..200 {
        queue
            .enqueue(ProbeJob::new(seq, JobClass::Pulse, Duration::from_millis(20)))
            .unwrap();
    }

    let grew = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pool.stats().target > 2 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or(false);
    assert!(grew, "auto-sizer never raised the target above min_workers");
    assert!(pool.stats().scaling_events >= 1);

    // Drain the streams so the router never wedges, then shut down.
    let consume = tokio::spawn(async move {
        let mut total = 0usize;
        while let Some(batch) = streams.pulse.recv().await {
            total += batch.len();
        }
        total
    });
    queue.close();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queue drained");
    pool.drain_and_stop().await;
    let delivered = consume.await.unwrap();
    assert!(delivered > 0);
}

#[tokio::test]
async fn drain_under_load_is_bounded_and_clean() {
    let queue = hybrid_queue(256, 256);
    let (pool, _streams) = DynamicPool::new(
        Arc::clone(&queue),
        PoolConfig {
            min_workers: 2,
            max_workers: 4,
            target_queue_latency: Duration::from_millis(50),
            result_batch_size: 8,
            result_batch_timeout: Duration::from_millis(20),
            adjust_interval: Duration::ZERO,
        },
    )
    .unwrap();
    pool.start().unwrap();

    for seq in 0..100 {
        queue
            .enqueue(ProbeJob::new(seq, class_for(seq), Duration::from_millis(5)))
            .unwrap();
    }

    // Stop mid-flight; the ceiling is 5x the latency target, so this
    // must return promptly even with work outstanding.
    let started = Instant::now();
    pool.drain_and_stop().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(pool.state(), PoolState::Stopped);

    let qs = queue.stats();
    assert_eq!(qs.enqueued, qs.dequeued + qs.depth as u64 + qs.dropped);
}
