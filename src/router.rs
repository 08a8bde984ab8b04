//! Result router: demultiplexes result batches into three class streams
//!
//! Single consumer of the pool's result batches, three bounded outbound
//! channels with independent downstream consumers. Sends block with a
//! diagnostic back-off loop rather than dropping: pulse dominates volume
//! and a stalled stream means the system is mis-sized, which the stall
//! logs make visible and the auto-sizer then corrects.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::warn;

use crate::job::{JobClass, JobResult};

/// Floor on the stall back-off so a tiny batch timeout cannot spin the
/// router hot.
const MIN_BACKOFF: Duration = Duration::from_millis(50);

/// The three outbound streams handed to external consumers
pub struct ResultStreams {
    pub pulse: mpsc::Receiver<Vec<JobResult>>,
    pub intervention: mpsc::Receiver<Vec<JobResult>>,
    pub code: mpsc::Receiver<Vec<JobResult>>,
}

struct Channels {
    pulse: mpsc::Sender<Vec<JobResult>>,
    intervention: mpsc::Sender<Vec<JobResult>>,
    code: mpsc::Sender<Vec<JobResult>>,
}

impl Channels {
    fn for_class(&self, class: JobClass) -> &mpsc::Sender<Vec<JobResult>> {
        match class {
            JobClass::Pulse => &self.pulse,
            JobClass::Intervention => &self.intervention,
            JobClass::Code => &self.code,
        }
    }
}

pub struct ResultRouter {
    /// Taken on close; a routed batch after close is dropped with a log.
    channels: Mutex<Option<Channels>>,
    backoff: Duration,
}

impl ResultRouter {
    /// Build the router and its three outbound streams, each buffered to
    /// roughly the worker count so a full fleet's in-flight results fit.
    pub fn new(max_workers: usize, result_batch_timeout: Duration) -> (Self, ResultStreams) {
        let depth = max_workers.max(1);
        let (pulse_tx, pulse_rx) = mpsc::channel(depth);
        let (intervention_tx, intervention_rx) = mpsc::channel(depth);
        let (code_tx, code_rx) = mpsc::channel(depth);
        let router = Self {
            channels: Mutex::new(Some(Channels {
                pulse: pulse_tx,
                intervention: intervention_tx,
                code: code_tx,
            })),
            backoff: result_batch_timeout.max(MIN_BACKOFF),
        };
        (
            router,
            ResultStreams {
                pulse: pulse_rx,
                intervention: intervention_rx,
                code: code_rx,
            },
        )
    }

    /// Demultiplex one batch by class and dispatch each sub-batch.
    pub async fn route(&self, batch: Vec<JobResult>) {
        if batch.is_empty() {
            return;
        }
        let mut pulse = Vec::new();
        let mut intervention = Vec::new();
        let mut code = Vec::new();
        for result in batch {
            match result.class() {
                JobClass::Pulse => pulse.push(result),
                JobClass::Intervention => intervention.push(result),
                JobClass::Code => code.push(result),
            }
        }
        self.dispatch(JobClass::Pulse, pulse).await;
        self.dispatch(JobClass::Intervention, intervention).await;
        self.dispatch(JobClass::Code, code).await;
    }

    async fn dispatch(&self, class: JobClass, sub_batch: Vec<JobResult>) {
        if sub_batch.is_empty() {
            return;
        }
        let size = sub_batch.len();
        let Some(tx) = self
            .channels
            .lock()
            .as_ref()
            .map(|c| c.for_class(class).clone())
        else {
            warn!("router closed; dropping {size} {class} results");
            return;
        };

        let mut pending = sub_batch;
        loop {
            match tx.send_timeout(pending, self.backoff).await {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(batch)) => {
                    warn!(
                        "{class} stream stalled for {:?}; retrying batch of {size}",
                        self.backoff
                    );
                    pending = batch;
                }
                Err(SendTimeoutError::Closed(_)) => {
                    warn!("{class} stream consumer gone; dropping batch of {size}");
                    return;
                }
            }
        }
    }

    /// Close all three outbound streams. Idempotent.
    pub fn close(&self) {
        self.channels.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ResultPayload;
    use std::sync::Arc;
    use uuid::Uuid;

    fn result(class: JobClass) -> JobResult {
        let payload = match class {
            JobClass::Pulse => ResultPayload::Pulse {
                healthy: true,
                latency: Duration::from_millis(2),
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
        JobResult::ok(Uuid::new_v4(), Uuid::new_v4(), payload)
    }

    #[tokio::test]
    async fn demuxes_by_class() {
        let (router, mut streams) = ResultRouter::new(8, Duration::from_millis(50));
        let batch = vec![
            result(JobClass::Pulse),
            result(JobClass::Code),
            result(JobClass::Pulse),
            result(JobClass::Intervention),
        ];
        router.route(batch).await;

        assert_eq!(streams.pulse.recv().await.unwrap().len(), 2);
        assert_eq!(streams.intervention.recv().await.unwrap().len(), 1);
        assert_eq!(streams.code.recv().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_classes_send_nothing() {
        let (router, mut streams) = ResultRouter::new(8, Duration::from_millis(50));
        router.route(vec![result(JobClass::Pulse)]).await;
        router.close();
        assert_eq!(streams.pulse.recv().await.unwrap().len(), 1);
        // Channel closed without an intervention batch ever sent.
        assert!(streams.intervention.recv().await.is_none());
    }

    #[tokio::test]
    async fn blocks_until_stalled_consumer_catches_up() {
        let (router, mut streams) = ResultRouter::new(1, Duration::from_millis(50));
        let router = Arc::new(router);

        // Fill the single-slot pulse channel, then route again; the
        // second dispatch must wait for the consumer.
        router.route(vec![result(JobClass::Pulse)]).await;
        let blocked = {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                router.route(vec![result(JobClass::Pulse)]).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!blocked.is_finished(), "dispatch should still be retrying");

        assert_eq!(streams.pulse.recv().await.unwrap().len(), 1);
        blocked.await.unwrap();
        assert_eq!(streams.pulse.recv().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_parks_at_capacity_and_resumes_when_freed() {
        let (router, mut streams) = ResultRouter::new(1, Duration::from_millis(50));
        router.route(vec![result(JobClass::Pulse)]).await; // fill the slot

        // Poll-level view of the same backpressure: the second dispatch
        // parks instead of completing or dropping.
        let mut blocked = tokio_test::task::spawn(router.route(vec![result(JobClass::Pulse)]));
        tokio_test::assert_pending!(blocked.poll());

        // Freeing the slot lets the parked dispatch finish.
        assert_eq!(streams.pulse.recv().await.unwrap().len(), 1);
        tokio_test::assert_ready!(blocked.poll());
        drop(blocked);
        assert_eq!(streams.pulse.recv().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_drops_later_batches() {
        let (router, mut streams) = ResultRouter::new(4, Duration::from_millis(50));
        router.close();
        router.close(); // idempotent
        router.route(vec![result(JobClass::Code)]).await;
        assert!(streams.code.recv().await.is_none());
    }
}
