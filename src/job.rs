//! Opaque job contract and typed execution results
//!
//! The core never looks inside a job: it stamps timestamps, moves the box
//! through a queue, runs `execute`, and routes the result by class. The
//! concrete bodies (HTTP probe, container restart, notification dispatch)
//! live with the monitor store, outside this crate.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three kinds of work a monitor can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobClass {
    /// Periodic health probe
    Pulse,
    /// Remediation triggered by a failed pulse
    Intervention,
    /// Notification dispatch triggered by a state change
    Code,
}

impl JobClass {
    /// All classes, in escalation order
    pub const ALL: [JobClass; 3] = [JobClass::Pulse, JobClass::Intervention, JobClass::Code];

    /// Short label used in log lines and channel names
    pub fn label(&self) -> &'static str {
        match self {
            JobClass::Pulse => "pulse",
            JobClass::Intervention => "intervention",
            JobClass::Code => "code",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An executable unit of monitoring work.
///
/// Implementations are external. The queue owns a job from admit to
/// dequeue, a worker owns it during `execute`, and afterwards the box is
/// either dropped or returned to a [`crate::freelist::JobFreelist`].
///
/// Absence is expressed as `Option<Box<dyn Job>>`; a present job is never
/// "empty", so there is no nil-test in this contract.
#[async_trait]
pub trait Job: Send + Sync {
    /// Unique identity of this unit of work
    fn id(&self) -> Uuid;

    /// The monitor entity that minted the job
    fn monitor_id(&self) -> Uuid;

    /// Class tag, used for result routing and freelist shelving
    fn class(&self) -> JobClass;

    /// Run the job to completion, consuming it. All I/O happens here.
    async fn execute(self: Box<Self>) -> JobResult;

    /// Independent copy with the same logical identity. Producers whose
    /// source is persistent clone before admitting so a refused admit
    /// loses nothing.
    fn clone_job(&self) -> Box<dyn Job>;

    /// When the queue admitted this job, if it has been admitted
    fn enqueue_time(&self) -> Option<Instant>;

    /// Stamped by the queue on admit
    fn set_enqueue_time(&mut self, t: Instant);

    /// When a worker picked this job up, if it has been dispatched
    fn start_time(&self) -> Option<Instant>;

    /// Stamped by the worker on dispatch
    fn set_start_time(&mut self, t: Instant);

    /// Zero every mutable field. Called before freelist reinsertion; a
    /// leaked `enqueue_time` corrupts wait statistics on reuse.
    fn reset(&mut self);
}

impl Clone for Box<dyn Job> {
    fn clone(&self) -> Self {
        self.clone_job()
    }
}

impl fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("class", &self.class())
            .finish()
    }
}

/// An ordered group of jobs admitted and dequeued together. All jobs in
/// one admit call share a single enqueue timestamp.
pub type Batch = Vec<Box<dyn Job>>;

/// Outcome of one `execute` call, routed downstream by payload class
pub struct JobResult {
    /// Identity of the job that produced this result
    pub job_id: Uuid,
    /// The monitor the job belonged to
    pub monitor_id: Uuid,
    /// Execution error, if the body failed
    pub error: Option<anyhow::Error>,
    /// Class-tagged payload
    pub payload: ResultPayload,
}

impl JobResult {
    /// Successful result
    pub fn ok(job_id: Uuid, monitor_id: Uuid, payload: ResultPayload) -> Self {
        Self {
            job_id,
            monitor_id,
            error: None,
            payload,
        }
    }

    /// Failed result carrying the body's error
    pub fn failed(
        job_id: Uuid,
        monitor_id: Uuid,
        payload: ResultPayload,
        error: anyhow::Error,
    ) -> Self {
        Self {
            job_id,
            monitor_id,
            error: Some(error),
            payload,
        }
    }

    /// Class tag the router demultiplexes on
    pub fn class(&self) -> JobClass {
        self.payload.class()
    }
}

impl fmt::Debug for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobResult")
            .field("job_id", &self.job_id)
            .field("class", &self.class())
            .field("ok", &self.error.is_none())
            .finish()
    }
}

/// Class-specific result payload.
///
/// A tagged sum type: the class discriminator and the payload cannot
/// disagree, and routing matches exhaustively.
#[derive(Debug, Clone)]
pub enum ResultPayload {
    /// Health-probe outcome
    Pulse {
        /// Whether the probe target answered healthily
        healthy: bool,
        /// Observed probe latency
        latency: Duration,
    },
    /// Remediation outcome
    Intervention {
        /// What was attempted, e.g. "container-restart"
        action: String,
        /// Whether the target recovered
        recovered: bool,
    },
    /// Notification dispatch outcome
    Code {
        /// Delivery channel, e.g. "slack" or "pagerduty"
        channel: String,
        /// Severity color attached to the notification
        color: String,
    },
}

impl ResultPayload {
    /// The class this payload belongs to
    pub fn class(&self) -> JobClass {
        match self {
            ResultPayload::Pulse { .. } => JobClass::Pulse,
            ResultPayload::Intervention { .. } => JobClass::Intervention,
            ResultPayload::Code { .. } => JobClass::Code,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Minimal job used across the crate's unit tests. The sequence
    /// number is encoded into the job id so order assertions can read it
    /// back from a dequeued trait object.
    pub struct StubJob {
        pub id: Uuid,
        pub monitor: Uuid,
        pub class: JobClass,
        pub seq: u64,
        pub enqueue_time: Option<Instant>,
        pub start_time: Option<Instant>,
    }

    impl StubJob {
        pub fn new(seq: u64) -> Self {
            Self {
                id: Uuid::from_u128(seq as u128),
                monitor: Uuid::new_v4(),
                class: JobClass::Pulse,
                seq,
                enqueue_time: None,
                start_time: None,
            }
        }

        pub fn with_class(seq: u64, class: JobClass) -> Self {
            Self {
                class,
                ..Self::new(seq)
            }
        }

        pub fn boxed(seq: u64) -> Box<dyn Job> {
            Box::new(Self::new(seq))
        }
    }

    #[async_trait]
    impl Job for StubJob {
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
            JobResult::ok(
                self.id,
                self.monitor,
                ResultPayload::Pulse {
                    healthy: true,
                    latency: Duration::from_millis(1),
                },
            )
        }

        fn clone_job(&self) -> Box<dyn Job> {
            Box::new(Self {
                id: self.id,
                monitor: self.monitor,
                class: self.class,
                seq: self.seq,
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

    /// Pull the sequence number back out of a dequeued trait object
    pub fn seq_of(job: &dyn Job) -> u64 {
        job.id().as_u128() as u64
    }
}
