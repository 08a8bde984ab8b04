//! Watchman core - job scheduling and execution for fleet monitoring
//!
//! The pipeline at the center of the Watchman controller: monitors mint
//! pulse, intervention, and code jobs; this crate moves them through a
//! bounded queue, executes them on a worker pool that resizes itself
//! from queueing-theory targets, and routes the results into three
//! class streams.
//!
//! ## Components
//!
//! - **Queue**: one trait, three implementations (lock-free ring,
//!   expanding segments, ring-plus-overflow hybrid); the factory picks
//!   by configuration, hybrid by default
//! - **Collector**: coalesces per-job producers into batch admits
//! - **Pool**: dispatcher, tunable executor, result processor
//! - **Router**: demultiplexes result batches by job class with bounded
//!   backpressure
//! - **Sizing**: Little's-Law auto-sizer plus Erlang-C closed forms for
//!   initial and steady-state recommendations
//! - **Transport**: shared reuse-friendly HTTP client for probe bodies
//!
//! Everything upstream (monitor files, entity store, concrete job
//! bodies) and downstream (result consumers) lives with the controller.

pub mod collector;
pub mod config;
pub mod freelist;
pub mod job;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod router;
pub mod sizing;
pub mod transport;
pub mod types;

pub use collector::BatchCollector;
pub use config::{
    CollectorConfig, CoreConfig, DropPolicy, PoolConfig, QueueConfig, QueueKind, SizingConfig,
    TransportConfig,
};
pub use freelist::JobFreelist;
pub use job::{Batch, Job, JobClass, JobResult, ResultPayload};
pub use pool::{DynamicPool, PoolState, PoolStats};
pub use queue::{JobQueue, QueueStats};
pub use router::{ResultRouter, ResultStreams};
pub use sizing::oracle::{
    erlang_c, expected_latency, find_c_for_slo, initial_sizing, recommend_from_observed,
};
pub use sizing::{compute_target, SizingPlan, WorldSummary};
pub use transport::{HttpTransport, ProbeOutcome};
pub use types::{CoreError, Result};
