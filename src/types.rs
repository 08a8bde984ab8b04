//! Shared error and result types for the scheduling core

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the scheduling core
#[derive(Debug, Error)]
pub enum CoreError {
    /// The queue refused an admit because every buffer it manages is
    /// saturated under the configured drop policy. Recoverable at the
    /// producer (retry with back-off, or re-mint the job later).
    #[error("queue full")]
    Full,

    /// Shutdown has started. Admits fail immediately; dequeues drain
    /// remaining jobs first and only then report this.
    #[error("queue closed")]
    Closed,

    /// Component construction failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A job broke its behavioral contract, e.g. a `reset` that left
    /// mutable state in place on a freelist return.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The sizing oracle could not find a worker count that keeps the
    /// system stable (utilization below 1) within the allowed bounds.
    #[error("no stable worker count for lambda={lambda:.1}/s mu={mu:.1}/s within {workers} workers")]
    Unstable { lambda: f64, mu: f64, workers: u32 },

    /// The executor's submission queue is at its bound. The dispatcher
    /// has already dequeued the job, so the caller must treat it as lost.
    #[error("executor saturated, submission rejected")]
    PoolSaturated,
}
