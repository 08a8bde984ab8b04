//! Configuration for the scheduling core
//!
//! Plain structs with defaults and validation. The controller binary owns
//! loading (env, files); this crate only defines what the core recognizes
//! and rejects anything inconsistent at construction time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{CoreError, Result};

/// Which queue implementation backs the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Fixed-capacity lock-free ring
    Ring,
    /// Linked ring segments that double when the tail fills
    Expanding,
    /// Ring fast path with a mutex-guarded overflow list
    #[default]
    Hybrid,
}

/// What happens when both the ring and the overflow list are saturated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Admit fails; the producer decides what to do with the job
    #[default]
    Reject,
    /// Admit fails; the refused job is accounted as dropped
    DropNewest,
    /// Evict the oldest overflowed job to make room for the new one
    DropOldest,
}

/// Queue construction options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Implementation selector
    pub kind: QueueKind,
    /// Ring capacity; must be a power of two for ring and hybrid
    pub capacity: usize,
    /// Overflow list depth (hybrid only)
    pub overflow_capacity: usize,
    /// Fill fraction of the overflow list that raises a warning, in (0, 1]
    pub soft_watermark: f64,
    /// Fill fraction beyond which admits are refused, in (0, 1]
    pub hard_watermark: f64,
    /// Saturation policy (hybrid only)
    pub drop_policy: DropPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: QueueKind::Hybrid,
            capacity: 8192,
            overflow_capacity: 4096,
            soft_watermark: 0.75,
            hard_watermark: 1.0,
            drop_policy: DropPolicy::Reject,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(CoreError::InvalidConfig("queue capacity must be > 0".into()));
        }
        if matches!(self.kind, QueueKind::Ring | QueueKind::Hybrid)
            && !self.capacity.is_power_of_two()
        {
            return Err(CoreError::InvalidConfig(format!(
                "ring capacity must be a power of two, got {}",
                self.capacity
            )));
        }
        for (name, w) in [
            ("soft_watermark", self.soft_watermark),
            ("hard_watermark", self.hard_watermark),
        ] {
            if !(w > 0.0 && w <= 1.0) {
                return Err(CoreError::InvalidConfig(format!(
                    "{name} must be in (0, 1], got {w}"
                )));
            }
        }
        if self.soft_watermark > self.hard_watermark {
            return Err(CoreError::InvalidConfig(format!(
                "soft_watermark {} exceeds hard_watermark {}",
                self.soft_watermark, self.hard_watermark
            )));
        }
        Ok(())
    }
}

/// Batch collector coalescing thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Buffer size that triggers a synchronous flush
    pub batch_size: usize,
    /// Maximum age of a non-empty buffer before the ticker flushes it
    pub flush_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            flush_timeout: Duration::from_millis(100),
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CoreError::InvalidConfig(
                "collector batch_size must be > 0".into(),
            ));
        }
        if self.flush_timeout.is_zero() {
            return Err(CoreError::InvalidConfig(
                "collector flush_timeout must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Dynamic worker pool options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Lower bound on worker count
    pub min_workers: usize,
    /// Upper bound on worker count
    pub max_workers: usize,
    /// Latency SLO the auto-sizer steers toward
    pub target_queue_latency: Duration,
    /// Result batch size flushed to the router
    pub result_batch_size: usize,
    /// Maximum age of a partial result batch before it is flushed
    pub result_batch_timeout: Duration,
    /// Auto-sizer cadence; zero disables auto-sizing entirely
    pub adjust_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 64,
            target_queue_latency: Duration::from_millis(50),
            result_batch_size: 64,
            result_batch_timeout: Duration::from_millis(100),
            adjust_interval: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            return Err(CoreError::InvalidConfig("min_workers must be > 0".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(CoreError::InvalidConfig(format!(
                "min_workers {} exceeds max_workers {}",
                self.min_workers, self.max_workers
            )));
        }
        if self.result_batch_size == 0 {
            return Err(CoreError::InvalidConfig(
                "result_batch_size must be > 0".into(),
            ));
        }
        if self.target_queue_latency.is_zero() {
            return Err(CoreError::InvalidConfig(
                "target_queue_latency must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Inputs to the sizing oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Mean service time of a pulse probe
    pub service_time_pulse: Duration,
    /// Mean service time of a remediation
    pub service_time_intervention: Duration,
    /// Mean service time of a notification dispatch
    pub service_time_code: Duration,
    /// Probability that a pulse fails and escalates to an intervention
    pub failure_prob: f64,
    /// Probability that an intervention emits a notification
    pub escalation_prob: f64,
    /// Target utilization rho* the initial sizing aims for, in (0, 1)
    pub target_utilization: f64,
    /// Target queue wait W_q* for latency-driven sizing
    pub target_queue_wait: Duration,
    /// Worker bounds applied to every recommendation
    pub min_workers: usize,
    pub max_workers: usize,
    /// Queue-capacity bounds applied to initial sizing
    pub min_queue: usize,
    pub max_queue: usize,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            service_time_pulse: Duration::from_millis(100),
            service_time_intervention: Duration::from_secs(2),
            service_time_code: Duration::from_millis(300),
            failure_prob: 0.05,
            escalation_prob: 0.5,
            target_utilization: 0.7,
            target_queue_wait: Duration::from_millis(100),
            min_workers: 2,
            max_workers: 64,
            min_queue: 1024,
            max_queue: 1 << 20,
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.target_utilization > 0.0 && self.target_utilization < 1.0) {
            return Err(CoreError::InvalidConfig(format!(
                "target_utilization must be in (0, 1), got {}",
                self.target_utilization
            )));
        }
        for (name, p) in [
            ("failure_prob", self.failure_prob),
            ("escalation_prob", self.escalation_prob),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(CoreError::InvalidConfig(format!(
                    "{name} must be in [0, 1], got {p}"
                )));
            }
        }
        if self.min_workers == 0 || self.min_workers > self.max_workers {
            return Err(CoreError::InvalidConfig(format!(
                "worker bounds [{}, {}] are invalid",
                self.min_workers, self.max_workers
            )));
        }
        if self.min_queue == 0 || self.min_queue > self.max_queue {
            return Err(CoreError::InvalidConfig(format!(
                "queue bounds [{}, {}] are invalid",
                self.min_queue, self.max_queue
            )));
        }
        Ok(())
    }
}

/// Shared outbound HTTP transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout
    pub request_timeout: Duration,
    /// Idle connections kept per host for reuse
    pub pool_max_idle_per_host: usize,
    /// How long an idle connection stays pooled
    pub pool_idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Aggregate configuration for the whole core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub queue: QueueConfig,
    pub collector: CollectorConfig,
    pub pool: PoolConfig,
    pub sizing: SizingConfig,
    pub transport: TransportConfig,
}

impl CoreConfig {
    /// Validate every section; the first violation wins
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.collector.validate()?;
        self.pool.validate()?;
        self.sizing.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CoreConfig::default().validate().expect("defaults are sane");
    }

    #[test]
    fn ring_capacity_must_be_power_of_two() {
        let cfg = QueueConfig {
            kind: QueueKind::Ring,
            capacity: 100,
            ..QueueConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(CoreError::InvalidConfig(_))
        ));

        // The expanding queue has no such restriction on its seed segment
        let cfg = QueueConfig {
            kind: QueueKind::Expanding,
            capacity: 100,
            ..QueueConfig::default()
        };
        cfg.validate().expect("expanding accepts any capacity");
    }

    #[test]
    fn watermark_ordering_enforced() {
        let cfg = QueueConfig {
            soft_watermark: 0.9,
            hard_watermark: 0.5,
            ..QueueConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = QueueConfig {
            soft_watermark: 0.0,
            ..QueueConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn worker_bounds_enforced() {
        let cfg = PoolConfig {
            min_workers: 10,
            max_workers: 5,
            ..PoolConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn kinds_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&QueueKind::Hybrid).unwrap(),
            "\"hybrid\""
        );
        assert_eq!(
            serde_json::to_string(&DropPolicy::DropOldest).unwrap(),
            "\"drop_oldest\""
        );
    }
}
