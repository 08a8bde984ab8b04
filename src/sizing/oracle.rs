//! Closed-form sizing math
//!
//! Pure functions: Little's Law for the latency-driven depth target,
//! Erlang-C for the probability of wait in an M/M/c system, and the
//! Allen-Cunneen inflation for non-Poisson variability. Used once at
//! startup to size the pool from a fleet summary, and periodically to
//! sanity-check the observed steady state.

use std::time::Duration;

use crate::config::SizingConfig;
use crate::pool::PoolStats;
use crate::queue::QueueStats;
use crate::types::{CoreError, Result};

/// Service times below this are treated as 1 ms to keep the math finite.
const MIN_SERVICE_TIME: Duration = Duration::from_millis(1);

/// What the controller knows about the fleet before any job has run
#[derive(Debug, Clone, Default)]
pub struct WorldSummary {
    /// Total monitor count
    pub monitors: u64,
    /// Probe interval histogram: (interval, monitors on that interval).
    /// Preferred over `mean_interval` when non-empty.
    pub interval_histogram: Vec<(Duration, u64)>,
    /// Fallback mean probe interval when no histogram is available
    pub mean_interval: Duration,
}

/// Initial sizing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizingPlan {
    pub workers: usize,
    pub queue_capacity: usize,
}

/// Size the pool and queue before any traffic exists.
///
/// Arrival rates derive from the probe intervals; intervention and code
/// rates follow from the failure and escalation probabilities. A fleet
/// with no derivable arrivals gets the configured minimums.
pub fn initial_sizing(world: &WorldSummary, config: &SizingConfig) -> SizingPlan {
    let lambda_pulse: f64 = if !world.interval_histogram.is_empty() {
        world
            .interval_histogram
            .iter()
            .filter(|(interval, _)| !interval.is_zero())
            .map(|(interval, count)| *count as f64 / interval.as_secs_f64())
            .sum()
    } else if !world.mean_interval.is_zero() {
        world.monitors as f64 / world.mean_interval.as_secs_f64()
    } else {
        0.0
    };
    let lambda_intervention = lambda_pulse * config.failure_prob;
    let lambda_code = lambda_intervention * config.escalation_prob;
    let lambda = lambda_pulse + lambda_intervention + lambda_code;

    if lambda <= 0.0 {
        return SizingPlan {
            workers: config.min_workers,
            queue_capacity: config.min_queue,
        };
    }

    // Mixture mean service time, weighted by class arrival rate
    let weighted: f64 = [
        (lambda_pulse, config.service_time_pulse),
        (lambda_intervention, config.service_time_intervention),
        (lambda_code, config.service_time_code),
    ]
    .iter()
    .map(|(rate, service)| rate * service.as_secs_f64())
    .sum();
    let mean_service = (weighted / lambda).max(MIN_SERVICE_TIME.as_secs_f64());
    let mu = 1.0 / mean_service;

    let workers = (lambda / (mu * config.target_utilization)).ceil() as usize;
    let queue_capacity = (lambda * config.target_queue_wait.as_secs_f64()).ceil() as usize;
    SizingPlan {
        workers: workers.clamp(config.min_workers, config.max_workers),
        queue_capacity: queue_capacity.clamp(config.min_queue, config.max_queue),
    }
}

/// Erlang-C probability that an arriving job must wait, for an M/M/c
/// system with arrival rate `lambda` and per-worker service rate `mu`.
/// Fails with `Unstable` when utilization is at or above 1.
pub fn erlang_c(lambda: f64, mu: f64, c: u32) -> Result<f64> {
    if c == 0 || mu <= 0.0 {
        return Err(CoreError::Unstable {
            lambda,
            mu,
            workers: c,
        });
    }
    let offered = lambda / mu;
    let rho = offered / c as f64;
    if rho >= 1.0 {
        return Err(CoreError::Unstable {
            lambda,
            mu,
            workers: c,
        });
    }
    // Accumulate a^n / n! by recurrence; factorials never materialize.
    let mut term = 1.0_f64;
    let mut sum = 1.0_f64;
    for n in 1..c {
        term *= offered / n as f64;
        sum += term;
    }
    let term_c = term * offered / c as f64;
    let waiting = term_c / (1.0 - rho);
    Ok(waiting / (sum + waiting))
}

/// Expected total latency (queue wait plus service) at `c` workers.
///
/// When both variability coefficients are given, the queue-wait portion
/// is inflated by the Allen-Cunneen factor `(Ca^2 + Cs^2) / 2`, floored
/// at 1 so well-behaved traffic is never rewarded below M/M/c.
pub fn expected_latency(
    lambda: f64,
    service_time: Duration,
    c: u32,
    ca: Option<f64>,
    cs: Option<f64>,
) -> Result<Duration> {
    let tau = service_time
        .max(MIN_SERVICE_TIME)
        .as_secs_f64();
    let mu = 1.0 / tau;
    let p_wait = erlang_c(lambda, mu, c)?;
    let mut wait = p_wait / (c as f64 * mu - lambda);
    if let (Some(ca), Some(cs)) = (ca, cs) {
        wait *= ((ca * ca + cs * cs) / 2.0).max(1.0);
    }
    Ok(Duration::from_secs_f64(wait + tau))
}

/// Smallest worker count whose expected total latency meets `target`.
///
/// Starts just above the stability floor and walks upward; a target the
/// math can never meet returns `Unstable` instead of looping.
pub fn find_c_for_slo(
    lambda: f64,
    service_time: Duration,
    target: Duration,
    ca: Option<f64>,
    cs: Option<f64>,
    max_c: u32,
) -> Result<u32> {
    let tau = service_time.max(MIN_SERVICE_TIME).as_secs_f64();
    let mu = 1.0 / tau;
    let mut c = ((lambda / mu).ceil() as u32 + 1).max(1);
    while c <= max_c {
        if let Ok(latency) = expected_latency(lambda, service_time, c, ca, cs) {
            if latency <= target {
                return Ok(c);
            }
        }
        c += 1;
    }
    Err(CoreError::Unstable {
        lambda,
        mu,
        workers: max_c,
    })
}

/// Recommend a worker count from observed queue and pool statistics.
///
/// Arrival rate comes from the queue; per-job service time is inferred
/// from how many workers sustain the observed drain rate. Without a
/// usable signal the configured minimum stands.
pub fn recommend_from_observed(
    queue: &QueueStats,
    pool: &PoolStats,
    config: &SizingConfig,
) -> Result<u32> {
    if queue.enqueue_rate <= 0.0 || queue.dequeue_rate <= 0.0 || pool.running == 0 {
        return Ok(config.min_workers as u32);
    }
    let tau = Duration::from_secs_f64(pool.running as f64 / queue.dequeue_rate);
    let target = config.target_queue_wait + tau;
    find_c_for_slo(
        queue.enqueue_rate,
        tau,
        target,
        None,
        None,
        config.max_workers as u32,
    )
}
