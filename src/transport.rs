//! Shared outbound HTTP transport
//!
//! One pooled client for the whole fleet's probe traffic. The scheduler
//! never interprets it; pulse and notification bodies consume it. The
//! transport outlives all jobs and is released only when the controller
//! shuts down.

use std::time::{Duration, Instant};

use crate::config::TransportConfig;
use crate::types::{CoreError, Result};

/// Cloneable handle around a connection-reusing HTTP client
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

/// What a single HTTP probe observed
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// HTTP status, when a response arrived at all
    pub status: Option<u16>,
    /// Time from send to response or failure
    pub latency: Duration,
    /// Transport-level failure, if any
    pub error: Option<String>,
}

impl ProbeOutcome {
    /// A probe is healthy when the target answered with a 2xx
    pub fn healthy(&self) -> bool {
        self.error.is_none() && self.status.is_some_and(|s| (200..300).contains(&s))
    }
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build()
            .map_err(|e| CoreError::InvalidConfig(format!("http transport: {e}")))?;
        Ok(Self { client })
    }

    /// Direct access for job bodies that need more than a plain GET
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Issue a GET against `url` and report status and latency. Never
    /// returns an error: probe failures are data, not faults.
    pub async fn probe(&self, url: &str) -> ProbeOutcome {
        let started = Instant::now();
        match self.client.get(url).send().await {
            Ok(response) => ProbeOutcome {
                status: Some(response.status().as_u16()),
                latency: started.elapsed(),
                error: None,
            },
            Err(e) => ProbeOutcome {
                status: e.status().map(|s| s.as_u16()),
                latency: started.elapsed(),
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_defaults() {
        HttpTransport::new(&TransportConfig::default()).expect("default transport builds");
    }

    #[test]
    fn healthy_requires_2xx_and_no_error() {
        let ok = ProbeOutcome {
            status: Some(204),
            latency: Duration::from_millis(3),
            error: None,
        };
        assert!(ok.healthy());

        let server_error = ProbeOutcome {
            status: Some(503),
            latency: Duration::from_millis(3),
            error: None,
        };
        assert!(!server_error.healthy());

        let refused = ProbeOutcome {
            status: None,
            latency: Duration::from_millis(3),
            error: Some("connection refused".into()),
        };
        assert!(!refused.healthy());
    }
}
