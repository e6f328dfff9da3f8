use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::RetryPolicy;

/// Tunables for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of the worker pool pulling jobs from the queue
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Jobs a single tenant may have dispatched at once (unless its quota overrides it)
    #[serde(default = "default_tenant_in_flight_cap")]
    pub tenant_in_flight_cap: u32,

    /// Attempts per job, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential retry backoff
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Per-job timeout when the node does not set one
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Queued jobs per tenant above which graph expansion is deferred; 0 disables the limit
    #[serde(default = "default_queue_high_watermark")]
    pub queue_high_watermark: usize,
}

fn default_worker_count() -> usize {
    4
}

fn default_tenant_in_flight_cap() -> u32 {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_job_timeout_secs() -> u64 {
    30
}

fn default_queue_high_watermark() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            tenant_in_flight_cap: default_tenant_in_flight_cap(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            queue_high_watermark: default_queue_high_watermark(),
        }
    }
}

impl EngineConfig {
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_ms: self.backoff_ms,
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Jobs a tenant with `queued` jobs waiting may still enqueue
    pub fn queue_budget(&self, queued: usize) -> usize {
        match self.queue_high_watermark {
            0 => usize::MAX,
            watermark => watermark.saturating_sub(queued),
        }
    }
}
