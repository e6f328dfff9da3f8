use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::actions::{ActionContext, ActionRegistry};
use crate::storage::PersistenceGateway;
use crate::types::{Job, LogEntry, LogLevel, Outcome};

/// Result of one dispatch
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub outcome: Outcome,
    /// The action succeeded but asked to be completed externally
    pub parked: bool,
    pub logs: Vec<LogEntry>,
    pub duration: Duration,
}

/// Runs a single job against the action registry and normalizes the result
pub struct NodeDispatcher {
    registry: Arc<dyn ActionRegistry>,
    store: Arc<dyn PersistenceGateway>,
    default_timeout: Duration,
}

impl NodeDispatcher {
    pub fn new(
        registry: Arc<dyn ActionRegistry>,
        store: Arc<dyn PersistenceGateway>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            default_timeout,
        }
    }

    /// Execute a job. Never fails: every problem is folded into the outcome.
    pub async fn dispatch(&self, job: &Job, cancel: CancellationToken) -> DispatchReport {
        let start = Instant::now();
        let ctx = ActionContext::new(
            job.tenant_id.clone(),
            job.run_id,
            job.node_id.clone(),
            job.attempt,
            cancel,
        );

        ctx.log(
            LogLevel::Info,
            format!("dispatching {} (attempt {})", job.action, job.attempt),
        );
        let outcome = self.run(job, &ctx).await;
        let parked = outcome.is_success() && ctx.is_parked();
        if parked {
            ctx.log(LogLevel::Info, "parked until completed externally");
        } else {
            ctx.log(level_for(&outcome), describe(&outcome));
        }

        let logs = ctx.take_logs();
        for entry in &logs {
            if let Err(e) = self.store.append_log(job.run_id, &job.node_id, entry).await {
                tracing::warn!(
                    run_id = %job.run_id,
                    node_id = %job.node_id,
                    "Failed to persist node log: {:#}",
                    e
                );
            }
        }

        DispatchReport {
            outcome,
            parked,
            logs,
            duration: start.elapsed(),
        }
    }

    async fn run(&self, job: &Job, ctx: &ActionContext) -> Outcome {
        let Some(action) = self.registry.resolve(&job.action) else {
            return Outcome::permanent(format!("unknown action {}", job.action));
        };

        if let Err(e) = action.validate(&job.input) {
            return Outcome::permanent(e.to_string());
        }

        if ctx.is_cancelled() {
            return Outcome::Cancelled;
        }

        let limit = job.timeout.unwrap_or(self.default_timeout);
        let result = timeout(limit, action.execute(job.input.clone(), ctx)).await;

        if ctx.is_cancelled() {
            return Outcome::Cancelled;
        }

        match result {
            Ok(Ok(value)) => Outcome::success(value),
            Ok(Err(e)) => e.into_outcome(),
            Err(_) => {
                tracing::warn!(
                    run_id = %job.run_id,
                    node_id = %job.node_id,
                    "Job timed out after {:?}",
                    limit
                );
                Outcome::retryable(format!("timed out after {}ms", limit.as_millis()))
            }
        }
    }
}

fn level_for(outcome: &Outcome) -> LogLevel {
    match outcome {
        Outcome::Success { .. } => LogLevel::Info,
        Outcome::RetryableFailure { .. } | Outcome::Cancelled => LogLevel::Warn,
        Outcome::PermanentFailure { .. } => LogLevel::Error,
    }
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Success { .. } => "succeeded".to_string(),
        Outcome::RetryableFailure { reason } => format!("failed (retryable): {}", reason),
        Outcome::PermanentFailure { reason } => format!("failed: {}", reason),
        Outcome::Cancelled => "cancelled".to_string(),
    }
}
