//! Error types for the orchestrator.

use crate::tenant::TenantId;
use crate::types::{FlowId, NodeId, RunId};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The tenant has no queue partition (not provisioned).
    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),

    /// The tenant already exists.
    #[error("tenant already provisioned: {0}")]
    TenantExists(TenantId),

    /// The tenant is suspended and may not start new work.
    #[error("tenant is suspended: {0}")]
    TenantSuspended(TenantId),

    /// A tenant quota would be exceeded.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The requested state change is not legal from the current state.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Transient failure (network, timeout, rate limit).
    #[error("retryable failure: {0}")]
    RetryableFailure(String),

    /// Non-retryable failure (validation, missing action, programmer error).
    #[error("permanent failure: {0}")]
    PermanentFailure(String),

    /// The run was stopped while the operation was in progress.
    #[error("cancellation requested")]
    CancellationRequested,

    /// A job for this (run, node) pair is already live.
    #[error("job already in flight for run {run_id} node {node_id}")]
    DuplicateJob { run_id: RunId, node_id: NodeId },

    #[error("flow not found: {0}")]
    FlowNotFound(FlowId),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// The flow definition is not a valid DAG.
    #[error("invalid flow: {0}")]
    InvalidFlow(String),

    /// Persistence gateway failure.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Wrap a persistence failure, keeping engine errors the gateway raised itself
    pub fn from_gateway(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(other) => Self::Storage(other),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableFailure(_) | Self::Storage(_))
    }

    /// Whether the caller (rather than the engine) is at fault.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownTenant(_)
                | Self::TenantExists(_)
                | Self::TenantSuspended(_)
                | Self::QuotaExceeded(_)
                | Self::InvalidTransition { .. }
                | Self::FlowNotFound(_)
                | Self::RunNotFound(_)
                | Self::InvalidFlow(_)
        )
    }
}
