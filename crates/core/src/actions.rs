//! Executable node actions and the registry that resolves them.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::tenant::TenantId;
use crate::types::{ActionRef, LogEntry, LogLevel, NodeId, Outcome, RunId};

/// Failure reported by an action
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("rate limited, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ActionError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }

    pub fn into_outcome(self) -> Outcome {
        if self.is_retryable() {
            Outcome::retryable(self.to_string())
        } else {
            Outcome::permanent(self.to_string())
        }
    }
}

/// What an action sees of the job it runs for
pub struct ActionContext {
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub cancel: CancellationToken,
    logs: Mutex<Vec<LogEntry>>,
    parked: AtomicBool,
}

impl ActionContext {
    pub fn new(
        tenant_id: TenantId,
        run_id: RunId,
        node_id: NodeId,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tenant_id,
            run_id,
            node_id,
            attempt,
            cancel,
            logs: Mutex::new(Vec::new()),
            parked: AtomicBool::new(false),
        }
    }

    /// Append a line to the job's log buffer
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logs
            .lock()
            .push(LogEntry::new(level, message).for_node(&self.node_id));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Leave the node running after a successful return. Its outcome is
    /// reported later through `ExecutionController::complete_node`.
    pub fn park(&self) {
        self.parked.store(true, Ordering::Release);
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }

    pub(crate) fn take_logs(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.logs.lock())
    }
}

/// A unit of node behaviour. Implementations must be safe to call concurrently.
#[async_trait::async_trait]
pub trait ExecutableAction: Send + Sync {
    async fn execute(&self, input: Value, ctx: &ActionContext) -> Result<Value, ActionError>;

    /// Reject input before execution. Failures are never retried.
    fn validate(&self, _input: &Value) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Resolves action references to executable actions
pub trait ActionRegistry: Send + Sync {
    fn resolve(&self, action: &ActionRef) -> Option<Arc<dyn ExecutableAction>>;
}

/// Action registry backed by a map
#[derive(Default)]
pub struct InMemoryActionRegistry {
    actions: RwLock<HashMap<ActionRef, Arc<dyn ExecutableAction>>>,
}

impl InMemoryActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `core.*` actions
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("core.echo", EchoAction);
        registry.register("core.delay", DelayAction);
        registry.register("core.fail", FailAction);
        registry.register("core.set", SetAction);
        registry.register("core.wait", WaitAction);
        registry
    }

    pub fn register(&self, action: impl Into<String>, handler: impl ExecutableAction + 'static) {
        self.register_arc(ActionRef::new(action), Arc::new(handler));
    }

    pub fn register_arc(&self, action: ActionRef, handler: Arc<dyn ExecutableAction>) {
        tracing::debug!(action = %action, "Registered action");
        self.actions.write().insert(action, handler);
    }

    pub fn actions(&self) -> Vec<ActionRef> {
        let mut actions: Vec<ActionRef> = self.actions.read().keys().cloned().collect();
        actions.sort_by(|a, b| a.0.cmp(&b.0));
        actions
    }
}

impl ActionRegistry for InMemoryActionRegistry {
    fn resolve(&self, action: &ActionRef) -> Option<Arc<dyn ExecutableAction>> {
        self.actions.read().get(action).cloned()
    }
}

/// Returns its input unchanged
pub struct EchoAction;

#[async_trait::async_trait]
impl ExecutableAction for EchoAction {
    async fn execute(&self, input: Value, _ctx: &ActionContext) -> Result<Value, ActionError> {
        Ok(input)
    }
}

/// Sleeps for `ms` milliseconds, returning early when cancelled
pub struct DelayAction;

#[async_trait::async_trait]
impl ExecutableAction for DelayAction {
    fn validate(&self, input: &Value) -> Result<(), ActionError> {
        match input.get("ms") {
            Some(ms) if ms.as_u64().is_some() => Ok(()),
            _ => Err(ActionError::InvalidInput(
                "core.delay requires a non-negative integer `ms`".into(),
            )),
        }
    }

    async fn execute(&self, input: Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(0);
        ctx.log(LogLevel::Debug, format!("sleeping {}ms", ms));

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                Ok(serde_json::json!({ "slept_ms": ms }))
            }
            _ = ctx.cancel.cancelled() => {
                Err(ActionError::Internal("delay interrupted".into()))
            }
        }
    }
}

/// Always fails; `kind` selects the failure class
pub struct FailAction;

#[async_trait::async_trait]
impl ExecutableAction for FailAction {
    async fn execute(&self, input: Value, _ctx: &ActionContext) -> Result<Value, ActionError> {
        let message = input
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("requested failure")
            .to_string();

        Err(match input.get("kind").and_then(Value::as_str) {
            Some("retryable") => ActionError::Network(message),
            Some("timeout") => ActionError::Timeout(message),
            Some("not_found") => ActionError::NotFound(message),
            _ => ActionError::Internal(message),
        })
    }
}

/// Returns `value` from the node config
pub struct SetAction;

#[async_trait::async_trait]
impl ExecutableAction for SetAction {
    async fn execute(&self, input: Value, _ctx: &ActionContext) -> Result<Value, ActionError> {
        Ok(input.get("value").cloned().unwrap_or(Value::Null))
    }
}

/// Parks the node until its outcome is reported externally
pub struct WaitAction;

#[async_trait::async_trait]
impl ExecutableAction for WaitAction {
    async fn execute(&self, input: Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        ctx.park();
        ctx.log(LogLevel::Info, "waiting for external completion");
        Ok(input)
    }
}
