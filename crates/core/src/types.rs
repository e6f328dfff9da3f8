use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::tenant::TenantId;

/// Unique identifier for a flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a flow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl FlowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a node within a flow graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key into the action registry (e.g. "core.echo", "slack.post_message")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionRef(pub String);

impl ActionRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ActionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Status of a node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Waiting,
    Running,
    Paused,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Not yet dispatched and not terminal
    pub fn is_unstarted(self) -> bool {
        matches!(self, Self::Pending | Self::Waiting)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Versioned flow definition (a DAG of nodes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub version: u32,
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Definition of a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(default)]
    pub name: Option<String>,
    pub action: ActionRef,
    /// Static input passed to the action
    #[serde(default)]
    pub config: serde_json::Value,
    /// Input bindings: input key -> "node_id" or "node_id.path.in.result"
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Directed edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// When an edge is traversed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Source completed
    #[default]
    OnSuccess,
    /// Source failed; routes around the failure
    OnFailure,
    /// Source completed and the predicate holds for its result
    When { expr: String },
}

/// Retry policy for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured log line attached to a run or node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            node_id: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn for_node(mut self, node_id: &NodeId) -> Self {
        self.node_id = Some(node_id.clone());
        self
    }
}

/// One execution instance of a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: RunId,
    pub tenant_id: TenantId,
    pub flow_id: FlowId,
    pub flow_version: u32,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restarted_from: Option<RunId>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub nodes: Vec<NodeState>,
}

impl FlowRun {
    /// Create a draft run with every node pending
    pub fn draft(flow: &Flow) -> Self {
        Self {
            id: RunId::new(),
            tenant_id: flow.tenant_id.clone(),
            flow_id: flow.id.clone(),
            flow_version: flow.version,
            status: RunStatus::Draft,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            restarted_from: None,
            logs: Vec::new(),
            nodes: flow.nodes.iter().map(|n| NodeState::new(n.id.clone())).collect(),
        }
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&NodeState> {
        self.nodes.iter().find(|n| &n.node_id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &NodeId) -> Option<&mut NodeState> {
        self.nodes.iter_mut().find(|n| &n.node_id == node_id)
    }

    /// Wall-clock duration of a finished run
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Execution record of a node within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    /// Dispatched and waiting for its outcome to be reported from outside
    #[serde(default)]
    pub parked: bool,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeState {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: NodeStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            parked: false,
            logs: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// A queued request to execute one node within one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub action: ActionRef,
    pub input: serde_json::Value,
    /// 1-based attempt counter
    pub attempt: u32,
    pub retry: RetryPolicy,
    #[serde(default)]
    pub timeout: Option<Duration>,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        tenant_id: TenantId,
        run_id: RunId,
        node_id: NodeId,
        action: ActionRef,
        input: serde_json::Value,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            run_id,
            node_id,
            action,
            input,
            attempt: 1,
            retry,
            timeout: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Resume counting from an earlier attempt
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Normalized result of dispatching a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Success { result: serde_json::Value },
    RetryableFailure { reason: String },
    PermanentFailure { reason: String },
    Cancelled,
}

impl Outcome {
    pub fn success(result: serde_json::Value) -> Self {
        Self::Success { result }
    }

    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::RetryableFailure {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The node's result, or the engine error describing why there is none
    pub fn into_result(self) -> crate::error::Result<serde_json::Value> {
        use crate::error::EngineError;

        match self {
            Self::Success { result } => Ok(result),
            Self::RetryableFailure { reason } => Err(EngineError::RetryableFailure(reason)),
            Self::PermanentFailure { reason } => Err(EngineError::PermanentFailure(reason)),
            Self::Cancelled => Err(EngineError::CancellationRequested),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_parse_round_trip() {
        for status in [
            RunStatus::Draft,
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_outcome_into_result() {
        let ok = Outcome::success(serde_json::json!({ "id": 7 })).into_result();
        assert_eq!(ok.unwrap(), serde_json::json!({ "id": 7 }));

        let err = Outcome::permanent("bad input").into_result().unwrap_err();
        assert_eq!(err.to_string(), "permanent failure: bad input");
        assert!(Outcome::retryable("reset").into_result().unwrap_err().is_retryable());
        assert!(matches!(
            Outcome::Cancelled.into_result(),
            Err(crate::error::EngineError::CancellationRequested)
        ));

        // Reported outcomes arrive as tagged JSON
        let reported: Outcome =
            serde_json::from_value(serde_json::json!({ "type": "permanent_failure", "reason": "no" }))
                .unwrap();
        assert_eq!(reported, Outcome::permanent("no"));
    }

    #[test]
    fn test_edge_condition_defaults_to_on_success() {
        let edge: EdgeSpec = serde_json::from_value(serde_json::json!({
            "source": "a",
            "target": "b"
        }))
        .unwrap();
        assert_eq!(edge.condition, EdgeCondition::OnSuccess);

        let edge: EdgeSpec = serde_json::from_value(serde_json::json!({
            "source": "a",
            "target": "b",
            "condition": { "type": "when", "expr": "status == ok" }
        }))
        .unwrap();
        assert_eq!(
            edge.condition,
            EdgeCondition::When {
                expr: "status == ok".to_string()
            }
        );
    }

    #[test]
    fn test_draft_run_has_pending_node_per_flow_node() {
        let flow = Flow {
            id: FlowId::new("flow-1"),
            tenant_id: TenantId::new("acme"),
            version: 3,
            name: "Onboarding".to_string(),
            nodes: vec![
                NodeSpec {
                    id: NodeId::new("a"),
                    name: None,
                    action: ActionRef::new("core.echo"),
                    config: serde_json::Value::Null,
                    inputs: BTreeMap::new(),
                    timeout_secs: None,
                    retry: None,
                },
                NodeSpec {
                    id: NodeId::new("b"),
                    name: None,
                    action: ActionRef::new("core.echo"),
                    config: serde_json::Value::Null,
                    inputs: BTreeMap::new(),
                    timeout_secs: None,
                    retry: None,
                },
            ],
            edges: vec![],
            created_at: Utc::now(),
        };

        let run = FlowRun::draft(&flow);
        assert_eq!(run.status, RunStatus::Draft);
        assert_eq!(run.flow_version, 3);
        assert_eq!(run.nodes.len(), 2);
        assert!(run.nodes.iter().all(|n| n.status == NodeStatus::Pending));
    }
}
