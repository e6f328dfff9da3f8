//! Flow and node lifecycle: legal transitions, run bookkeeping and
//! status derivation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{EngineError, Result};
use crate::types::{FlowRun, NodeId, NodeStatus, RunStatus};
use crate::workflow::dag::{FlowGraph, Readiness};

/// Legal node transitions
pub fn node_transition_allowed(from: NodeStatus, to: NodeStatus) -> bool {
    use NodeStatus::*;

    let allowed: &[NodeStatus] = match from {
        Pending => &[Waiting, Running, Skipped, Cancelled],
        Waiting => &[Running, Skipped, Cancelled],
        Running => &[Paused, Completed, Failed, Cancelled, Pending],
        Paused => &[Running, Completed, Failed, Cancelled, Pending],
        Completed | Failed | Skipped | Cancelled => &[],
    };
    allowed.contains(&to)
}

/// Legal run transitions
pub fn run_transition_allowed(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;

    let allowed: &[RunStatus] = match from {
        Draft => &[Running, Cancelled],
        Running => &[Paused, Completed, Failed, Cancelled],
        Paused => &[Running, Completed, Failed, Cancelled],
        Completed | Failed | Cancelled => &[],
    };
    allowed.contains(&to)
}

/// Operator intent for a run, independent of node progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunControl {
    Active,
    Paused,
    Stopped,
    /// The engine failed while applying a transition
    Faulted,
}

impl RunControl {
    /// Control mode implied by a persisted status
    pub fn from_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Paused => Self::Paused,
            RunStatus::Cancelled => Self::Stopped,
            _ => Self::Active,
        }
    }
}

/// Unstarted nodes after one readiness pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub ready: Vec<NodeId>,
    /// Moved to skipped by this pass
    pub skipped: Vec<NodeId>,
    /// Moved from pending to waiting by this pass
    pub waiting: Vec<NodeId>,
}

/// Mutable state of a run, guarded by the run lock in the controller
#[derive(Debug, Clone)]
pub struct RunState {
    pub run: FlowRun,
    pub control: RunControl,
    /// Nodes with a queued or dispatched job
    pub in_flight: HashSet<NodeId>,
}

impl RunState {
    pub fn new(run: FlowRun) -> Self {
        let control = RunControl::from_status(run.status);
        Self {
            run,
            control,
            in_flight: HashSet::new(),
        }
    }

    pub fn node_status(&self, node_id: &NodeId) -> Option<NodeStatus> {
        self.run.node(node_id).map(|n| n.status)
    }

    /// Move a node to `to`, stamping start and finish times.
    /// Re-applying the current status is a no-op.
    pub fn set_node_status(&mut self, node_id: &NodeId, to: NodeStatus) -> Result<()> {
        let node = self
            .run
            .node_mut(node_id)
            .ok_or_else(|| EngineError::InvalidFlow(format!("unknown node {}", node_id)))?;

        if node.status == to {
            return Ok(());
        }
        if !node_transition_allowed(node.status, to) {
            return Err(EngineError::invalid_transition(node.status, to));
        }

        match to {
            NodeStatus::Running if node.started_at.is_none() => {
                node.started_at = Some(Utc::now());
            }
            NodeStatus::Pending => {
                node.started_at = None;
                node.finished_at = None;
                node.parked = false;
            }
            status if status.is_terminal() => {
                node.finished_at = Some(Utc::now());
                node.parked = false;
            }
            _ => {}
        }
        node.status = to;
        Ok(())
    }

    /// Move the run to `to`. Re-applying the current status is a no-op.
    pub fn set_run_status(&mut self, to: RunStatus) -> Result<()> {
        let from = self.run.status;
        if from == to {
            return Ok(());
        }
        if !run_transition_allowed(from, to) {
            return Err(EngineError::invalid_transition(from, to));
        }

        if to == RunStatus::Running && self.run.started_at.is_none() {
            self.run.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            self.run.finished_at = Some(Utc::now());
        }
        self.run.status = to;
        Ok(())
    }

    /// One pass over unstarted nodes in topological order. Skips are applied
    /// as they are found so they cascade downstream; nodes that cannot run
    /// yet move from pending to waiting. Nodes already in flight are left alone.
    pub fn evaluate(&mut self, graph: &FlowGraph) -> Result<Evaluation> {
        let mut evaluation = Evaluation::default();

        for node_id in graph.topological_order() {
            if self.in_flight.contains(node_id) {
                continue;
            }
            let Some(status) = self.node_status(node_id) else {
                continue;
            };
            if !status.is_unstarted() {
                continue;
            }

            match graph.readiness(node_id, &self.run) {
                Readiness::Ready => evaluation.ready.push(node_id.clone()),
                Readiness::Skip => {
                    self.set_node_status(node_id, NodeStatus::Skipped)?;
                    evaluation.skipped.push(node_id.clone());
                }
                Readiness::Wait if status == NodeStatus::Pending => {
                    self.set_node_status(node_id, NodeStatus::Waiting)?;
                    evaluation.waiting.push(node_id.clone());
                }
                Readiness::Wait => {}
            }
        }

        Ok(evaluation)
    }

    /// Unstarted nodes that could be enqueued now (no mutation)
    pub fn ready_nodes(&self, graph: &FlowGraph) -> Vec<NodeId> {
        graph
            .topological_order()
            .iter()
            .filter(|id| !self.in_flight.contains(*id))
            .filter(|id| self.node_status(id).map_or(false, NodeStatus::is_unstarted))
            .filter(|id| graph.readiness(id, &self.run) == Readiness::Ready)
            .cloned()
            .collect()
    }

    /// Run status as a function of node states, in-flight work and control mode
    pub fn derive_status(&self, graph: &FlowGraph) -> RunStatus {
        match self.control {
            RunControl::Stopped => return RunStatus::Cancelled,
            RunControl::Faulted => return RunStatus::Failed,
            RunControl::Active | RunControl::Paused => {}
        }

        if !self.is_settled(graph) {
            return match self.control {
                RunControl::Paused => RunStatus::Paused,
                _ => RunStatus::Running,
            };
        }

        if graph.has_unhandled_failure(&self.run) {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        }
    }

    /// Nodes waiting for an outcome reported from outside the engine
    pub fn parked_nodes(&self) -> Vec<NodeId> {
        self.run
            .nodes
            .iter()
            .filter(|n| n.parked)
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// True once nothing is in flight and nothing can be enqueued
    pub fn is_settled(&self, graph: &FlowGraph) -> bool {
        self.in_flight.is_empty() && self.ready_nodes(graph).is_empty()
    }
}
