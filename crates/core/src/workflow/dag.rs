use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{EdgeRef, Topo};
use petgraph::Direction;
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::condition::{lookup, Predicate};
use crate::error::{EngineError, Result};
use crate::types::{EdgeCondition, Flow, FlowRun, NodeId, NodeSpec, NodeStatus};

/// Edge rule with its predicate parsed up front
#[derive(Debug, Clone)]
enum EdgeRule {
    OnSuccess,
    OnFailure,
    When(Predicate),
}

/// Resolution of one incoming edge against the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    /// Source has not reached a terminal status
    Unresolved,
    Taken,
    NotTaken,
    /// Source failed without a route around it, or was cancelled
    Blocked,
}

/// Whether an unstarted node can be dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Skip,
    Wait,
}

/// Validated DAG representation of a flow
#[derive(Debug)]
pub struct FlowGraph {
    graph: DiGraph<NodeSpec, EdgeRule>,
    indices: HashMap<NodeId, NodeIndex>,
    order: Vec<NodeId>,
}

impl FlowGraph {
    /// Build and validate a DAG from a flow definition
    pub fn from_flow(flow: &Flow) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for node in &flow.nodes {
            if node.id.as_str().is_empty() {
                return Err(EngineError::InvalidFlow("node id must not be empty".into()));
            }
            if indices.contains_key(&node.id) {
                return Err(EngineError::InvalidFlow(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
            let idx = graph.add_node(node.clone());
            indices.insert(node.id.clone(), idx);
        }

        for edge in &flow.edges {
            let source = *indices.get(&edge.source).ok_or_else(|| {
                EngineError::InvalidFlow(format!("edge references unknown node {}", edge.source))
            })?;
            let target = *indices.get(&edge.target).ok_or_else(|| {
                EngineError::InvalidFlow(format!("edge references unknown node {}", edge.target))
            })?;

            let rule = match &edge.condition {
                EdgeCondition::OnSuccess => EdgeRule::OnSuccess,
                EdgeCondition::OnFailure => EdgeRule::OnFailure,
                EdgeCondition::When { expr } => EdgeRule::When(Predicate::parse(expr)?),
            };
            graph.add_edge(source, target, rule);
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(EngineError::InvalidFlow(
                "flow contains circular dependencies".into(),
            ));
        }

        // Bindings may only read results of nodes that finish first
        for node in &flow.nodes {
            let target = indices[&node.id];
            for (key, binding) in &node.inputs {
                let (source_id, _) = split_binding(binding);
                let source = indices.get(&NodeId::new(source_id)).ok_or_else(|| {
                    EngineError::InvalidFlow(format!(
                        "input {} of node {} binds unknown node {}",
                        key, node.id, source_id
                    ))
                })?;
                if *source == target || !has_path_connecting(&graph, *source, target, None) {
                    return Err(EngineError::InvalidFlow(format!(
                        "input {} of node {} binds {} which is not upstream",
                        key, node.id, source_id
                    )));
                }
            }
        }

        let mut topo = Topo::new(&graph);
        let mut order = Vec::with_capacity(graph.node_count());
        while let Some(idx) = topo.next(&graph) {
            order.push(graph[idx].id.clone());
        }

        Ok(Self {
            graph,
            indices,
            order,
        })
    }

    /// Node ids in topological order (dependencies first)
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&NodeSpec> {
        self.indices.get(node_id).map(|idx| &self.graph[*idx])
    }

    /// Whether a failure of this node is routed through an `on_failure` edge
    pub fn has_failure_route(&self, node_id: &NodeId) -> bool {
        let Some(idx) = self.indices.get(node_id) else {
            return false;
        };
        self.graph
            .edges_directed(*idx, Direction::Outgoing)
            .any(|e| matches!(e.weight(), EdgeRule::OnFailure))
    }

    /// A failed node with nowhere to route the failure fails the run
    pub fn has_unhandled_failure(&self, run: &FlowRun) -> bool {
        run.nodes
            .iter()
            .any(|n| n.status == NodeStatus::Failed && !self.has_failure_route(&n.node_id))
    }

    fn edge_state(&self, source: NodeIndex, rule: &EdgeRule, run: &FlowRun) -> EdgeState {
        let source_id = &self.graph[source].id;
        let Some(state) = run.node(source_id) else {
            return EdgeState::Blocked;
        };

        match state.status {
            NodeStatus::Completed => match rule {
                EdgeRule::OnSuccess => EdgeState::Taken,
                EdgeRule::OnFailure => EdgeState::NotTaken,
                EdgeRule::When(predicate) => {
                    if predicate.evaluate(state.result.as_ref().unwrap_or(&Value::Null)) {
                        EdgeState::Taken
                    } else {
                        EdgeState::NotTaken
                    }
                }
            },
            NodeStatus::Failed if self.has_failure_route(source_id) => match rule {
                EdgeRule::OnFailure => EdgeState::Taken,
                _ => EdgeState::NotTaken,
            },
            NodeStatus::Failed | NodeStatus::Cancelled => EdgeState::Blocked,
            NodeStatus::Skipped => EdgeState::NotTaken,
            _ => EdgeState::Unresolved,
        }
    }

    /// Evaluate incoming edges of a node against the run
    pub fn readiness(&self, node_id: &NodeId, run: &FlowRun) -> Readiness {
        let Some(idx) = self.indices.get(node_id) else {
            return Readiness::Wait;
        };

        let mut taken = false;
        let mut blocked = false;
        for edge in self.graph.edges_directed(*idx, Direction::Incoming) {
            match self.edge_state(edge.source(), edge.weight(), run) {
                EdgeState::Unresolved => return Readiness::Wait,
                EdgeState::Taken => taken = true,
                EdgeState::NotTaken => {}
                EdgeState::Blocked => blocked = true,
            }
        }

        let roots = self
            .graph
            .edges_directed(*idx, Direction::Incoming)
            .next()
            .is_none();

        if roots || (taken && !blocked) {
            Readiness::Ready
        } else if blocked {
            Readiness::Wait
        } else {
            Readiness::Skip
        }
    }

    /// Build a job input: the node's config plus its bound upstream results
    pub fn resolve_input(&self, node_id: &NodeId, run: &FlowRun) -> Value {
        let Some(spec) = self.node(node_id) else {
            return Value::Null;
        };

        let mut input = match &spec.config {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("config".to_string(), other.clone());
                map
            }
        };

        for (key, binding) in &spec.inputs {
            let (source_id, path) = split_binding(binding);
            let bound = run
                .node(&NodeId::new(source_id))
                .and_then(|n| n.result.as_ref())
                .and_then(|result| match path {
                    Some(path) => {
                        let segments: Vec<&str> = path.split('.').collect();
                        lookup(result, segments.as_slice())
                    }
                    None => Some(result),
                })
                .cloned()
                .unwrap_or(Value::Null);
            input.insert(key.clone(), bound);
        }

        Value::Object(input)
    }
}

/// "node.path.to.field" -> ("node", Some("path.to.field"))
fn split_binding(binding: &str) -> (&str, Option<&str>) {
    match binding.split_once('.') {
        Some((node, path)) => (node, Some(path)),
        None => (binding, None),
    }
}
