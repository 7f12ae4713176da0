use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

use flowgate_core::config::EngineConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::types::{new_graph_id, NodeKind, OnError, Phase, WorkflowEvent};

use super::edge::WorkflowEdge;
use super::node::{GatePolicy, NodeStatus, NodeView, WorkflowNode};
use crate::gate::{gate_required, BypassRecord};

/// Graph-wide fallbacks for node policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefaults {
    /// Gate every node that does not say otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_policy: Option<GatePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
}

impl GraphDefaults {
    /// Fill unset fields from the engine configuration.
    pub(crate) fn fill_from(&mut self, config: &EngineConfig) {
        if self.timeout_ms.is_none() {
            self.timeout_ms = config.default_timeout_ms;
        }
        self.max_retries.get_or_insert(config.default_max_retries);
        self.on_error.get_or_insert(config.default_on_error);
    }
}

/// Declarative input for a new graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefinition {
    /// Caller-chosen id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub entry: String,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    #[serde(default)]
    pub defaults: GraphDefaults,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl GraphDefinition {
    pub fn new(name: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            version: default_version(),
            entry: entry.into(),
            nodes: vec![],
            edges: vec![],
            defaults: GraphDefaults::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: WorkflowEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_defaults(mut self, defaults: GraphDefaults) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Overall status of a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphStatus {
    #[default]
    Active,
    Completed,
    Failed,
}

impl GraphStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A predecessor or successor link. `edge` is the index of the edge the
/// link came from; `None` for a `dependsOn`-only link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Link {
    pub node: usize,
    pub edge: Option<usize>,
}

/// Adjacency derived from nodes and edges. Not persisted; rebuilt on demand.
#[derive(Debug, Clone, Default)]
pub(crate) struct Topology {
    pub index: HashMap<String, usize>,
    pub preds: Vec<Vec<Link>>,
    pub succs: Vec<Vec<Link>>,
    /// Topological order of node indices.
    pub order: Vec<usize>,
    /// A node on a cycle, if the links are not acyclic.
    pub cycle: Option<usize>,
}

impl Topology {
    fn build(nodes: &[WorkflowNode], edges: &[WorkflowEdge]) -> Self {
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let mut preds = vec![Vec::new(); nodes.len()];
        let mut succs = vec![Vec::new(); nodes.len()];

        for (ei, edge) in edges.iter().enumerate() {
            if let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to)) {
                preds[to].push(Link { node: from, edge: Some(ei) });
                succs[from].push(Link { node: to, edge: Some(ei) });
            }
        }
        for (ni, node) in nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let Some(&d) = index.get(dep) else { continue };
                if preds[ni].iter().any(|l: &Link| l.node == d) {
                    continue;
                }
                preds[ni].push(Link { node: d, edge: None });
                succs[d].push(Link { node: ni, edge: None });
            }
        }
        for links in preds.iter_mut().chain(succs.iter_mut()) {
            links.sort();
        }

        let mut dag = DiGraph::<usize, ()>::with_capacity(nodes.len(), edges.len());
        let handles: Vec<_> = (0..nodes.len()).map(|i| dag.add_node(i)).collect();
        for (to, links) in preds.iter().enumerate() {
            for link in links {
                dag.add_edge(handles[link.node], handles[to], ());
            }
        }
        let (order, cycle) = match toposort(&dag, None) {
            Ok(sorted) => (sorted.into_iter().map(|h| dag[h]).collect(), None),
            Err(cycle) => ((0..nodes.len()).collect(), Some(dag[cycle.node_id()])),
        };

        Self {
            index,
            preds,
            succs,
            order,
            cycle,
        }
    }

    /// Distinct predecessor node indices, ascending.
    pub fn predecessor_nodes(&self, idx: usize) -> Vec<usize> {
        let mut nodes: Vec<usize> = self.preds[idx].iter().map(|l| l.node).collect();
        nodes.dedup();
        nodes
    }
}

/// A live workflow: definition plus runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) entry: String,
    pub(crate) nodes: Vec<WorkflowNode>,
    pub(crate) edges: Vec<WorkflowEdge>,
    pub(crate) defaults: GraphDefaults,
    pub(crate) status: GraphStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) current_phase: Option<Phase>,
    pub(crate) total_estimated_tokens: u64,
    pub(crate) actual_tokens_used: u64,
    /// Caller context plus `results.<nodeId>` for each completed node.
    pub(crate) context: serde_json::Value,
    #[serde(default)]
    pub(crate) audit_log: Vec<BypassRecord>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,

    #[serde(skip)]
    topology: OnceLock<Topology>,
    #[serde(skip)]
    pub(crate) events: Vec<WorkflowEvent>,
}

impl WorkflowGraph {
    /// Validate a definition and build a fresh graph from it.
    ///
    /// Roots (nodes without predecessors) start out ready. Unset policy
    /// defaults are filled from `engine`.
    pub fn build(
        definition: GraphDefinition,
        context: serde_json::Value,
        engine: &EngineConfig,
    ) -> Result<Self> {
        let topology = validate(&definition)?;

        let context = match context {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            serde_json::Value::Object(map) => serde_json::Value::Object(map),
            other => {
                return Err(FlowgateError::InvalidGraph(format!(
                    "context must be a JSON object, got {}",
                    other
                )))
            }
        };

        let mut nodes = definition.nodes;
        for node in &mut nodes {
            node.reset_runtime();
            if node.label.is_empty() {
                node.label = node.id.clone();
            }
        }
        let mut defaults = definition.defaults;
        defaults.fill_from(engine);

        let now = Utc::now();
        let current_phase = topology
            .index
            .get(&definition.entry)
            .and_then(|&i| nodes[i].phase);
        let mut graph = Self {
            id: definition.id.unwrap_or_else(new_graph_id),
            name: definition.name,
            version: definition.version,
            entry: definition.entry,
            total_estimated_tokens: nodes.iter().map(|n| n.estimated_tokens).sum(),
            nodes,
            edges: definition.edges,
            defaults,
            status: GraphStatus::Active,
            current_phase,
            actual_tokens_used: 0,
            context,
            audit_log: vec![],
            created_at: now,
            updated_at: now,
            topology: OnceLock::from(topology),
            events: vec![],
        };
        graph.refresh();
        graph.events.clear();
        Ok(graph)
    }

    pub(crate) fn topology(&self) -> &Topology {
        self.topology
            .get_or_init(|| Topology::build(&self.nodes, &self.edges))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn status(&self) -> GraphStatus {
        self.status
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.current_phase
    }

    pub fn nodes(&self) -> &[WorkflowNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[WorkflowEdge] {
        &self.edges
    }

    pub fn defaults(&self) -> &GraphDefaults {
        &self.defaults
    }

    pub fn context(&self) -> &serde_json::Value {
        &self.context
    }

    pub fn audit_log(&self) -> &[BypassRecord] {
        &self.audit_log
    }

    pub fn total_estimated_tokens(&self) -> u64 {
        self.total_estimated_tokens
    }

    pub fn actual_tokens_used(&self) -> u64 {
        self.actual_tokens_used
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.topology().index.get(node_id).map(|&i| &self.nodes[i])
    }

    pub(crate) fn index_of(&self, node_id: &str) -> Result<usize> {
        self.topology()
            .index
            .get(node_id)
            .copied()
            .ok_or_else(|| FlowgateError::NodeNotFound {
                graph_id: self.id.clone(),
                node_id: node_id.to_string(),
            })
    }

    pub fn effective_max_retries(&self, idx: usize) -> u32 {
        self.nodes[idx]
            .max_retries
            .or(self.defaults.max_retries)
            .unwrap_or(0)
    }

    pub fn effective_timeout_ms(&self, idx: usize) -> Option<u64> {
        self.nodes[idx].timeout_ms.or(self.defaults.timeout_ms)
    }

    pub fn effective_on_error(&self, idx: usize) -> OnError {
        self.nodes[idx]
            .on_error
            .or(self.defaults.on_error)
            .unwrap_or_default()
    }

    /// Caller-facing view of one node.
    pub fn view(&self, idx: usize) -> NodeView {
        let node = &self.nodes[idx];
        NodeView {
            id: node.id.clone(),
            kind: node.kind,
            label: node.label.clone(),
            phase: node.phase,
            status: node.status,
            payload: node.payload.clone(),
            tools: node.tools.clone(),
            files: node.files.clone(),
            priority: node.priority,
            estimated_tokens: node.estimated_tokens,
            gate_required: gate_required(node, &self.defaults),
            timeout_ms: self.effective_timeout_ms(idx),
            max_retries: self.effective_max_retries(idx),
            retry_count: node.retry_count,
            attempts: node.attempts,
            error: node.error.clone(),
        }
    }

    pub fn node_view(&self, node_id: &str) -> Result<NodeView> {
        Ok(self.view(self.index_of(node_id)?))
    }

    /// Take the events produced by the transitions since the last drain.
    pub fn drain_events(&mut self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Structural checks. Returns the topology of the accepted definition.
fn validate(def: &GraphDefinition) -> Result<Topology> {
    if def.nodes.is_empty() {
        return Err(FlowgateError::InvalidGraph("graph has no nodes".into()));
    }

    let mut seen = HashSet::new();
    for node in &def.nodes {
        if node.id.is_empty() {
            return Err(FlowgateError::InvalidGraph("node id must not be empty".into()));
        }
        if !seen.insert(node.id.as_str()) {
            return Err(FlowgateError::DuplicateNode(node.id.clone()));
        }
    }

    if !seen.contains(def.entry.as_str()) {
        return Err(FlowgateError::MissingEntry(def.entry.clone()));
    }

    let kinds: HashMap<&str, NodeKind> =
        def.nodes.iter().map(|n| (n.id.as_str(), n.kind)).collect();
    let mut unconditional_seen: HashSet<&str> = HashSet::new();
    for edge in &def.edges {
        let Some(&kind) = kinds.get(edge.from.as_str()) else {
            return Err(dangling(edge));
        };
        if !kinds.contains_key(edge.to.as_str()) {
            return Err(dangling(edge));
        }
        if edge.from == edge.to {
            return Err(FlowgateError::CycleDetected(edge.from.clone()));
        }
        match edge.condition {
            Some(_) if kind != NodeKind::Decision => {
                return Err(FlowgateError::InvalidGraph(format!(
                    "edge {} -> {} carries a condition but '{}' is not a decision node",
                    edge.from, edge.to, edge.from
                )));
            }
            Some(_) if unconditional_seen.contains(edge.from.as_str()) => {
                return Err(FlowgateError::MisorderedDefaultEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
            Some(_) => {}
            None => {
                unconditional_seen.insert(edge.from.as_str());
            }
        }
    }

    for node in &def.nodes {
        for dep in &node.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(FlowgateError::DanglingDependency {
                    node: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        if node.kind == NodeKind::Decision && !def.edges.iter().any(|e| e.from == node.id) {
            return Err(FlowgateError::InvalidGraph(format!(
                "decision node '{}' has no outgoing edges",
                node.id
            )));
        }
    }

    let topology = Topology::build(&def.nodes, &def.edges);
    if let Some(idx) = topology.cycle {
        return Err(FlowgateError::CycleDetected(def.nodes[idx].id.clone()));
    }

    let entry = topology.index[def.entry.as_str()];
    if !topology.preds[entry].is_empty() {
        return Err(FlowgateError::EntryHasPredecessors(def.entry.clone()));
    }

    Ok(topology)
}

fn dangling(edge: &WorkflowEdge) -> FlowgateError {
    FlowgateError::DanglingEdge {
        from: edge.from.clone(),
        to: edge.to.clone(),
    }
}
