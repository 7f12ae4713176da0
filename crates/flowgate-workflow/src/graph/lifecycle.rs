//! Node state transitions: start, complete (with gate outcome), fail.
//!
//! Transitions never evaluate evidence themselves. The caller evaluates
//! the gate and passes the verdict in as a [`GateDecision`].

use chrono::Utc;
use serde::Serialize;

use flowgate_core::error::Result;
use flowgate_core::types::{NodeKind, OnError, WorkflowEvent};

use super::edge::select_branch;
use super::model::{GraphStatus, WorkflowGraph};
use super::node::{NodeStatus, NodeView};
use crate::gate::{BypassRecord, GateResult};

/// Why a transition was refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotReady {
    pub node_id: String,
    pub status: NodeStatus,
    pub graph_status: GraphStatus,
    pub reason: String,
    pub waiting_on: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(NodeView),
    NotReady(NotReady),
}

/// What the worker reported on success.
#[derive(Debug, Clone, Default)]
pub struct NodeCompletion {
    pub result: Option<serde_json::Value>,
    pub tokens_used: Option<u64>,
}

impl NodeCompletion {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            tokens_used: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

/// Gate verdict supplied to [`WorkflowGraph::complete_node`].
#[derive(Debug, Clone)]
pub enum GateDecision {
    NotRequired,
    Passed(GateResult),
    Blocked(GateResult),
    Bypassed(BypassRecord),
}

/// A node finished and the graph moved on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bypass: Option<BypassRecord>,
    pub next_ready: Vec<NodeView>,
    pub skipped: Vec<String>,
    pub graph_status: GraphStatus,
}

#[derive(Debug, Clone)]
pub enum CompleteOutcome {
    Completed(Progress),
    /// Gate unmet; the node is now blocked.
    Blocked { node_id: String, gate: GateResult },
    /// Decision node whose conditions matched no outgoing edge.
    NoMatchingBranch(FailOutcome),
    NotReady(NotReady),
}

/// A node failed for good after retries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub node_id: String,
    pub error: String,
    pub on_error: OnError,
    pub status: NodeStatus,
    pub graph_status: GraphStatus,
    pub skipped: Vec<String>,
    pub next_ready: Vec<NodeView>,
}

#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Node went back to ready. `attempt` is the number of the next attempt.
    Retrying {
        node_id: String,
        attempt: u32,
        remaining: u32,
        error: String,
    },
    Failed(FailureReport),
    NotReady(NotReady),
}

impl WorkflowGraph {
    /// Mark a ready node running.
    pub fn start_node(&mut self, node_id: &str) -> Result<StartOutcome> {
        let idx = self.index_of(node_id)?;
        if let Some(not_ready) = self.refuse_start(idx) {
            return Ok(StartOutcome::NotReady(not_ready));
        }

        let now = Utc::now();
        let node = &mut self.nodes[idx];
        node.status = NodeStatus::Running;
        node.attempts += 1;
        node.started_at = Some(now);
        let attempt = node.attempts;
        if let Some(phase) = node.phase {
            self.current_phase = Some(phase);
        }
        self.events.push(WorkflowEvent::NodeStarted {
            graph_id: self.id.clone(),
            node_id: node_id.to_string(),
            attempt,
        });
        self.updated_at = now;
        Ok(StartOutcome::Started(self.view(idx)))
    }

    fn refuse_start(&self, idx: usize) -> Option<NotReady> {
        let node = &self.nodes[idx];
        let reason = if self.status != GraphStatus::Active {
            format!("graph is {}", self.status)
        } else {
            match node.status {
                NodeStatus::Pending | NodeStatus::Ready if self.is_satisfied(idx) => return None,
                NodeStatus::Pending | NodeStatus::Ready => "waiting on predecessors".to_string(),
                other => format!("node is {}", other),
            }
        };
        Some(self.not_ready(idx, reason))
    }

    /// Index of a node that may be completed or failed right now.
    pub(crate) fn completable(&self, node_id: &str) -> Result<std::result::Result<usize, NotReady>> {
        let idx = self.index_of(node_id)?;
        if self.status != GraphStatus::Active {
            return Ok(Err(self.not_ready(idx, format!("graph is {}", self.status))));
        }
        match self.nodes[idx].status {
            NodeStatus::Running | NodeStatus::Blocked => Ok(Ok(idx)),
            other => Ok(Err(self.not_ready(
                idx,
                format!("node is {}, expected running or blocked", other),
            ))),
        }
    }

    fn not_ready(&self, idx: usize, reason: String) -> NotReady {
        NotReady {
            node_id: self.nodes[idx].id.clone(),
            status: self.nodes[idx].status,
            graph_status: self.status,
            reason,
            waiting_on: self.waiting_on_index(idx),
        }
    }

    /// Record a successful attempt and apply the gate verdict.
    pub fn complete_node(
        &mut self,
        node_id: &str,
        completion: NodeCompletion,
        gate: GateDecision,
    ) -> Result<CompleteOutcome> {
        let idx = match self.completable(node_id)? {
            Ok(idx) => idx,
            Err(not_ready) => return Ok(CompleteOutcome::NotReady(not_ready)),
        };

        let now = Utc::now();
        self.updated_at = now;
        if let Some(tokens) = completion.tokens_used {
            self.nodes[idx].pending_tokens = Some(tokens);
        }
        if let Some(result) = completion.result {
            self.nodes[idx].result = Some(result);
        }

        let (gate, bypass) = match gate {
            GateDecision::Blocked(result) => {
                let node = &mut self.nodes[idx];
                node.status = NodeStatus::Blocked;
                node.last_gate = Some(result.clone());
                self.events.push(WorkflowEvent::NodeBlocked {
                    graph_id: self.id.clone(),
                    node_id: node_id.to_string(),
                    missing: result.missing_evidence.clone(),
                    failing: result.failing_kinds(),
                });
                return Ok(CompleteOutcome::Blocked {
                    node_id: node_id.to_string(),
                    gate: result,
                });
            }
            GateDecision::NotRequired => (None, None),
            GateDecision::Passed(result) => (Some(result), None),
            GateDecision::Bypassed(record) => {
                self.audit_log.push(record.clone());
                self.events.push(WorkflowEvent::GateBypassed {
                    graph_id: self.id.clone(),
                    node_id: node_id.to_string(),
                    actor: record.actor().to_string(),
                    reason: record.reason().to_string(),
                });
                (None, Some(record))
            }
        };
        if gate.is_some() {
            self.nodes[idx].last_gate = gate.clone();
        }

        self.record_result(idx);

        let mut branch = None;
        if self.nodes[idx].kind == NodeKind::Decision {
            let chosen = select_branch(
                self.edges.iter().filter(|e| e.from == node_id),
                &self.context,
            )
            .map(|e| e.to.clone());
            match chosen {
                Some(to) => branch = Some(to),
                None => {
                    let failure = self.fail_at(idx, "no matching branch".to_string());
                    return Ok(CompleteOutcome::NoMatchingBranch(failure));
                }
            }
        }

        let node = &mut self.nodes[idx];
        let tokens = node.pending_tokens.take().unwrap_or(0);
        node.tokens_used += tokens;
        self.actual_tokens_used += tokens;
        node.status = NodeStatus::Done;
        node.completed_at = Some(now);
        node.error = None;
        node.selected_branch = branch.clone();
        self.events.push(WorkflowEvent::NodeCompleted {
            graph_id: self.id.clone(),
            node_id: node_id.to_string(),
            branch: branch.clone(),
        });

        let skipped = self.refresh();
        self.check_completion();
        Ok(CompleteOutcome::Completed(Progress {
            node_id: node_id.to_string(),
            branch,
            gate,
            bypass,
            next_ready: self.ready_nodes(),
            skipped,
            graph_status: self.status,
        }))
    }

    /// Record a failed attempt.
    pub fn fail_node(&mut self, node_id: &str, error: &str) -> Result<FailOutcome> {
        match self.completable(node_id)? {
            Ok(idx) => Ok(self.fail_at(idx, error.to_string())),
            Err(not_ready) => Ok(FailOutcome::NotReady(not_ready)),
        }
    }

    /// Expose the node's result to later conditions as `results.<id>`.
    fn record_result(&mut self, idx: usize) {
        let node = &self.nodes[idx];
        let value = node.result.clone().unwrap_or(serde_json::Value::Null);
        if !self.context.is_object() {
            self.context = serde_json::Value::Object(Default::default());
        }
        if let Some(ctx) = self.context.as_object_mut() {
            let results = ctx
                .entry("results")
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
            if !results.is_object() {
                *results = serde_json::Value::Object(Default::default());
            }
            if let Some(results) = results.as_object_mut() {
                results.insert(node.id.clone(), value);
            }
        }
    }

    fn fail_at(&mut self, idx: usize, error: String) -> FailOutcome {
        let now = Utc::now();
        self.updated_at = now;
        let max_retries = self.effective_max_retries(idx);
        let on_error = self.effective_on_error(idx);
        let node_id = self.nodes[idx].id.clone();

        let node = &mut self.nodes[idx];
        node.error = Some(error.clone());
        if node.retry_count < max_retries {
            node.retry_count += 1;
            node.status = NodeStatus::Ready;
            node.started_at = None;
            let attempt = node.attempts + 1;
            let remaining = max_retries - node.retry_count;
            self.events.push(WorkflowEvent::NodeRetrying {
                graph_id: self.id.clone(),
                node_id: node_id.clone(),
                attempt,
                error: error.clone(),
            });
            return FailOutcome::Retrying {
                node_id,
                attempt,
                remaining,
                error,
            };
        }

        node.completed_at = Some(now);
        self.events.push(WorkflowEvent::NodeFailed {
            graph_id: self.id.clone(),
            node_id: node_id.clone(),
            error: error.clone(),
        });

        let skipped = match on_error {
            OnError::Fail => {
                self.nodes[idx].status = NodeStatus::Failed;
                self.status = GraphStatus::Failed;
                let mut skipped = Vec::new();
                for node in self.nodes.iter_mut().filter(|n| !n.status.is_terminal()) {
                    node.status = NodeStatus::Skipped;
                    skipped.push(node.id.clone());
                    self.events.push(WorkflowEvent::NodeSkipped {
                        graph_id: self.id.clone(),
                        node_id: node.id.clone(),
                    });
                }
                self.events.push(WorkflowEvent::GraphFailed {
                    graph_id: self.id.clone(),
                    node_id: node_id.clone(),
                    error: error.clone(),
                });
                skipped
            }
            OnError::Skip => {
                self.nodes[idx].status = NodeStatus::Skipped;
                let skipped = self.refresh();
                self.check_completion();
                skipped
            }
            OnError::Continue => {
                self.nodes[idx].status = NodeStatus::Failed;
                let skipped = self.refresh();
                self.check_completion();
                skipped
            }
        };

        FailOutcome::Failed(FailureReport {
            status: self.nodes[idx].status,
            node_id,
            error,
            on_error,
            graph_status: self.status,
            skipped,
            next_ready: self.ready_nodes(),
        })
    }

    fn check_completion(&mut self) {
        if self.status == GraphStatus::Active && self.nodes.iter().all(|n| n.status.is_terminal()) {
            self.status = GraphStatus::Completed;
            self.events.push(WorkflowEvent::GraphCompleted {
                graph_id: self.id.clone(),
                actual_tokens: self.actual_tokens_used,
            });
        }
    }
}
