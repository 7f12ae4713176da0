//! Readiness resolution and skip propagation.
//!
//! A node is ready once every predecessor is terminal. A pending node whose
//! predecessors can no longer lead to it (untaken decision branches, skipped
//! parents) is skipped; a node reachable through at least one live path
//! still runs.

use flowgate_core::error::Result;
use flowgate_core::types::{NodeKind, WorkflowEvent};

use super::model::{GraphStatus, Link, WorkflowGraph};
use super::node::{NodeStatus, NodeView};

impl WorkflowGraph {
    /// All predecessors terminal.
    pub fn is_satisfied(&self, idx: usize) -> bool {
        self.topology().preds[idx]
            .iter()
            .all(|link| self.nodes[link.node].status.is_terminal())
    }

    /// Indices of nodes that may start now, in declaration order.
    pub(crate) fn ready_indices(&self) -> Vec<usize> {
        if self.status != GraphStatus::Active {
            return vec![];
        }
        (0..self.nodes.len())
            .filter(|&i| {
                matches!(self.nodes[i].status, NodeStatus::Pending | NodeStatus::Ready)
                    && self.is_satisfied(i)
            })
            .collect()
    }

    /// Nodes that may start now. Read-only; an inactive graph has none.
    pub fn ready_nodes(&self) -> Vec<NodeView> {
        self.ready_indices()
            .into_iter()
            .map(|i| self.view(i))
            .collect()
    }

    /// Non-terminal predecessors of a node.
    pub fn waiting_on(&self, node_id: &str) -> Result<Vec<String>> {
        let idx = self.index_of(node_id)?;
        Ok(self.waiting_on_index(idx))
    }

    pub(crate) fn waiting_on_index(&self, idx: usize) -> Vec<String> {
        self.topology()
            .predecessor_nodes(idx)
            .into_iter()
            .filter(|&p| !self.nodes[p].status.is_terminal())
            .map(|p| self.nodes[p].id.clone())
            .collect()
    }

    /// Recompute liveness, skip dead pending nodes and promote satisfied
    /// ones to ready. Returns the ids skipped by this pass.
    pub(crate) fn refresh(&mut self) -> Vec<String> {
        if self.status != GraphStatus::Active {
            return vec![];
        }

        let topo = self.topology();
        let mut live = vec![false; self.nodes.len()];
        for &i in &topo.order {
            live[i] = match self.nodes[i].status {
                NodeStatus::Pending | NodeStatus::Ready => {
                    topo.preds[i].is_empty()
                        || topo.preds[i].iter().any(|link| self.link_passes(link, &live))
                }
                NodeStatus::Skipped => false,
                _ => true,
            };
        }

        let mut skipped = Vec::new();
        for (i, alive) in live.into_iter().enumerate() {
            let node = &mut self.nodes[i];
            if !alive && matches!(node.status, NodeStatus::Pending | NodeStatus::Ready) {
                node.status = NodeStatus::Skipped;
                skipped.push(node.id.clone());
                self.events.push(WorkflowEvent::NodeSkipped {
                    graph_id: self.id.clone(),
                    node_id: node.id.clone(),
                });
            }
        }

        for i in 0..self.nodes.len() {
            if self.nodes[i].status == NodeStatus::Pending && self.is_satisfied(i) {
                self.nodes[i].status = NodeStatus::Ready;
            }
        }

        skipped
    }

    /// Whether a link can still carry control to its target. Only called
    /// with `live` filled in for the link's source.
    fn link_passes(&self, link: &Link, live: &[bool]) -> bool {
        let source = &self.nodes[link.node];
        if source.status == NodeStatus::Skipped || !live[link.node] {
            return false;
        }
        match (source.kind, link.edge) {
            (NodeKind::Decision, Some(edge)) => match source.status {
                NodeStatus::Done => {
                    source.selected_branch.as_deref() == Some(self.edges[edge].to.as_str())
                }
                NodeStatus::Failed => false,
                _ => true,
            },
            _ => true,
        }
    }
}
