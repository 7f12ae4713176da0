use serde::{Deserialize, Serialize};

use flowgate_core::types::Phase;

use super::model::{GraphStatus, WorkflowGraph};
use super::node::NodeStatus;

/// Number of nodes per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub blocked: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    fn add(&mut self, status: NodeStatus) {
        let slot = match status {
            NodeStatus::Pending => &mut self.pending,
            NodeStatus::Ready => &mut self.ready,
            NodeStatus::Running => &mut self.running,
            NodeStatus::Blocked => &mut self.blocked,
            NodeStatus::Done => &mut self.done,
            NodeStatus::Failed => &mut self.failed,
            NodeStatus::Skipped => &mut self.skipped,
        };
        *slot += 1;
    }
}

/// Heaviest root-to-sink path by estimated tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalPath {
    pub node_ids: Vec<String>,
    /// Running token total at each node of the path.
    pub cumulative_tokens: Vec<u64>,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphAnalysis {
    pub graph_id: String,
    pub name: String,
    pub status: GraphStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<Phase>,
    pub total_nodes: usize,
    pub counts: StatusCounts,
    pub progress_percent: f64,
    pub critical_path: CriticalPath,
    /// Nodes grouped by depth; each group can run concurrently.
    pub parallel_groups: Vec<Vec<String>>,
    pub max_parallelism: usize,
    pub total_estimated_tokens: u64,
    pub actual_tokens_used: u64,
    pub estimated_remaining_tokens: u64,
    pub bypass_count: usize,
}

impl WorkflowGraph {
    /// Progress, critical path and parallelism. Read-only.
    pub fn analyze(&self) -> GraphAnalysis {
        let mut counts = StatusCounts::default();
        for node in &self.nodes {
            counts.add(node.status);
        }
        let total = self.nodes.len();
        let progress_percent = if total == 0 {
            0.0
        } else {
            counts.done as f64 / total as f64 * 100.0
        };
        let estimated_remaining_tokens = self
            .nodes
            .iter()
            .filter(|n| !matches!(n.status, NodeStatus::Done | NodeStatus::Skipped))
            .map(|n| n.estimated_tokens)
            .sum();
        let parallel_groups = self.parallel_groups();
        let max_parallelism = parallel_groups.iter().map(Vec::len).max().unwrap_or(0);

        GraphAnalysis {
            graph_id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            current_phase: self.current_phase,
            total_nodes: total,
            counts,
            progress_percent,
            critical_path: self.critical_path(),
            parallel_groups,
            max_parallelism,
            total_estimated_tokens: self.total_estimated_tokens,
            actual_tokens_used: self.actual_tokens_used,
            estimated_remaining_tokens,
            bypass_count: self.audit_log.len(),
        }
    }

    /// Longest path weighted by `estimatedTokens`. Ties go to the node
    /// declared first.
    pub fn critical_path(&self) -> CriticalPath {
        let topo = self.topology();
        let n = self.nodes.len();
        let mut dist = vec![0u64; n];
        let mut prev: Vec<Option<usize>> = vec![None; n];

        for &i in &topo.order {
            let best = topo
                .predecessor_nodes(i)
                .into_iter()
                .fold(None, |best: Option<usize>, p| match best {
                    Some(b) if dist[b] >= dist[p] => Some(b),
                    _ => Some(p),
                });
            dist[i] = best.map_or(0, |b| dist[b]) + self.nodes[i].estimated_tokens;
            prev[i] = best;
        }

        let mut end: Option<usize> = None;
        for i in (0..n).filter(|&i| topo.succs[i].is_empty()) {
            if end.map_or(true, |e| dist[i] > dist[e]) {
                end = Some(i);
            }
        }

        let mut path = Vec::new();
        let mut cursor = end;
        while let Some(i) = cursor {
            path.push(i);
            cursor = prev[i];
        }
        path.reverse();

        let mut running = 0;
        let cumulative_tokens = path
            .iter()
            .map(|&i| {
                running += self.nodes[i].estimated_tokens;
                running
            })
            .collect();

        CriticalPath {
            node_ids: path.iter().map(|&i| self.nodes[i].id.clone()).collect(),
            cumulative_tokens,
            total_tokens: end.map_or(0, |e| dist[e]),
        }
    }

    /// Group nodes by depth: roots at 0, otherwise one past the deepest
    /// predecessor. Ids keep declaration order within a group.
    pub fn parallel_groups(&self) -> Vec<Vec<String>> {
        let topo = self.topology();
        let mut depth = vec![0usize; self.nodes.len()];
        for &i in &topo.order {
            depth[i] = topo.preds[i]
                .iter()
                .map(|link| depth[link.node] + 1)
                .max()
                .unwrap_or(0);
        }

        let layers = depth.iter().max().map_or(0, |d| d + 1);
        let mut groups = vec![Vec::new(); layers];
        for (i, &d) in depth.iter().enumerate() {
            groups[d].push(self.nodes[i].id.clone());
        }
        groups
    }
}
