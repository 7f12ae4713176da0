use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use flowgate_core::error::{FlowgateError, Result};

use crate::graph::{GraphStatus, WorkflowGraph};

/// Shared handle to one live graph. Mutations on a graph are serialized
/// by its mutex; different graphs never contend.
pub type GraphHandle = Arc<Mutex<WorkflowGraph>>;

/// One row of `list_graphs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphListing {
    pub id: String,
    pub name: String,
    pub status: GraphStatus,
    pub node_count: usize,
    pub progress_percent: f64,
    pub updated_at: DateTime<Utc>,
}

/// Bounded registry of live graphs keyed by id.
pub struct GraphStore {
    graphs: RwLock<HashMap<String, GraphHandle>>,
    max_live: usize,
}

impl GraphStore {
    pub fn new(max_live: usize) -> Self {
        Self {
            graphs: RwLock::new(HashMap::new()),
            max_live: max_live.max(1),
        }
    }

    /// Insert a new graph. When the store is over capacity the
    /// least-recently-updated other graph is evicted. Graphs locked by an
    /// in-flight operation are passed over, leaving the store over capacity
    /// until a later insert finds them free. Returns the evicted ids.
    pub async fn insert(&self, graph: WorkflowGraph) -> Result<(GraphHandle, Vec<String>)> {
        let id = graph.id().to_string();
        let handle = Arc::new(Mutex::new(graph));
        let mut graphs = self.graphs.write().await;
        if graphs.contains_key(&id) {
            return Err(FlowgateError::GraphExists(id));
        }
        graphs.insert(id.clone(), handle.clone());

        let mut evicted = Vec::new();
        while graphs.len() > self.max_live {
            let oldest = graphs
                .iter()
                .filter(|(gid, _)| **gid != id)
                .filter_map(|(gid, h)| h.try_lock().ok().map(|g| (g.updated_at(), gid.clone())))
                .min();
            match oldest {
                Some((_, gid)) => {
                    graphs.remove(&gid);
                    evicted.push(gid);
                }
                None => {
                    // retried on the next insert
                    warn!(
                        live = graphs.len(),
                        max_live = self.max_live,
                        "Live graph cap exceeded; every other graph is busy"
                    );
                    break;
                }
            }
        }
        Ok((handle, evicted))
    }

    pub async fn get(&self, graph_id: &str) -> Result<GraphHandle> {
        self.graphs
            .read()
            .await
            .get(graph_id)
            .cloned()
            .ok_or_else(|| FlowgateError::GraphNotFound(graph_id.to_string()))
    }

    pub async fn contains(&self, graph_id: &str) -> bool {
        self.graphs.read().await.contains_key(graph_id)
    }

    pub async fn remove(&self, graph_id: &str) -> Option<GraphHandle> {
        self.graphs.write().await.remove(graph_id)
    }

    pub async fn len(&self) -> usize {
        self.graphs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.graphs.read().await.is_empty()
    }

    /// Summaries of every live graph, sorted by id.
    pub async fn list(&self) -> Vec<GraphListing> {
        let handles: Vec<GraphHandle> = self.graphs.read().await.values().cloned().collect();
        let mut listings = Vec::with_capacity(handles.len());
        for handle in handles {
            let graph = handle.lock().await;
            let done = graph
                .nodes()
                .iter()
                .filter(|n| n.status == crate::graph::NodeStatus::Done)
                .count();
            let total = graph.nodes().len();
            listings.push(GraphListing {
                id: graph.id().to_string(),
                name: graph.name().to_string(),
                status: graph.status(),
                node_count: total,
                progress_percent: if total == 0 {
                    0.0
                } else {
                    done as f64 / total as f64 * 100.0
                },
                updated_at: graph.updated_at(),
            });
        }
        listings.sort_by(|a, b| a.id.cmp(&b.id));
        listings
    }
}
