//! The workflow engine: owns the graph registry and drives transitions.
//!
//! Two modes share the same transitions. In caller-driven mode an agent asks
//! for ready nodes, does the work itself and reports back. In engine-driven
//! mode `execute_graph` dispatches ready nodes to a [`NodeWorker`] with a
//! bounded number in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowgate_core::config::AppConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::event::EventBus;
use flowgate_core::traits::{EvidenceProvider, NodeWorker};
use flowgate_core::types::{NodeKind, NodeOutput, NodeTask, WorkflowEvent};

use crate::gate::{
    effective_gate, Bypass, BypassRecord, GateEvaluator, GateResult, GateSubject,
};
use crate::graph::{
    render_mermaid, CompleteOutcome, DiagramOptions, FailOutcome, GateDecision, GatePolicy,
    GraphAnalysis, GraphDefinition, GraphStatus, NodeCompletion, NodeStatus, NodeView, StartOutcome,
    WorkflowGraph,
};
use crate::registry::{GraphHandle, GraphListing, GraphStore};
use crate::snapshot::SnapshotStore;
use crate::templates::{BuiltinTemplates, TemplateProvider};

/// Returned when a graph is created.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphCreated {
    pub graph_id: String,
    pub name: String,
    /// Nodes that may start immediately.
    pub ready: Vec<NodeView>,
    pub summary: GraphAnalysis,
}

/// Options for engine-driven execution.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Overrides `[engine].concurrency_limit`.
    pub concurrency_limit: Option<usize>,
    /// Complete gated nodes without evidence, writing an audit record each time.
    pub bypass_gates: bool,
    /// Recorded as the actor on bypass audits.
    pub actor: String,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            bypass_gates: false,
            actor: "engine".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOutcome {
    Completed,
    Failed,
    /// Stopped with gated nodes waiting for evidence.
    Blocked,
    /// The graph was deleted or evicted mid-run.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub id: String,
    pub status: NodeStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Latest gate verdict, for blocked nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub graph_id: String,
    pub outcome: ExecutionOutcome,
    pub nodes: Vec<NodeReport>,
    pub bypasses: Vec<BypassRecord>,
    pub analysis: GraphAnalysis,
    pub elapsed_ms: u64,
}

impl ExecutionSummary {
    pub fn node(&self, node_id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

/// A started node waiting to be handed to the worker.
struct Dispatch {
    task: NodeTask,
    timeout_ms: Option<u64>,
}

enum GatePlan {
    NotRequired,
    Bypass(Bypass),
    Evaluate(GateSubject, GatePolicy),
}

pub struct WorkflowEngine {
    store: GraphStore,
    gates: GateEvaluator,
    templates: Arc<dyn TemplateProvider>,
    event_bus: Arc<EventBus>,
    snapshots: Option<Arc<SnapshotStore>>,
    config: AppConfig,
}

impl WorkflowEngine {
    pub fn new(config: AppConfig, evidence: Arc<dyn EvidenceProvider>) -> Self {
        Self {
            store: GraphStore::new(config.engine.max_live_graphs),
            gates: GateEvaluator::new(evidence, config.gates.clone()),
            templates: Arc::new(BuiltinTemplates),
            event_bus: Arc::new(EventBus::default()),
            snapshots: None,
            config,
        }
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateProvider>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn templates(&self) -> &Arc<dyn TemplateProvider> {
        &self.templates
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Load every stored snapshot into the registry. Returns how many
    /// graphs were restored.
    pub async fn restore(&self) -> Result<usize> {
        let Some(ref snapshots) = self.snapshots else {
            return Ok(0);
        };
        let mut restored = 0;
        for graph in snapshots.load_all()? {
            let graph_id = graph.id().to_string();
            match self.store.insert(graph).await {
                Ok((_, evicted)) => {
                    restored += 1;
                    self.forget(evicted);
                }
                Err(e) => warn!(graph_id = %graph_id, error = %e, "Skipping snapshot"),
            }
        }
        info!(restored, "Restored graphs from snapshots");
        Ok(restored)
    }

    /// Validate a definition and register the resulting graph.
    pub async fn create_graph(
        &self,
        definition: GraphDefinition,
        context: serde_json::Value,
    ) -> Result<GraphCreated> {
        let graph = WorkflowGraph::build(definition, context, &self.config.engine)?;
        let created = GraphCreated {
            graph_id: graph.id().to_string(),
            name: graph.name().to_string(),
            ready: graph.ready_nodes(),
            summary: graph.analyze(),
        };
        let node_count = graph.nodes().len();

        let (handle, evicted) = self.store.insert(graph).await?;
        info!(graph_id = %created.graph_id, name = %created.name, node_count, "Graph created");
        self.event_bus.publish(WorkflowEvent::GraphCreated {
            graph_id: created.graph_id.clone(),
            name: created.name.clone(),
            node_count,
        });
        self.persist(&*handle.lock().await);
        self.forget(evicted);
        Ok(created)
    }

    /// Instantiate a template. `context.files`, when given, becomes the
    /// file scope of every node that declares none.
    pub async fn start_workflow(
        &self,
        template: &str,
        context: serde_json::Value,
    ) -> Result<GraphCreated> {
        let mut definition = self
            .templates
            .get(template)
            .ok_or_else(|| FlowgateError::TemplateNotFound(template.to_string()))?;

        let files: Vec<String> = context
            .get("files")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|f| f.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if !files.is_empty() {
            for node in definition.nodes.iter_mut().filter(|n| n.files.is_empty()) {
                node.files = files.clone();
            }
        }

        self.create_graph(definition, context).await
    }

    pub async fn next_nodes(&self, graph_id: &str) -> Result<Vec<NodeView>> {
        let handle = self.store.get(graph_id).await?;
        let graph = handle.lock().await;
        Ok(graph.ready_nodes())
    }

    pub async fn start_node(&self, graph_id: &str, node_id: &str) -> Result<StartOutcome> {
        let handle = self.store.get(graph_id).await?;
        let mut graph = handle.lock().await;
        let outcome = graph.start_node(node_id)?;
        if let StartOutcome::Started(ref view) = outcome {
            debug!(graph_id, node_id, attempt = view.attempts, "Node started");
        }
        self.after_mutation(&mut graph);
        Ok(outcome)
    }

    /// Report success. Gated nodes are checked against the latest evidence
    /// unless `bypass` is given, in which case an audit record is written.
    pub async fn complete_node(
        &self,
        graph_id: &str,
        node_id: &str,
        completion: NodeCompletion,
        bypass: Option<Bypass>,
    ) -> Result<CompleteOutcome> {
        let handle = self.store.get(graph_id).await?;
        self.complete_on(&handle, graph_id, node_id, completion, bypass)
            .await
    }

    pub async fn fail_node(&self, graph_id: &str, node_id: &str, error: &str) -> Result<FailOutcome> {
        let handle = self.store.get(graph_id).await?;
        self.fail_on(&handle, node_id, error).await
    }

    pub async fn analyze(&self, graph_id: &str) -> Result<GraphAnalysis> {
        let handle = self.store.get(graph_id).await?;
        let graph = handle.lock().await;
        Ok(graph.analyze())
    }

    pub async fn export_diagram(&self, graph_id: &str, options: &DiagramOptions) -> Result<String> {
        let handle = self.store.get(graph_id).await?;
        let graph = handle.lock().await;
        Ok(render_mermaid(&graph, options))
    }

    /// A copy of the graph's current state.
    pub async fn graph(&self, graph_id: &str) -> Result<WorkflowGraph> {
        let handle = self.store.get(graph_id).await?;
        let graph = handle.lock().await;
        Ok(graph.clone())
    }

    pub async fn list_graphs(&self) -> Vec<GraphListing> {
        self.store.list().await
    }

    /// Remove a graph. Running engine-driven work is not interrupted, but
    /// nothing further is scheduled for it.
    pub async fn delete_graph(&self, graph_id: &str) -> Result<()> {
        self.store
            .remove(graph_id)
            .await
            .ok_or_else(|| FlowgateError::GraphNotFound(graph_id.to_string()))?;
        info!(graph_id, "Graph deleted");
        self.event_bus.publish(WorkflowEvent::GraphDeleted {
            graph_id: graph_id.to_string(),
        });
        self.drop_snapshot(graph_id);
        Ok(())
    }

    /// Create a graph and run it to completion with `worker`.
    pub async fn execute_graph(
        &self,
        definition: GraphDefinition,
        context: serde_json::Value,
        options: ExecuteOptions,
        worker: Arc<dyn NodeWorker>,
    ) -> Result<ExecutionSummary> {
        let started = Instant::now();
        let created = self.create_graph(definition, context).await?;
        let graph_id = created.graph_id;
        let handle = self.store.get(&graph_id).await?;
        let limit = options
            .concurrency_limit
            .unwrap_or(self.config.engine.concurrency_limit)
            .max(1);

        info!(graph_id = %graph_id, limit, bypass_gates = options.bypass_gates, "Executing graph");

        let mut in_flight: JoinSet<(String, Result<NodeOutput>)> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !self.store.contains(&graph_id).await {
                cancelled = true;
                break;
            }

            let dispatched = {
                let mut graph = handle.lock().await;
                let dispatched =
                    Self::dispatch_ready(&mut graph, limit.saturating_sub(in_flight.len()));
                self.after_mutation(&mut graph);
                let dispatched = dispatched?;
                if graph.status() != GraphStatus::Active {
                    break;
                }
                dispatched
            };
            for dispatch in dispatched {
                spawn_node(&mut in_flight, worker.clone(), dispatch);
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (node_id, outcome) = joined.map_err(|e| FlowgateError::NodeExecution {
                node: graph_id.clone(),
                message: format!("dispatcher task failed: {}", e),
            })?;

            if !self.store.contains(&graph_id).await {
                cancelled = true;
                break;
            }
            match outcome {
                Ok(output) => {
                    let bypass = options.bypass_gates.then(|| {
                        Bypass::new(options.actor.clone(), "bypass_gates set for engine-driven run")
                    });
                    let completion = NodeCompletion {
                        result: Some(output.result),
                        tokens_used: Some(output.tokens_used),
                    };
                    self.complete_on(&handle, &graph_id, &node_id, completion, bypass)
                        .await?;
                }
                Err(e) => {
                    warn!(graph_id = %graph_id, node_id = %node_id, error = %e, "Node attempt failed");
                    self.fail_on(&handle, &node_id, &e.to_string()).await?;
                }
            }
        }

        let graph = handle.lock().await;
        let outcome = if cancelled {
            ExecutionOutcome::Cancelled
        } else {
            match graph.status() {
                GraphStatus::Completed => ExecutionOutcome::Completed,
                GraphStatus::Failed => ExecutionOutcome::Failed,
                GraphStatus::Active => ExecutionOutcome::Blocked,
            }
        };
        let summary = ExecutionSummary {
            graph_id: graph_id.clone(),
            outcome,
            nodes: graph
                .nodes()
                .iter()
                .map(|n| NodeReport {
                    id: n.id.clone(),
                    status: n.status,
                    attempts: n.attempts,
                    error: n.error.clone(),
                    result: n.result.clone(),
                    gate: (n.status == NodeStatus::Blocked)
                        .then(|| n.last_gate.clone())
                        .flatten(),
                })
                .collect(),
            bypasses: graph.audit_log().to_vec(),
            analysis: graph.analyze(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(graph_id = %graph_id, outcome = ?summary.outcome, elapsed_ms = summary.elapsed_ms, "Execution finished");
        Ok(summary)
    }

    /// Start as many ready nodes as `slots` allows, highest priority first.
    /// Join nodes complete on the spot and take no slot.
    fn dispatch_ready(graph: &mut WorkflowGraph, slots: usize) -> Result<Vec<Dispatch>> {
        let mut dispatched = Vec::new();
        loop {
            let mut ready = graph.ready_indices();
            ready.sort_by_key(|&i| std::cmp::Reverse(graph.nodes()[i].priority));

            let mut joined_any = false;
            for idx in ready {
                let (node_id, kind) = {
                    let node = &graph.nodes()[idx];
                    (node.id.clone(), node.kind)
                };
                if kind != NodeKind::Join && dispatched.len() >= slots {
                    continue;
                }
                let view = match graph.start_node(&node_id)? {
                    StartOutcome::Started(view) => view,
                    StartOutcome::NotReady(_) => continue,
                };
                if kind == NodeKind::Join {
                    graph.complete_node(&node_id, NodeCompletion::default(), GateDecision::NotRequired)?;
                    joined_any = true;
                    continue;
                }

                let timeout_ms = graph.effective_timeout_ms(idx);
                dispatched.push(Dispatch {
                    task: NodeTask {
                        graph_id: graph.id().to_string(),
                        node_id,
                        label: view.label,
                        kind,
                        phase: view.phase,
                        payload: view.payload,
                        tools: view.tools,
                        files: view.files,
                        attempt: view.attempts,
                        deadline: timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
                        cancel: CancellationToken::new(),
                    },
                    timeout_ms,
                });
            }
            if !joined_any || graph.status() != GraphStatus::Active {
                break;
            }
        }
        Ok(dispatched)
    }

    async fn complete_on(
        &self,
        handle: &GraphHandle,
        graph_id: &str,
        node_id: &str,
        completion: NodeCompletion,
        bypass: Option<Bypass>,
    ) -> Result<CompleteOutcome> {
        // Decide what the gate needs without holding the lock across the
        // evidence lookup.
        let plan = {
            let graph = handle.lock().await;
            let idx = match graph.completable(node_id)? {
                Ok(idx) => idx,
                Err(not_ready) => return Ok(CompleteOutcome::NotReady(not_ready)),
            };
            let node = &graph.nodes()[idx];
            match (
                effective_gate(node, graph.defaults(), self.config.gates.max_age_ms),
                bypass,
            ) {
                (None, _) => GatePlan::NotRequired,
                (Some(_), Some(bypass)) => GatePlan::Bypass(bypass),
                (Some(policy), None) => GatePlan::Evaluate(
                    GateSubject {
                        graph_id: graph_id.to_string(),
                        node_id: node_id.to_string(),
                        files: node.files.clone(),
                    },
                    policy,
                ),
            }
        };

        let decision = match plan {
            GatePlan::NotRequired => GateDecision::NotRequired,
            GatePlan::Bypass(bypass) => {
                warn!(graph_id, node_id, actor = %bypass.actor, reason = %bypass.reason, "Gate bypassed");
                GateDecision::Bypassed(BypassRecord::new(graph_id, node_id, &bypass))
            }
            GatePlan::Evaluate(subject, policy) => {
                let result = self.gates.evaluate(&subject, &policy).await;
                debug!(graph_id, node_id, status = ?result.status, "Gate evaluated");
                if result.is_passed() {
                    GateDecision::Passed(result)
                } else {
                    GateDecision::Blocked(result)
                }
            }
        };

        let mut graph = handle.lock().await;
        let outcome = graph.complete_node(node_id, completion, decision)?;
        self.after_mutation(&mut graph);
        Ok(outcome)
    }

    async fn fail_on(&self, handle: &GraphHandle, node_id: &str, error: &str) -> Result<FailOutcome> {
        let mut graph = handle.lock().await;
        let outcome = graph.fail_node(node_id, error)?;
        self.after_mutation(&mut graph);
        Ok(outcome)
    }

    /// Publish queued events and write a snapshot.
    fn after_mutation(&self, graph: &mut WorkflowGraph) {
        for event in graph.drain_events() {
            self.event_bus.publish(event);
        }
        self.persist(graph);
    }

    fn persist(&self, graph: &WorkflowGraph) {
        if let Some(ref snapshots) = self.snapshots {
            if let Err(e) = snapshots.save(graph) {
                warn!(graph_id = %graph.id(), error = %e, "Failed to save snapshot");
            }
        }
    }

    fn drop_snapshot(&self, graph_id: &str) {
        if let Some(ref snapshots) = self.snapshots {
            if let Err(e) = snapshots.delete(graph_id) {
                warn!(graph_id, error = %e, "Failed to delete snapshot");
            }
        }
    }

    fn forget(&self, evicted: Vec<String>) {
        for graph_id in evicted {
            info!(graph_id = %graph_id, "Graph evicted");
            self.drop_snapshot(&graph_id);
            self.event_bus.publish(WorkflowEvent::GraphEvicted { graph_id });
        }
    }
}

/// Run one attempt on its own task. On timeout the engine stops waiting and
/// cancels the token; the attempt itself is left to wind down.
fn spawn_node(
    in_flight: &mut JoinSet<(String, Result<NodeOutput>)>,
    worker: Arc<dyn NodeWorker>,
    dispatch: Dispatch,
) {
    let Dispatch { task, timeout_ms } = dispatch;
    let node_id = task.node_id.clone();
    let cancel = task.cancel.clone();

    in_flight.spawn(async move {
        let work = tokio::spawn(async move { worker.run(task).await });
        let outcome = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), work).await {
                Ok(joined) => flatten(&node_id, joined),
                Err(_) => {
                    cancel.cancel();
                    Err(FlowgateError::NodeTimeout {
                        node: node_id.clone(),
                        timeout_ms: ms,
                    })
                }
            },
            None => flatten(&node_id, work.await),
        };
        (node_id, outcome)
    });
}

fn flatten(
    node_id: &str,
    joined: std::result::Result<Result<NodeOutput>, JoinError>,
) -> Result<NodeOutput> {
    joined.unwrap_or_else(|e| {
        Err(FlowgateError::NodeExecution {
            node: node_id.to_string(),
            message: format!("worker panicked: {}", e),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceLedger;
    use crate::graph::{WorkflowEdge, WorkflowNode};
    use flowgate_core::types::{Evidence, EvidenceKind, Phase};
    use futures::future::BoxFuture;
    use serde_json::json;

    struct EchoWorker;

    impl NodeWorker for EchoWorker {
        fn run(&self, task: NodeTask) -> BoxFuture<'_, Result<NodeOutput>> {
            Box::pin(async move { Ok(NodeOutput::new(json!({ "node": task.node_id })).with_tokens(3)) })
        }
    }

    fn engine() -> (WorkflowEngine, Arc<EvidenceLedger>) {
        let ledger = Arc::new(EvidenceLedger::new());
        (WorkflowEngine::new(AppConfig::default(), ledger.clone()), ledger)
    }

    fn gated() -> GraphDefinition {
        GraphDefinition::new("gated", "plan")
            .with_node(WorkflowNode::new("plan", "Plan").with_phase(Phase::Plan))
            .with_node(
                WorkflowNode::new("impl", "Implement")
                    .with_phase(Phase::Impl)
                    .with_files(vec!["src/lib.rs".into()]),
            )
            .with_edge(WorkflowEdge::new("plan", "impl"))
    }

    #[tokio::test]
    async fn test_gate_blocks_until_evidence_recorded() {
        let (engine, ledger) = engine();
        let created = engine.create_graph(gated(), json!({})).await.unwrap();
        let gid = created.graph_id;
        assert_eq!(created.ready[0].id, "plan");

        engine.start_node(&gid, "plan").await.unwrap();
        engine
            .complete_node(&gid, "plan", NodeCompletion::default(), None)
            .await
            .unwrap();
        engine.start_node(&gid, "impl").await.unwrap();

        match engine
            .complete_node(&gid, "impl", NodeCompletion::default(), None)
            .await
            .unwrap()
        {
            CompleteOutcome::Blocked { gate, .. } => {
                assert_eq!(gate.missing_evidence, vec![EvidenceKind::Guard]);
                assert_eq!(gate.next_tool_calls[0].tool, "code_lint");
            }
            other => panic!("unexpected: {other:?}"),
        }

        ledger
            .record(Evidence::new(EvidenceKind::Guard, true).with_scope(vec!["src".into()]))
            .await;
        let outcome = engine
            .complete_node(&gid, "impl", NodeCompletion::default(), None)
            .await
            .unwrap();
        assert!(matches!(outcome, CompleteOutcome::Completed(ref p) if p.graph_status == GraphStatus::Completed));
    }

    #[tokio::test]
    async fn test_bypass_writes_audit_and_event() {
        let (engine, _) = engine();
        let mut events = engine.event_bus().subscribe();
        let gid = engine.create_graph(gated(), json!({})).await.unwrap().graph_id;
        engine.start_node(&gid, "plan").await.unwrap();
        engine
            .complete_node(&gid, "plan", NodeCompletion::default(), None)
            .await
            .unwrap();
        engine.start_node(&gid, "impl").await.unwrap();
        engine
            .complete_node(
                &gid,
                "impl",
                NodeCompletion::default(),
                Some(Bypass::new("alice", "lint server down")),
            )
            .await
            .unwrap();

        let graph = engine.graph(&gid).await.unwrap();
        assert_eq!(graph.audit_log().len(), 1);
        assert_eq!(graph.audit_log()[0].actor(), "alice");
        assert_eq!(graph.audit_log()[0].node_id(), "impl");

        let mut saw_bypass = false;
        while let Ok(event) = events.try_recv() {
            if let WorkflowEvent::GateBypassed { actor, reason, .. } = event {
                assert_eq!(actor, "alice");
                assert_eq!(reason, "lint server down");
                saw_bypass = true;
            }
        }
        assert!(saw_bypass);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_errors() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.next_nodes("wf-missing").await.unwrap_err(),
            FlowgateError::GraphNotFound(_)
        ));
        let gid = engine.create_graph(gated(), json!({})).await.unwrap().graph_id;
        assert!(matches!(
            engine.start_node(&gid, "nope").await.unwrap_err(),
            FlowgateError::NodeNotFound { .. }
        ));
        assert!(matches!(
            engine.start_workflow("deploy", json!({})).await.unwrap_err(),
            FlowgateError::TemplateNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_start_workflow_applies_files() {
        let (engine, _) = engine();
        let created = engine
            .start_workflow("feature", json!({ "files": ["src/auth.rs"] }))
            .await
            .unwrap();
        let graph = engine.graph(&created.graph_id).await.unwrap();
        assert!(graph.nodes().iter().all(|n| n.files == vec!["src/auth.rs"]));
        assert_eq!(created.ready.len(), 1);
        assert_eq!(created.summary.total_nodes, 5);
    }

    #[tokio::test]
    async fn test_execute_with_bypass_completes() {
        let (engine, _) = engine();
        let summary = engine
            .execute_graph(
                gated(),
                json!({}),
                ExecuteOptions {
                    bypass_gates: true,
                    ..Default::default()
                },
                Arc::new(EchoWorker),
            )
            .await
            .unwrap();
        assert_eq!(summary.outcome, ExecutionOutcome::Completed);
        assert_eq!(summary.bypasses.len(), 1);
        assert_eq!(summary.bypasses[0].actor(), "engine");
        assert_eq!(summary.analysis.actual_tokens_used, 6);
        assert_eq!(summary.node("impl").unwrap().result, Some(json!({ "node": "impl" })));
    }

    #[tokio::test]
    async fn test_execute_stops_blocked_without_evidence() {
        let (engine, _) = engine();
        let summary = engine
            .execute_graph(gated(), json!({}), ExecuteOptions::default(), Arc::new(EchoWorker))
            .await
            .unwrap();
        assert_eq!(summary.outcome, ExecutionOutcome::Blocked);
        let report = summary.node("impl").unwrap();
        assert_eq!(report.status, NodeStatus::Blocked);
        assert_eq!(
            report.gate.as_ref().unwrap().missing_evidence,
            vec![EvidenceKind::Guard]
        );
    }

    struct BackendDown;

    impl EvidenceProvider for BackendDown {
        fn latest(
            &self,
            _kind: EvidenceKind,
            _files: &[String],
        ) -> BoxFuture<'_, Result<Option<Evidence>>> {
            Box::pin(async { Err(FlowgateError::Evidence("evidence backend down".into())) })
        }
    }

    #[tokio::test]
    async fn test_execute_blocks_when_evidence_lookup_fails() {
        let engine = WorkflowEngine::new(AppConfig::default(), Arc::new(BackendDown));
        let summary = engine
            .execute_graph(gated(), json!({}), ExecuteOptions::default(), Arc::new(EchoWorker))
            .await
            .unwrap();
        assert_eq!(summary.outcome, ExecutionOutcome::Blocked);

        let report = summary.node("impl").unwrap();
        assert_eq!(report.status, NodeStatus::Blocked);
        let gate = report.gate.as_ref().unwrap();
        assert_eq!(gate.missing_evidence, vec![EvidenceKind::Guard]);
        assert!(gate.next_tool_calls[0].reason.contains("evidence backend down"));
        assert_eq!(gate.next_tool_calls.last().unwrap().tool, "complete_node");

        let graph = engine.graph(&summary.graph_id).await.unwrap();
        assert!(graph.nodes().iter().all(|n| n.status != NodeStatus::Running));
    }

    #[tokio::test]
    async fn test_complete_blocks_when_evidence_lookup_fails() {
        let engine = WorkflowEngine::new(AppConfig::default(), Arc::new(BackendDown));
        let gid = engine.create_graph(gated(), json!({})).await.unwrap().graph_id;
        engine.start_node(&gid, "plan").await.unwrap();
        engine
            .complete_node(&gid, "plan", NodeCompletion::default(), None)
            .await
            .unwrap();
        engine.start_node(&gid, "impl").await.unwrap();

        let outcome = engine
            .complete_node(&gid, "impl", NodeCompletion::default(), None)
            .await
            .unwrap();
        assert!(matches!(outcome, CompleteOutcome::Blocked { .. }));
        let graph = engine.graph(&gid).await.unwrap();
        assert_eq!(graph.node("impl").unwrap().status, NodeStatus::Blocked);
    }

    #[tokio::test]
    async fn test_graph_default_policy_gates_unphased_nodes() {
        let (engine, ledger) = engine();
        let definition = GraphDefinition::new("defaults", "a")
            .with_node(WorkflowNode::new("a", "A"))
            .with_defaults(crate::graph::GraphDefaults {
                gate_policy: Some(GatePolicy::guard()),
                ..Default::default()
            });
        let created = engine.create_graph(definition, json!({})).await.unwrap();
        assert!(created.ready[0].gate_required);
        let gid = created.graph_id;

        engine.start_node(&gid, "a").await.unwrap();
        match engine
            .complete_node(&gid, "a", NodeCompletion::default(), None)
            .await
            .unwrap()
        {
            CompleteOutcome::Blocked { gate, .. } => {
                assert_eq!(gate.missing_evidence, vec![EvidenceKind::Guard]);
            }
            other => panic!("unexpected: {other:?}"),
        }

        ledger.record(Evidence::new(EvidenceKind::Guard, true)).await;
        let outcome = engine
            .complete_node(&gid, "a", NodeCompletion::default(), None)
            .await
            .unwrap();
        assert!(matches!(outcome, CompleteOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_delete_graph() {
        let (engine, _) = engine();
        let gid = engine.create_graph(gated(), json!({})).await.unwrap().graph_id;
        assert_eq!(engine.list_graphs().await.len(), 1);
        engine.delete_graph(&gid).await.unwrap();
        assert!(engine.list_graphs().await.is_empty());
        assert!(engine.delete_graph(&gid).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshots_restore_into_fresh_engine() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = Arc::new(SnapshotStore::open(&dir.path().join("snap.db")).unwrap());
        let (engine, _) = engine();
        let engine = engine.with_snapshots(snapshots.clone());
        let gid = engine.create_graph(gated(), json!({})).await.unwrap().graph_id;
        engine.start_node(&gid, "plan").await.unwrap();
        engine
            .complete_node(&gid, "plan", NodeCompletion::new(json!("planned")), None)
            .await
            .unwrap();

        let (fresh, _) = self::engine();
        let fresh = fresh.with_snapshots(snapshots);
        assert_eq!(fresh.restore().await.unwrap(), 1);
        let ready = fresh.next_nodes(&gid).await.unwrap();
        assert_eq!(ready[0].id, "impl");
    }
}
