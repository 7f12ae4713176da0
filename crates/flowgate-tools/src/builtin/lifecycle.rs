use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::{NodeWorker, Tool};
use flowgate_core::types::{ToolContext, ToolResult};
use flowgate_workflow::{
    Bypass, CompleteOutcome, ExecuteOptions, FailOutcome, GraphDefinition, NodeCompletion,
    StartOutcome, WorkflowEngine,
};

use super::{not_ready, parse_input, success, tagged};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeRef {
    graph_id: String,
    node_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRef {
    graph_id: String,
}

fn fail_result(outcome: FailOutcome) -> Result<ToolResult> {
    match outcome {
        FailOutcome::Retrying {
            node_id,
            attempt,
            remaining,
            error,
        } => Ok(ToolResult::success(json!({
            "outcome": "retrying",
            "nodeId": node_id,
            "nextAttempt": attempt,
            "remainingRetries": remaining,
            "error": error,
        }))),
        FailOutcome::Failed(report) => Ok(ToolResult::success(tagged("failed", &report)?)),
        FailOutcome::NotReady(nr) => not_ready(&nr),
    }
}

// ── StartWorkflowTool ───────────────────────────────────────────

pub struct StartWorkflowTool {
    engine: Arc<WorkflowEngine>,
}

impl StartWorkflowTool {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartWorkflowInput {
    template: String,
    #[serde(default)]
    context: serde_json::Value,
}

impl Tool for StartWorkflowTool {
    fn name(&self) -> &str {
        "start_workflow"
    }

    fn description(&self) -> &str {
        "Instantiate a workflow template (feature, bugfix, refactor, review). \
         A `files` array in the context scopes every node without its own files."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "template": { "type": "string", "description": "Template name" },
                "context": { "type": "object", "description": "Initial condition context" }
            },
            "required": ["template"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: StartWorkflowInput = parse_input(input)?;
            let created = self
                .engine
                .start_workflow(&params.template, params.context)
                .await?;
            Ok(ToolResult::success(json!({
                "graphId": created.graph_id,
                "name": created.name,
                "firstReadyNodes": created.ready,
                "summary": created.summary,
            })))
        })
    }
}

// ── GetNextNodesTool ────────────────────────────────────────────

pub struct GetNextNodesTool {
    engine: Arc<WorkflowEngine>,
}

impl GetNextNodesTool {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for GetNextNodesTool {
    fn name(&self) -> &str {
        "get_next_nodes"
    }

    fn description(&self) -> &str {
        "List the nodes whose predecessors are all finished and that can start now."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "graphId": { "type": "string" }
            },
            "required": ["graphId"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: GraphRef = parse_input(input)?;
            let nodes = self.engine.next_nodes(&params.graph_id).await?;
            Ok(ToolResult::success(json!({
                "graphId": params.graph_id,
                "nodes": nodes,
            })))
        })
    }
}

// ── StartNodeTool ───────────────────────────────────────────────

pub struct StartNodeTool {
    engine: Arc<WorkflowEngine>,
}

impl StartNodeTool {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for StartNodeTool {
    fn name(&self) -> &str {
        "start_node"
    }

    fn description(&self) -> &str {
        "Mark a ready node as running. Returns the node's payload, tools and files."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "graphId": { "type": "string" },
                "nodeId": { "type": "string" }
            },
            "required": ["graphId", "nodeId"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: NodeRef = parse_input(input)?;
            match self
                .engine
                .start_node(&params.graph_id, &params.node_id)
                .await?
            {
                StartOutcome::Started(node) => Ok(ToolResult::success(json!({
                    "outcome": "started",
                    "node": node,
                }))),
                StartOutcome::NotReady(nr) => not_ready(&nr),
            }
        })
    }
}

// ── CompleteNodeTool ────────────────────────────────────────────

pub struct CompleteNodeTool {
    engine: Arc<WorkflowEngine>,
}

impl CompleteNodeTool {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteInput {
    graph_id: String,
    node_id: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    tokens_used: Option<u64>,
    #[serde(default)]
    bypass_gates: bool,
    #[serde(default)]
    bypass_reason: Option<String>,
}

impl Tool for CompleteNodeTool {
    fn name(&self) -> &str {
        "complete_node"
    }

    fn description(&self) -> &str {
        "Report a node as finished. Gated nodes only complete when fresh passing \
         evidence covers their files; otherwise the response lists what is missing \
         and which tool calls will unblock it. bypassGates skips the check and is audited."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "graphId": { "type": "string" },
                "nodeId": { "type": "string" },
                "result": { "description": "Node result, visible to later conditions as results.<nodeId>" },
                "tokensUsed": { "type": "integer", "minimum": 0 },
                "bypassGates": { "type": "boolean", "description": "Complete without evidence (audited)" },
                "bypassReason": { "type": "string", "description": "Required with bypassGates" }
            },
            "required": ["graphId", "nodeId"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: CompleteInput = parse_input(input)?;
            let bypass = if params.bypass_gates {
                let reason = params
                    .bypass_reason
                    .filter(|r| !r.trim().is_empty())
                    .ok_or_else(|| {
                        FlowgateError::ToolValidation(
                            "'bypassReason' is required when 'bypassGates' is true".into(),
                        )
                    })?;
                warn!(
                    graph_id = %params.graph_id,
                    node_id = %params.node_id,
                    actor = %ctx.actor,
                    reason = %reason,
                    "Gate bypass requested"
                );
                Some(Bypass::new(ctx.actor.clone(), reason))
            } else {
                None
            };
            let completion = NodeCompletion {
                result: params.result,
                tokens_used: params.tokens_used,
            };

            match self
                .engine
                .complete_node(&params.graph_id, &params.node_id, completion, bypass)
                .await?
            {
                CompleteOutcome::Completed(progress) => {
                    Ok(ToolResult::success(tagged("completed", &progress)?))
                }
                CompleteOutcome::Blocked { node_id, gate } => {
                    let mut content = tagged("blocked", &gate)?;
                    if let Some(obj) = content.as_object_mut() {
                        obj.insert("nodeId".into(), node_id.into());
                    }
                    Ok(ToolResult::success(content))
                }
                CompleteOutcome::NoMatchingBranch(failure) => fail_result(failure),
                CompleteOutcome::NotReady(nr) => not_ready(&nr),
            }
        })
    }
}

// ── FailNodeTool ────────────────────────────────────────────────

pub struct FailNodeTool {
    engine: Arc<WorkflowEngine>,
}

impl FailNodeTool {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailInput {
    graph_id: String,
    node_id: String,
    error: String,
}

impl Tool for FailNodeTool {
    fn name(&self) -> &str {
        "fail_node"
    }

    fn description(&self) -> &str {
        "Report a failed attempt. The node is retried while retries remain, \
         then its onError policy applies."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "graphId": { "type": "string" },
                "nodeId": { "type": "string" },
                "error": { "type": "string" }
            },
            "required": ["graphId", "nodeId", "error"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: FailInput = parse_input(input)?;
            let outcome = self
                .engine
                .fail_node(&params.graph_id, &params.node_id, &params.error)
                .await?;
            fail_result(outcome)
        })
    }
}

// ── ExecuteGraphTool ────────────────────────────────────────────

pub struct ExecuteGraphTool {
    engine: Arc<WorkflowEngine>,
    worker: Arc<dyn NodeWorker>,
}

impl ExecuteGraphTool {
    pub fn new(engine: Arc<WorkflowEngine>, worker: Arc<dyn NodeWorker>) -> Self {
        Self { engine, worker }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteInput {
    definition: GraphDefinition,
    #[serde(default)]
    context: serde_json::Value,
    #[serde(default)]
    concurrency_limit: Option<usize>,
    #[serde(default)]
    bypass_gates: bool,
}

impl Tool for ExecuteGraphTool {
    fn name(&self) -> &str {
        "execute_graph"
    }

    fn description(&self) -> &str {
        "Create a graph and run it to the end, dispatching ready nodes to the \
         configured worker. Stops early when gated nodes lack evidence."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "definition": { "type": "object", "description": "Graph definition" },
                "context": { "type": "object" },
                "concurrencyLimit": { "type": "integer", "minimum": 1 },
                "bypassGates": { "type": "boolean" }
            },
            "required": ["definition"]
        })
    }

    fn timeout_secs(&self) -> u64 {
        3600
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: ExecuteInput = parse_input(input)?;
            let options = ExecuteOptions {
                concurrency_limit: params.concurrency_limit,
                bypass_gates: params.bypass_gates,
                actor: ctx.actor,
            };
            let summary = self
                .engine
                .execute_graph(params.definition, params.context, options, self.worker.clone())
                .await?;
            success(&summary)
        })
    }
}
