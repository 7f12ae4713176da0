use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;

use flowgate_core::error::Result;
use flowgate_core::traits::Tool;
use flowgate_core::types::{ToolContext, ToolResult};
use flowgate_workflow::{DiagramOptions, Direction, GraphDefinition, WorkflowEngine};

use super::{parse_input, success};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRef {
    graph_id: String,
}

fn graph_id_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "graphId": { "type": "string" }
        },
        "required": ["graphId"]
    })
}

// ── CreateGraphTool ─────────────────────────────────────────────

pub struct CreateGraphTool {
    engine: Arc<WorkflowEngine>,
}

impl CreateGraphTool {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Deserialize)]
struct CreateInput {
    definition: GraphDefinition,
    #[serde(default)]
    context: serde_json::Value,
}

impl Tool for CreateGraphTool {
    fn name(&self) -> &str {
        "create_graph"
    }

    fn description(&self) -> &str {
        "Validate and register an ad-hoc workflow graph. Rejects cycles, dangling \
         edges and unknown entry nodes."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "definition": {
                    "type": "object",
                    "description": "{ name, entry, nodes: [...], edges: [...], defaults? }"
                },
                "context": { "type": "object", "description": "Initial condition context" }
            },
            "required": ["definition"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: CreateInput = parse_input(input)?;
            let created = self
                .engine
                .create_graph(params.definition, params.context)
                .await?;
            Ok(ToolResult::success(json!({
                "graphId": created.graph_id,
                "name": created.name,
                "nodeCount": created.summary.total_nodes,
                "estimatedTokens": created.summary.total_estimated_tokens,
                "readyNodes": created.ready,
            })))
        })
    }
}

// ── AnalyzeGraphTool ────────────────────────────────────────────

pub struct AnalyzeGraphTool {
    engine: Arc<WorkflowEngine>,
}

impl AnalyzeGraphTool {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for AnalyzeGraphTool {
    fn name(&self) -> &str {
        "analyze_graph"
    }

    fn description(&self) -> &str {
        "Progress, critical path, parallel groups and token usage for a graph."
    }

    fn input_schema(&self) -> serde_json::Value {
        graph_id_schema()
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: GraphRef = parse_input(input)?;
            success(&self.engine.analyze(&params.graph_id).await?)
        })
    }
}

// ── ExportDiagramTool ───────────────────────────────────────────

pub struct ExportDiagramTool {
    engine: Arc<WorkflowEngine>,
}

impl ExportDiagramTool {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiagramInput {
    graph_id: String,
    #[serde(default)]
    node_states: bool,
    #[serde(default)]
    direction: Option<String>,
}

impl Tool for ExportDiagramTool {
    fn name(&self) -> &str {
        "export_diagram"
    }

    fn description(&self) -> &str {
        "Render the graph as a Mermaid flowchart, optionally coloured by node state."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "graphId": { "type": "string" },
                "nodeStates": { "type": "boolean", "description": "Colour nodes by status" },
                "direction": { "type": "string", "enum": ["TD", "LR", "BT", "RL"] }
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
            let params: DiagramInput = parse_input(input)?;
            let direction = match params.direction {
                Some(ref d) => d.parse::<Direction>()?,
                None => Direction::default(),
            };
            let options = DiagramOptions {
                direction,
                node_states: params.node_states,
            };
            let diagram = self
                .engine
                .export_diagram(&params.graph_id, &options)
                .await?;
            Ok(ToolResult::success(json!({
                "graphId": params.graph_id,
                "format": "mermaid",
                "diagram": diagram,
            })))
        })
    }
}

// ── ListGraphsTool ──────────────────────────────────────────────

pub struct ListGraphsTool {
    engine: Arc<WorkflowEngine>,
}

impl ListGraphsTool {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for ListGraphsTool {
    fn name(&self) -> &str {
        "list_graphs"
    }

    fn description(&self) -> &str {
        "List live graphs with their status and progress."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {} })
    }

    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let graphs = self.engine.list_graphs().await;
            Ok(ToolResult::success(json!({ "graphs": graphs })))
        })
    }
}

// ── DeleteGraphTool ─────────────────────────────────────────────

pub struct DeleteGraphTool {
    engine: Arc<WorkflowEngine>,
}

impl DeleteGraphTool {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for DeleteGraphTool {
    fn name(&self) -> &str {
        "delete_graph"
    }

    fn description(&self) -> &str {
        "Remove a graph. Work already in flight is not interrupted."
    }

    fn input_schema(&self) -> serde_json::Value {
        graph_id_schema()
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: GraphRef = parse_input(input)?;
            self.engine.delete_graph(&params.graph_id).await?;
            Ok(ToolResult::success(json!({
                "graphId": params.graph_id,
                "deleted": true,
            })))
        })
    }
}
