use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::{NodeWorker, Tool};
use flowgate_core::types::{ToolContext, ToolDefinition, ToolResult};
use flowgate_workflow::{EvidenceLedger, WorkflowEngine};

use crate::builtin::{evidence, graph, lifecycle};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Tool definitions advertised to the calling agent, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| FlowgateError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());
        debug!(tool = %name, actor = %ctx.actor, "Executing tool");

        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tool = %name, timeout_secs = tool.timeout_secs(), "Tool timed out");
                Err(FlowgateError::ToolTimeout {
                    tool: name.to_string(),
                    timeout_secs: tool.timeout_secs(),
                })
            }
        }
    }

    /// Create a registry with the full workflow surface registered.
    pub fn with_workflow_tools(
        engine: Arc<WorkflowEngine>,
        ledger: Arc<EvidenceLedger>,
        worker: Arc<dyn NodeWorker>,
    ) -> Self {
        let mut registry = Self::new();

        // ── Graph lifecycle (6) ─────────────────────────────────
        registry.register(lifecycle::StartWorkflowTool::new(engine.clone()));
        registry.register(lifecycle::GetNextNodesTool::new(engine.clone()));
        registry.register(lifecycle::StartNodeTool::new(engine.clone()));
        registry.register(lifecycle::CompleteNodeTool::new(engine.clone()));
        registry.register(lifecycle::FailNodeTool::new(engine.clone()));
        registry.register(lifecycle::ExecuteGraphTool::new(engine.clone(), worker));

        // ── Graph management (5) ────────────────────────────────
        registry.register(graph::CreateGraphTool::new(engine.clone()));
        registry.register(graph::AnalyzeGraphTool::new(engine.clone()));
        registry.register(graph::ExportDiagramTool::new(engine.clone()));
        registry.register(graph::ListGraphsTool::new(engine.clone()));
        registry.register(graph::DeleteGraphTool::new(engine));

        // ── Evidence (1) ────────────────────────────────────────
        registry.register(evidence::RecordEvidenceTool::new(ledger));

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
