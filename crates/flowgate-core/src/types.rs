use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Generate a fresh graph identifier.
pub fn new_graph_id() -> String {
    format!("wf-{}", Uuid::new_v4())
}

/// Kind of a workflow node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Task,
    Decision,
    Join,
}

/// Development phase a node belongs to. Drives the default gate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Analysis,
    Plan,
    Impl,
    Test,
    Review,
}

impl Phase {
    /// Phases where correctness matters and completion needs evidence.
    pub fn is_gated(&self) -> bool {
        matches!(self, Self::Impl | Self::Test | Self::Review)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Plan => "plan",
            Self::Impl => "impl",
            Self::Test => "test",
            Self::Review => "review",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when a node has exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Fail the whole graph.
    #[default]
    Fail,
    /// Skip the node and its exclusive descendants.
    Skip,
    /// Record the failure and let dependents proceed.
    Continue,
}

/// Kind of externally produced evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceKind {
    /// Static-analysis / validation verdict.
    Guard,
    /// Test-run verdict.
    Test,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guard => "guard",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timestamped, scoped verdict produced outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: EvidenceKind,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
    /// Files or directories the verdict covers. Empty means workspace-wide.
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Evidence {
    pub fn new(kind: EvidenceKind, passed: bool) -> Self {
        Self {
            kind,
            passed,
            timestamp: Utc::now(),
            scope: vec![],
            summary: None,
        }
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this verdict speaks for every file in `files`.
    pub fn covers(&self, files: &[String]) -> bool {
        if self.scope.is_empty() {
            return true;
        }
        files.iter().all(|file| {
            self.scope.iter().any(|entry| {
                let entry = entry.trim_end_matches('/');
                file == entry || file.starts_with(&format!("{}/", entry))
            })
        })
    }
}

/// A unit of work handed to a `NodeWorker` in engine-driven mode.
#[derive(Debug, Clone)]
pub struct NodeTask {
    pub graph_id: String,
    pub node_id: String,
    pub label: String,
    pub kind: NodeKind,
    pub phase: Option<Phase>,
    pub payload: serde_json::Value,
    pub tools: Vec<String>,
    pub files: Vec<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Point after which the engine stops waiting.
    pub deadline: Option<Instant>,
    /// Cancelled when the deadline passes; workers should stop promptly.
    pub cancel: CancellationToken,
}

/// Output of a successful unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub tokens_used: u64,
}

impl NodeOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            tokens_used: 0,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// Result of a tool execution. Content is structured JSON for the caller.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: serde_json::Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: serde_json::Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(content: serde_json::Value) -> Self {
        Self {
            content,
            is_error: true,
        }
    }
}

/// Tool definition advertised to the calling agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Who is invoking the tool; recorded on gate bypass audits.
    pub actor: String,
    pub working_dir: PathBuf,
}

impl ToolContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// Workflow lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    GraphCreated { graph_id: String, name: String, node_count: usize },
    GraphCompleted { graph_id: String, actual_tokens: u64 },
    GraphFailed { graph_id: String, node_id: String, error: String },
    GraphDeleted { graph_id: String },
    GraphEvicted { graph_id: String },
    NodeStarted { graph_id: String, node_id: String, attempt: u32 },
    NodeCompleted { graph_id: String, node_id: String, branch: Option<String> },
    NodeBlocked {
        graph_id: String,
        node_id: String,
        missing: Vec<EvidenceKind>,
        failing: Vec<EvidenceKind>,
    },
    NodeRetrying { graph_id: String, node_id: String, attempt: u32, error: String },
    NodeFailed { graph_id: String, node_id: String, error: String },
    NodeSkipped { graph_id: String, node_id: String },
    GateBypassed { graph_id: String, node_id: String, actor: String, reason: String },
}

impl WorkflowEvent {
    pub fn graph_id(&self) -> &str {
        match self {
            Self::GraphCreated { graph_id, .. }
            | Self::GraphCompleted { graph_id, .. }
            | Self::GraphFailed { graph_id, .. }
            | Self::GraphDeleted { graph_id }
            | Self::GraphEvicted { graph_id }
            | Self::NodeStarted { graph_id, .. }
            | Self::NodeCompleted { graph_id, .. }
            | Self::NodeBlocked { graph_id, .. }
            | Self::NodeRetrying { graph_id, .. }
            | Self::NodeFailed { graph_id, .. }
            | Self::NodeSkipped { graph_id, .. }
            | Self::GateBypassed { graph_id, .. } => graph_id,
        }
    }

    /// Whether the graph reached a state after which no more events follow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::GraphCompleted { .. }
                | Self::GraphFailed { .. }
                | Self::GraphDeleted { .. }
                | Self::GraphEvicted { .. }
        )
    }
}
