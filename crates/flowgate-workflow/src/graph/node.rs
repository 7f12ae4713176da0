use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowgate_core::types::{NodeKind, OnError, Phase};

use crate::gate::GateResult;

/// Life-cycle status of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Ready,
    Running,
    /// Completion attempted but the gate is unmet.
    Blocked,
    Done,
    /// Permanently failed (retries exhausted).
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evidence a gated node must present before it may complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatePolicy {
    #[serde(default)]
    pub require_guard: bool,
    #[serde(default)]
    pub require_test: bool,
    /// Evidence older than this is treated as missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<u64>,
}

impl GatePolicy {
    pub fn guard() -> Self {
        Self {
            require_guard: true,
            ..Default::default()
        }
    }

    pub fn test() -> Self {
        Self {
            require_test: true,
            ..Default::default()
        }
    }

    pub fn guard_and_test() -> Self {
        Self {
            require_guard: true,
            require_test: true,
            max_age_ms: None,
        }
    }

    pub fn with_max_age(mut self, max_age_ms: u64) -> Self {
        self.max_age_ms = Some(max_age_ms);
        self
    }
}

/// A node in the workflow graph.
///
/// The first block of fields is the definition supplied by the caller;
/// the second block is runtime state owned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    pub id: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Opaque to the engine; handed to the worker as-is.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Advisory tool scope.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Advisory file scope; also scopes gate evidence.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub estimated_tokens: u64,
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
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Target of the taken branch, for decision nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_branch: Option<String>,
    /// Latest gate evaluation, kept for reporting only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_gate: Option<GateResult>,
    #[serde(default)]
    pub tokens_used: u64,
    /// Tokens reported by the latest completion attempt, applied once the
    /// node is done. A blocked attempt's figure is replaced by the next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowNode {
    /// Create a task node with minimal configuration.
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Task,
            label: label.into(),
            phase: None,
            payload: serde_json::Value::Null,
            tools: vec![],
            files: vec![],
            priority: 0,
            estimated_tokens: 0,
            gate_required: None,
            gate_policy: None,
            timeout_ms: None,
            max_retries: None,
            on_error: None,
            depends_on: vec![],
            status: NodeStatus::Pending,
            retry_count: 0,
            attempts: 0,
            result: None,
            error: None,
            selected_branch: None,
            last_gate: None,
            tokens_used: 0,
            pending_tokens: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn decision(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(id, label).with_kind(NodeKind::Decision)
    }

    pub fn join(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(id, label).with_kind(NodeKind::Join)
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tokens(mut self, estimated_tokens: u64) -> Self {
        self.estimated_tokens = estimated_tokens;
        self
    }

    pub fn with_gate(mut self, required: bool) -> Self {
        self.gate_required = Some(required);
        self
    }

    pub fn with_gate_policy(mut self, policy: GatePolicy) -> Self {
        self.gate_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = Some(on_error);
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Reset runtime state to a fresh definition.
    pub(crate) fn reset_runtime(&mut self) {
        self.status = NodeStatus::Pending;
        self.retry_count = 0;
        self.attempts = 0;
        self.result = None;
        self.error = None;
        self.selected_branch = None;
        self.last_gate = None;
        self.tokens_used = 0;
        self.pending_tokens = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// Caller-facing snapshot of a node with its effective policies resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub status: NodeStatus,
    pub payload: serde_json::Value,
    pub tools: Vec<String>,
    pub files: Vec<String>,
    pub priority: i32,
    pub estimated_tokens: u64,
    pub gate_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub max_retries: u32,
    pub retry_count: u32,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
