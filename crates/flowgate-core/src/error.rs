use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowgateError {
    // Structural errors (rejected at graph construction)
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Entry node not found: {0}")]
    MissingEntry(String),

    #[error("Entry node '{0}' must not have predecessors")]
    EntryHasPredecessors(String),

    #[error("Edge references unknown node: {from} -> {to}")]
    DanglingEdge { from: String, to: String },

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    DanglingDependency { node: String, dependency: String },

    #[error("Cycle detected involving node: {0}")]
    CycleDetected(String),

    #[error("Conditional edge {from} -> {to} is declared after an unconditional sibling")]
    MisorderedDefaultEdge { from: String, to: String },

    // Lookup errors (programmer errors surfaced to callers)
    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Node not found: {graph_id}/{node_id}")]
    NodeNotFound { graph_id: String, node_id: String },

    #[error("Graph already exists: {0}")]
    GraphExists(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    // Evidence errors
    #[error("Evidence lookup failed: {0}")]
    Evidence(String),

    // Execution errors
    #[error("Node execution failed: {node}: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Node timed out after {timeout_ms}ms: {node}")]
    NodeTimeout { node: String, timeout_ms: u64 },

    #[error("Node cancelled: {0}")]
    Cancelled(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timed out after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Snapshot database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowgateError {
    /// Whether this error came from a malformed graph definition.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidGraph(_)
                | Self::DuplicateNode(_)
                | Self::MissingEntry(_)
                | Self::EntryHasPredecessors(_)
                | Self::DanglingEdge { .. }
                | Self::DanglingDependency { .. }
                | Self::CycleDetected(_)
                | Self::MisorderedDefaultEdge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowgateError>;
