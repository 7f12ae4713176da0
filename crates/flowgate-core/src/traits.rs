use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Tool: one operation of the surface exposed to the calling agent.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in agent tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Evidence provider: source of validation and test verdicts.
pub trait EvidenceProvider: Send + Sync + 'static {
    /// Latest verdict of `kind` whose scope covers `files`, if any.
    fn latest(
        &self,
        kind: EvidenceKind,
        files: &[String],
    ) -> BoxFuture<'_, Result<Option<Evidence>>>;
}

/// Node worker: performs the real work of a node in engine-driven mode.
///
/// Timeouts are cooperative: the engine cancels `task.cancel` and stops
/// waiting once the deadline passes, but never aborts the future itself.
pub trait NodeWorker: Send + Sync + 'static {
    fn run(&self, task: NodeTask) -> BoxFuture<'_, Result<NodeOutput>>;
}
