//! Workflow graph model.
//!
//! A workflow is a DAG of `WorkflowNode`s. Control flows along `WorkflowEdge`s
//! and `dependsOn` links; decision nodes pick one outgoing edge by evaluating
//! conditions against the graph context, and join nodes wait for every
//! predecessor. Each graph owns its node state and is mutated only through
//! the transitions in `lifecycle`.

pub mod analyzer;
pub mod diagram;
pub mod edge;
pub mod lifecycle;
pub mod model;
pub mod node;
mod readiness;

pub use analyzer::{CriticalPath, GraphAnalysis, StatusCounts};
pub use diagram::{render_mermaid, DiagramOptions, Direction};
pub use edge::{is_truthy, lookup_path, select_branch, EdgeCondition, WorkflowEdge};
pub use lifecycle::{
    CompleteOutcome, FailOutcome, FailureReport, GateDecision, NodeCompletion, NotReady,
    Progress, StartOutcome,
};
pub use model::{GraphDefaults, GraphDefinition, GraphStatus, WorkflowGraph};
pub use node::{GatePolicy, NodeStatus, NodeView, WorkflowNode};
