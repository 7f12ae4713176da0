pub mod engine;
pub mod evidence;
pub mod gate;
pub mod graph;
pub mod registry;
pub mod run_log;
pub mod snapshot;
pub mod templates;
pub mod worker;

pub use engine::{
    ExecuteOptions, ExecutionOutcome, ExecutionSummary, GraphCreated, NodeReport, WorkflowEngine,
};
pub use evidence::EvidenceLedger;
pub use gate::{
    evaluate_gate, Bypass, BypassRecord, FailingEvidence, GateEvaluator, GateResult, GateStatus,
    GateSubject, SuggestedToolCall,
};
pub use graph::{
    CompleteOutcome, DiagramOptions, Direction, EdgeCondition, FailOutcome, GateDecision, GatePolicy,
    GraphAnalysis, GraphDefaults, GraphDefinition, GraphStatus, NodeCompletion, NodeStatus,
    NodeView, NotReady, StartOutcome, WorkflowEdge, WorkflowGraph, WorkflowNode,
};
pub use registry::{GraphListing, GraphStore};
pub use run_log::RunLogger;
pub use snapshot::SnapshotStore;
pub use templates::{BuiltinTemplates, TemplateInfo, TemplateProvider};
pub use worker::CommandWorker;
