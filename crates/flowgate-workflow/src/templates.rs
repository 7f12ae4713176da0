use serde::Serialize;
use serde_json::json;

use flowgate_core::types::Phase;

use crate::graph::{EdgeCondition, GraphDefinition, WorkflowEdge, WorkflowNode};

/// Short description of an available template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    pub name: String,
    pub description: String,
    pub node_count: usize,
}

/// Source of named graph definitions for `start_workflow`.
pub trait TemplateProvider: Send + Sync {
    fn list(&self) -> Vec<TemplateInfo>;

    /// A fresh definition for `name`, or `None` if unknown.
    fn get(&self, name: &str) -> Option<GraphDefinition>;
}

/// The stock development workflows.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTemplates;

const BUILTIN: &[(&str, &str)] = &[
    ("feature", "Analyze, plan, implement, test and review a new feature"),
    ("bugfix", "Reproduce a bug, then hotfix (severity=critical) or fix normally, and verify"),
    ("refactor", "Plan a refactor, change code and tests in parallel, verify and review"),
    ("review", "Gather changes, run lint and test review in parallel, summarize"),
];

impl TemplateProvider for BuiltinTemplates {
    fn list(&self) -> Vec<TemplateInfo> {
        BUILTIN
            .iter()
            .filter_map(|(name, description)| {
                self.get(name).map(|def| TemplateInfo {
                    name: name.to_string(),
                    description: description.to_string(),
                    node_count: def.nodes.len(),
                })
            })
            .collect()
    }

    fn get(&self, name: &str) -> Option<GraphDefinition> {
        match name {
            "feature" => Some(feature()),
            "bugfix" => Some(bugfix()),
            "refactor" => Some(refactor()),
            "review" => Some(review()),
            _ => None,
        }
    }
}

fn step(id: &str, label: &str, phase: Phase, tokens: u64) -> WorkflowNode {
    WorkflowNode::new(id, label)
        .with_phase(phase)
        .with_tokens(tokens)
}

fn feature() -> GraphDefinition {
    GraphDefinition::new("feature", "analyze")
        .with_node(step("analyze", "Analyze requirements", Phase::Analysis, 2_000))
        .with_node(step("plan", "Plan implementation", Phase::Plan, 3_000))
        .with_node(
            step("implement", "Implement feature", Phase::Impl, 12_000)
                .with_tools(vec!["edit".into(), "code_lint".into()])
                .with_retries(2),
        )
        .with_node(
            step("test", "Write and run tests", Phase::Test, 6_000)
                .with_tools(vec!["test_run".into()])
                .with_retries(2),
        )
        .with_node(step("review", "Review changes", Phase::Review, 3_000))
        .with_edge(WorkflowEdge::new("analyze", "plan"))
        .with_edge(WorkflowEdge::new("plan", "implement"))
        .with_edge(WorkflowEdge::new("implement", "test"))
        .with_edge(WorkflowEdge::new("test", "review"))
}

fn bugfix() -> GraphDefinition {
    GraphDefinition::new("bugfix", "reproduce")
        .with_node(step("reproduce", "Reproduce the bug", Phase::Analysis, 2_500))
        .with_node(WorkflowNode::decision("triage", "Triage severity").with_tokens(500))
        .with_node(
            step("hotfix", "Minimal hotfix", Phase::Impl, 4_000)
                .with_priority(10)
                .with_retries(1),
        )
        .with_node(step("fix", "Root-cause fix", Phase::Impl, 8_000).with_retries(2))
        .with_node(step("verify", "Verify the fix", Phase::Test, 4_000).with_retries(1))
        .with_edge(WorkflowEdge::new("reproduce", "triage"))
        .with_edge(WorkflowEdge::when(
            "triage",
            "hotfix",
            EdgeCondition::equals("severity", json!("critical")),
        ))
        .with_edge(WorkflowEdge::new("triage", "fix"))
        .with_edge(WorkflowEdge::new("hotfix", "verify"))
        .with_edge(WorkflowEdge::new("fix", "verify"))
}

fn refactor() -> GraphDefinition {
    GraphDefinition::new("refactor", "analyze")
        .with_node(step("analyze", "Map affected code", Phase::Analysis, 3_000))
        .with_node(step("plan", "Plan the refactor", Phase::Plan, 2_000))
        .with_node(step("refactor_code", "Restructure code", Phase::Impl, 10_000).with_retries(2))
        .with_node(step("update_tests", "Update tests", Phase::Impl, 5_000).with_retries(2))
        .with_node(WorkflowNode::join("merge", "Merge work"))
        .with_node(step("verify", "Run full test suite", Phase::Test, 3_000).with_retries(1))
        .with_node(step("review", "Review the refactor", Phase::Review, 2_500))
        .with_edge(WorkflowEdge::new("analyze", "plan"))
        .with_edge(WorkflowEdge::new("plan", "refactor_code"))
        .with_edge(WorkflowEdge::new("plan", "update_tests"))
        .with_edge(WorkflowEdge::new("refactor_code", "merge"))
        .with_edge(WorkflowEdge::new("update_tests", "merge"))
        .with_edge(WorkflowEdge::new("merge", "verify"))
        .with_edge(WorkflowEdge::new("verify", "review"))
}

fn review() -> GraphDefinition {
    GraphDefinition::new("review", "gather")
        .with_node(step("gather", "Collect the change set", Phase::Analysis, 1_500))
        .with_node(
            WorkflowNode::new("lint_review", "Static analysis review")
                .with_phase(Phase::Review)
                .with_gate_policy(crate::graph::GatePolicy::guard())
                .with_tokens(2_000),
        )
        .with_node(
            WorkflowNode::new("test_review", "Test coverage review")
                .with_phase(Phase::Review)
                .with_gate_policy(crate::graph::GatePolicy::test())
                .with_tokens(2_000),
        )
        .with_node(WorkflowNode::join("collect", "Collect findings"))
        .with_node(WorkflowNode::new("summarize", "Summarize review").with_tokens(1_000))
        .with_edge(WorkflowEdge::new("gather", "lint_review"))
        .with_edge(WorkflowEdge::new("gather", "test_review"))
        .with_edge(WorkflowEdge::new("lint_review", "collect"))
        .with_edge(WorkflowEdge::new("test_review", "collect"))
        .with_edge(WorkflowEdge::new("collect", "summarize"))
}
