use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use flowgate_core::config::GateConfig;
use flowgate_core::traits::EvidenceProvider;
use flowgate_core::types::{Evidence, EvidenceKind, NodeKind, Phase};

use crate::graph::model::GraphDefaults;
use crate::graph::node::{GatePolicy, WorkflowNode};

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Passed,
    /// Gated node that has not been evaluated yet.
    Pending,
    Blocked,
}

/// Evidence present and fresh, but with a negative verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingEvidence {
    pub kind: EvidenceKind,
    pub reason: String,
}

/// A concrete next step for the caller to unblock a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedToolCall {
    pub tool: String,
    pub arguments: serde_json::Value,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub status: GateStatus,
    pub missing_evidence: Vec<EvidenceKind>,
    pub failing_evidence: Vec<FailingEvidence>,
    pub next_tool_calls: Vec<SuggestedToolCall>,
}

impl GateResult {
    pub fn passed() -> Self {
        Self {
            status: GateStatus::Passed,
            missing_evidence: vec![],
            failing_evidence: vec![],
            next_tool_calls: vec![],
        }
    }

    pub fn pending() -> Self {
        Self {
            status: GateStatus::Pending,
            ..Self::passed()
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == GateStatus::Passed
    }

    pub fn failing_kinds(&self) -> Vec<EvidenceKind> {
        self.failing_evidence.iter().map(|f| f.kind).collect()
    }
}

/// Immutable audit entry written whenever a gate is bypassed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassRecord {
    id: String,
    graph_id: String,
    node_id: String,
    actor: String,
    reason: String,
    timestamp: DateTime<Utc>,
}

impl BypassRecord {
    pub(crate) fn new(graph_id: &str, node_id: &str, bypass: &Bypass) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            graph_id: graph_id.to_string(),
            node_id: node_id.to_string(),
            actor: bypass.actor.clone(),
            reason: bypass.reason.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A request to complete a node without satisfying its gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bypass {
    pub actor: String,
    pub reason: String,
}

impl Bypass {
    pub fn new(actor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            reason: reason.into(),
        }
    }
}

/// Whether completing `node` needs evidence, resolved node first, then
/// graph defaults, then phase. At each level an explicit `gateRequired`
/// wins and a `gatePolicy` on its own implies the gate. Joins never are.
pub fn gate_required(node: &WorkflowNode, defaults: &GraphDefaults) -> bool {
    if node.kind == NodeKind::Join {
        return false;
    }
    node.gate_required
        .or_else(|| node.gate_policy.as_ref().map(|_| true))
        .or(defaults.gate_required)
        .or_else(|| defaults.gate_policy.as_ref().map(|_| true))
        .unwrap_or_else(|| node.phase.is_some_and(|p| p.is_gated()))
}

/// Default evidence requirements for a phase.
pub fn phase_policy(phase: Option<Phase>) -> GatePolicy {
    match phase {
        Some(Phase::Test) => GatePolicy::test(),
        Some(Phase::Review) => GatePolicy::guard_and_test(),
        // impl, and explicitly gated nodes outside the gated phases
        _ => GatePolicy::guard(),
    }
}

/// Effective gate for `node`, or `None` when it is not gated.
///
/// Requirement and policy share one precedence: node, then graph defaults,
/// then phase default. `maxAgeMs` falls back separately to the graph
/// defaults and then to `fallback_max_age_ms`.
pub fn effective_gate(
    node: &WorkflowNode,
    defaults: &GraphDefaults,
    fallback_max_age_ms: u64,
) -> Option<GatePolicy> {
    if !gate_required(node, defaults) {
        return None;
    }
    let mut policy = node
        .gate_policy
        .clone()
        .or_else(|| defaults.gate_policy.clone())
        .unwrap_or_else(|| phase_policy(node.phase));
    if policy.max_age_ms.is_none() {
        policy.max_age_ms = Some(
            defaults
                .gate_policy
                .as_ref()
                .and_then(|p| p.max_age_ms)
                .unwrap_or(fallback_max_age_ms),
        );
    }
    Some(policy)
}

/// What the gate is being evaluated for.
#[derive(Debug, Clone)]
pub struct GateSubject {
    pub graph_id: String,
    pub node_id: String,
    pub files: Vec<String>,
}

/// Pure gate evaluation. Same inputs, same result.
///
/// Stale or out-of-scope evidence counts as missing.
pub fn evaluate_gate(
    subject: &GateSubject,
    policy: &GatePolicy,
    guard: Option<&Evidence>,
    test: Option<&Evidence>,
    now: DateTime<Utc>,
    config: &GateConfig,
) -> GateResult {
    let max_age_ms = policy.max_age_ms.unwrap_or(config.max_age_ms);
    let mut result = GateResult::passed();

    let checks = [
        (EvidenceKind::Guard, policy.require_guard, guard, &config.guard_tool),
        (EvidenceKind::Test, policy.require_test, test, &config.test_tool),
    ];
    for (kind, required, evidence, tool) in checks {
        if !required {
            continue;
        }
        let files = serde_json::json!({ "files": subject.files });
        match evidence {
            None => {
                result.missing_evidence.push(kind);
                result.next_tool_calls.push(SuggestedToolCall {
                    tool: tool.clone(),
                    arguments: files,
                    reason: format!("no {} evidence covers this node", kind),
                });
            }
            Some(ev) if !ev.covers(&subject.files) => {
                result.missing_evidence.push(kind);
                result.next_tool_calls.push(SuggestedToolCall {
                    tool: tool.clone(),
                    arguments: files,
                    reason: format!("latest {} evidence does not cover the node's files", kind),
                });
            }
            Some(ev) if age_ms(ev, now) > max_age_ms as i64 => {
                result.missing_evidence.push(kind);
                result.next_tool_calls.push(SuggestedToolCall {
                    tool: tool.clone(),
                    arguments: files,
                    reason: format!(
                        "{} evidence is stale ({}ms old, limit {}ms)",
                        kind,
                        age_ms(ev, now),
                        max_age_ms
                    ),
                });
            }
            Some(ev) if !ev.passed => {
                let reason = ev
                    .summary
                    .clone()
                    .unwrap_or_else(|| format!("{} verdict failed", kind));
                result.failing_evidence.push(FailingEvidence {
                    kind,
                    reason: reason.clone(),
                });
                result.next_tool_calls.push(SuggestedToolCall {
                    tool: tool.clone(),
                    arguments: files,
                    reason: format!("fix the reported problems and re-run: {}", reason),
                });
            }
            Some(_) => {}
        }
    }

    if !result.missing_evidence.is_empty() || !result.failing_evidence.is_empty() {
        result.status = GateStatus::Blocked;
        result.next_tool_calls.push(SuggestedToolCall {
            tool: "complete_node".to_string(),
            arguments: serde_json::json!({
                "graphId": subject.graph_id,
                "nodeId": subject.node_id,
            }),
            reason: "retry completion once fresh passing evidence is recorded".to_string(),
        });
    }
    result
}

fn age_ms(evidence: &Evidence, now: DateTime<Utc>) -> i64 {
    (now - evidence.timestamp).num_milliseconds()
}

/// Fetches evidence and applies `evaluate_gate`.
pub struct GateEvaluator {
    provider: Arc<dyn EvidenceProvider>,
    config: GateConfig,
}

impl GateEvaluator {
    pub fn new(provider: Arc<dyn EvidenceProvider>, config: GateConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Never fails: a kind whose lookup errors is reported as missing, with
    /// the provider error as the reason, so the node blocks instead of
    /// being left running.
    pub async fn evaluate(&self, subject: &GateSubject, policy: &GatePolicy) -> GateResult {
        let mut unavailable = Vec::new();
        let guard = self
            .lookup(EvidenceKind::Guard, policy.require_guard, subject, &mut unavailable)
            .await;
        let test = self
            .lookup(EvidenceKind::Test, policy.require_test, subject, &mut unavailable)
            .await;
        let mut result = evaluate_gate(
            subject,
            policy,
            guard.as_ref(),
            test.as_ref(),
            Utc::now(),
            &self.config,
        );
        for (kind, error) in unavailable {
            let tool = match kind {
                EvidenceKind::Guard => &self.config.guard_tool,
                EvidenceKind::Test => &self.config.test_tool,
            };
            if let Some(call) = result.next_tool_calls.iter_mut().find(|c| &c.tool == tool) {
                call.reason = format!("evidence provider unavailable: {}", error);
            }
        }
        result
    }

    async fn lookup(
        &self,
        kind: EvidenceKind,
        required: bool,
        subject: &GateSubject,
        unavailable: &mut Vec<(EvidenceKind, String)>,
    ) -> Option<Evidence> {
        if !required {
            return None;
        }
        match self.provider.latest(kind, &subject.files).await {
            Ok(evidence) => evidence,
            Err(e) => {
                warn!(
                    graph_id = %subject.graph_id,
                    node_id = %subject.node_id,
                    kind = %kind,
                    error = %e,
                    "Evidence lookup failed"
                );
                unavailable.push((kind, e.to_string()));
                None
            }
        }
    }
}
