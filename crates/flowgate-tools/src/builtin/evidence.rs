use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;

use flowgate_core::error::Result;
use flowgate_core::traits::Tool;
use flowgate_core::types::{Evidence, EvidenceKind, ToolContext, ToolResult};
use flowgate_workflow::EvidenceLedger;

use super::parse_input;

/// Records a lint or test verdict so a blocked node can complete.
pub struct RecordEvidenceTool {
    ledger: Arc<EvidenceLedger>,
}

impl RecordEvidenceTool {
    pub fn new(ledger: Arc<EvidenceLedger>) -> Self {
        Self { ledger }
    }
}

#[derive(Deserialize)]
struct RecordInput {
    kind: EvidenceKind,
    passed: bool,
    #[serde(default)]
    scope: Vec<String>,
    #[serde(default)]
    summary: Option<String>,
}

impl Tool for RecordEvidenceTool {
    fn name(&self) -> &str {
        "record_evidence"
    }

    fn description(&self) -> &str {
        "Record the verdict of a lint (guard) or test run. Scope lists the files or \
         directories it covers; empty means the whole workspace."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "kind": { "type": "string", "enum": ["guard", "test"] },
                "passed": { "type": "boolean" },
                "scope": { "type": "array", "items": { "type": "string" } },
                "summary": { "type": "string", "description": "Short description of the findings" }
            },
            "required": ["kind", "passed"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: RecordInput = parse_input(input)?;
            let mut evidence = Evidence::new(params.kind, params.passed).with_scope(params.scope);
            if let Some(summary) = params.summary {
                evidence = evidence.with_summary(summary);
            }
            let timestamp = evidence.timestamp;
            self.ledger.record(evidence).await;
            Ok(ToolResult::success(json!({
                "recorded": true,
                "kind": params.kind,
                "passed": params.passed,
                "timestamp": timestamp.to_rfc3339(),
            })))
        })
    }
}
