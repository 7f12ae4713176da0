use futures::future::BoxFuture;
use tokio::sync::RwLock;

use flowgate_core::error::Result;
use flowgate_core::traits::EvidenceProvider;
use flowgate_core::types::{Evidence, EvidenceKind};

/// In-memory evidence store fed by the `record_evidence` tool (or any
/// integration that observes lint and test runs).
#[derive(Default)]
pub struct EvidenceLedger {
    entries: RwLock<Vec<Evidence>>,
}

impl EvidenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps one verdict per (kind, scope): the newest. A verdict older than
    /// the one already held for its slot is dropped.
    pub async fn record(&self, evidence: Evidence) {
        let mut entries = self.entries.write().await;
        let same_slot = |e: &Evidence| e.kind == evidence.kind && e.scope == evidence.scope;
        if entries
            .iter()
            .any(|e| same_slot(e) && e.timestamp > evidence.timestamp)
        {
            tracing::debug!(kind = %evidence.kind, scope = ?evidence.scope, "Older evidence ignored");
            return;
        }
        entries.retain(|e| !same_slot(e));
        tracing::debug!(
            kind = %evidence.kind,
            passed = evidence.passed,
            scope = ?evidence.scope,
            "Evidence recorded"
        );
        entries.push(evidence);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Newest verdict of `kind` covering all of `files`. When timestamps
    /// tie, the later recording wins (`max_by_key` keeps the last maximum).
    pub async fn find_latest(&self, kind: EvidenceKind, files: &[String]) -> Option<Evidence> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.kind == kind && e.covers(files))
            .max_by_key(|e| e.timestamp)
            .cloned()
    }
}

impl EvidenceProvider for EvidenceLedger {
    fn latest(
        &self,
        kind: EvidenceKind,
        files: &[String],
    ) -> BoxFuture<'_, Result<Option<Evidence>>> {
        let files = files.to_vec();
        Box::pin(async move { Ok(self.find_latest(kind, &files).await) })
    }
}
