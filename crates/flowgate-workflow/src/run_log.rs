use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowgate_core::event::EventBus;
use flowgate_core::types::WorkflowEvent;

/// JSONL workflow logger.
///
/// Subscribes to the EventBus and appends one JSON object per line.
/// Every line is flushed as written, so a crash loses nothing already logged.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    graph_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = graph events and bypass audits,
    /// 2 = node transitions, 3 = gate detail.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run until cancelled. With `graph_id` set, only that graph is logged
    /// and the logger stops after its terminal event.
    pub async fn run(
        self,
        event_bus: Arc<EventBus>,
        graph_id: Option<String>,
        cancel: CancellationToken,
    ) {
        // Subscribe before any await so events published meanwhile are kept.
        let mut rx = event_bus.subscribe();

        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let file_name = match graph_id {
            Some(ref id) => format!("{}_{}.jsonl", id, timestamp),
            None => format!("flowgate_{}.jsonl", timestamp),
        };
        let log_path = self.log_dir.join(file_name);

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if graph_id.as_deref().is_some_and(|id| id != event.graph_id()) {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if graph_id.is_some() && event.is_terminal() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry, or `None` if filtered by level.
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let entry = |event_type: &'static str,
                     node_id: Option<&String>,
                     detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            graph_id: event.graph_id().to_string(),
            event_type,
            node_id: node_id.cloned(),
            detail,
        };

        match event {
            // L1
            WorkflowEvent::GraphCreated { name, node_count, .. } => Some(entry(
                "graph_created",
                None,
                Some(serde_json::json!({ "name": name, "node_count": node_count })),
            )),
            WorkflowEvent::GraphCompleted { actual_tokens, .. } => Some(entry(
                "graph_completed",
                None,
                Some(serde_json::json!({ "actual_tokens": actual_tokens })),
            )),
            WorkflowEvent::GraphFailed { node_id, error, .. } => Some(entry(
                "graph_failed",
                Some(node_id),
                Some(serde_json::json!({ "error": error })),
            )),
            WorkflowEvent::GraphDeleted { .. } => Some(entry("graph_deleted", None, None)),
            WorkflowEvent::GraphEvicted { .. } => Some(entry("graph_evicted", None, None)),
            WorkflowEvent::GateBypassed {
                node_id,
                actor,
                reason,
                ..
            } => Some(entry(
                "gate_bypassed",
                Some(node_id),
                Some(serde_json::json!({ "actor": actor, "reason": reason })),
            )),

            // L2
            WorkflowEvent::NodeStarted { node_id, attempt, .. } if self.level >= 2 => Some(entry(
                "node_started",
                Some(node_id),
                Some(serde_json::json!({ "attempt": attempt })),
            )),
            WorkflowEvent::NodeCompleted { node_id, branch, .. } if self.level >= 2 => Some(entry(
                "node_completed",
                Some(node_id),
                branch
                    .as_ref()
                    .map(|b| serde_json::json!({ "branch": b })),
            )),
            WorkflowEvent::NodeRetrying {
                node_id,
                attempt,
                error,
                ..
            } if self.level >= 2 => Some(entry(
                "node_retrying",
                Some(node_id),
                Some(serde_json::json!({ "next_attempt": attempt, "error": error })),
            )),
            WorkflowEvent::NodeFailed { node_id, error, .. } if self.level >= 2 => Some(entry(
                "node_failed",
                Some(node_id),
                Some(serde_json::json!({ "error": error })),
            )),
            WorkflowEvent::NodeSkipped { node_id, .. } if self.level >= 2 => {
                Some(entry("node_skipped", Some(node_id), None))
            }

            // L3 adds the evidence breakdown
            WorkflowEvent::NodeBlocked {
                node_id,
                missing,
                failing,
                ..
            } if self.level >= 2 => {
                let detail = (self.level >= 3)
                    .then(|| serde_json::json!({ "missing": missing, "failing": failing }));
                Some(entry("node_blocked", Some(node_id), detail))
            }

            _ => None,
        }
    }
}
