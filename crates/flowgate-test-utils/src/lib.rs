//! Shared test utilities for Flowgate crates.
//!
//! Graph fixtures are plain JSON so they exercise the same deserialization
//! path as tool input.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};

use flowgate_core::config::AppConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::NodeWorker;
use flowgate_core::types::{Evidence, EvidenceKind, NodeOutput, NodeTask};

// ── Scripted worker ─────────────────────────────────────────────

/// One scripted attempt outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed { result: Value, tokens: u64 },
    Fail(String),
    /// Sleep, then succeed with the default result.
    Sleep(Duration),
    /// Never finish on its own; returns once the task is cancelled.
    Hang,
}

impl Step {
    pub fn ok(result: Value) -> Self {
        Self::Succeed { result, tokens: 0 }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }
}

/// Worker whose behaviour is scripted per node. Unscripted attempts
/// succeed with `{"node": <id>}` after the optional base delay.
#[derive(Default)]
pub struct ScriptedWorker {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, u32)>>,
    delay: Option<Duration>,
    tokens: u64,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a base delay to every attempt, so concurrency is observable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Tokens reported by unscripted successful attempts.
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    /// Queue outcomes for successive attempts of `node_id`.
    pub fn script(self, node_id: &str, steps: Vec<Step>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(node_id.to_string()).or_default().extend(steps);
        }
        self
    }

    /// `(node_id, attempt)` for every attempt, in start order.
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn attempts_for(&self, node_id: &str) -> usize {
        self.calls().iter().filter(|(id, _)| id == node_id).count()
    }

    /// Node ids in the order their attempts started.
    pub fn started_order(&self) -> Vec<String> {
        self.calls().into_iter().map(|(id, _)| id).collect()
    }

    /// Highest number of attempts observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, node_id: &str) -> Option<Step> {
        self.scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(node_id).and_then(|q| q.pop_front()))
    }

    async fn perform(&self, task: &NodeTask) -> Result<NodeOutput> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let default = || NodeOutput::new(json!({ "node": task.node_id })).with_tokens(self.tokens);
        match self.next_step(&task.node_id) {
            None => Ok(default()),
            Some(Step::Succeed { result, tokens }) => Ok(NodeOutput::new(result).with_tokens(tokens)),
            Some(Step::Fail(message)) => Err(FlowgateError::NodeExecution {
                node: task.node_id.clone(),
                message,
            }),
            Some(Step::Sleep(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(default())
            }
            Some(Step::Hang) => {
                task.cancel.cancelled().await;
                Err(FlowgateError::Cancelled(task.node_id.clone()))
            }
        }
    }
}

impl NodeWorker for ScriptedWorker {
    fn run(&self, task: NodeTask) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((task.node_id.clone(), task.attempt));
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let outcome = self.perform(&task).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        })
    }
}

// ── Evidence ────────────────────────────────────────────────────

pub fn passing(kind: EvidenceKind, scope: &[&str]) -> Evidence {
    Evidence::new(kind, true).with_scope(scope.iter().map(|s| s.to_string()).collect())
}

pub fn failing(kind: EvidenceKind, scope: &[&str], summary: &str) -> Evidence {
    Evidence::new(kind, false)
        .with_scope(scope.iter().map(|s| s.to_string()).collect())
        .with_summary(summary)
}

/// A passing verdict recorded `age_ms` ago.
pub fn aged(kind: EvidenceKind, age_ms: i64) -> Evidence {
    Evidence::new(kind, true).at(Utc::now() - chrono::Duration::milliseconds(age_ms))
}

// ── Config ──────────────────────────────────────────────────────

/// Default configuration with a concurrency limit.
pub fn config_with_limit(limit: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.concurrency_limit = limit;
    config
}

/// Write `content` to a config file in a fresh temp dir.
pub fn write_config(content: &str) -> std::io::Result<(tempfile::TempDir, std::path::PathBuf)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("flowgate.toml");
    std::fs::write(&path, content)?;
    Ok((dir, path))
}

// ── Graph fixtures ──────────────────────────────────────────────

/// a → b → c, no gates.
pub fn linear_graph() -> Value {
    json!({
        "name": "linear",
        "entry": "a",
        "nodes": [
            { "id": "a", "label": "First", "estimatedTokens": 100 },
            { "id": "b", "label": "Second", "estimatedTokens": 200 },
            { "id": "c", "label": "Third", "estimatedTokens": 300 }
        ],
        "edges": [
            { "from": "a", "to": "b" },
            { "from": "b", "to": "c" }
        ]
    })
}

/// start → check (decision) → fast when `mode == "fast"`, else slow;
/// both branches lead to finish.
pub fn decision_graph() -> Value {
    json!({
        "name": "decision",
        "entry": "start",
        "nodes": [
            { "id": "start" },
            { "id": "check", "kind": "decision" },
            { "id": "fast" },
            { "id": "slow" },
            { "id": "finish" }
        ],
        "edges": [
            { "from": "start", "to": "check" },
            {
                "from": "check",
                "to": "fast",
                "condition": { "type": "equals", "path": "mode", "value": "fast" }
            },
            { "from": "check", "to": "slow" },
            { "from": "fast", "to": "finish" },
            { "from": "slow", "to": "finish" }
        ]
    })
}

/// root fans out to left and right, which meet at a join.
pub fn join_graph() -> Value {
    json!({
        "name": "fan-in",
        "entry": "root",
        "nodes": [
            { "id": "root" },
            { "id": "left", "estimatedTokens": 10 },
            { "id": "right", "estimatedTokens": 20 },
            { "id": "merge", "kind": "join" },
            { "id": "after" }
        ],
        "edges": [
            { "from": "root", "to": "left" },
            { "from": "root", "to": "right" },
            { "from": "left", "to": "merge" },
            { "from": "right", "to": "merge" },
            { "from": "merge", "to": "after" }
        ]
    })
}

/// Three independent two-node chains: a1→a2 (3+5), b1→b2 (2+2), c1→c2 (4+1).
pub fn three_chains() -> Value {
    json!({
        "name": "chains",
        "entry": "a1",
        "nodes": [
            { "id": "a1", "estimatedTokens": 3 },
            { "id": "a2", "estimatedTokens": 5 },
            { "id": "b1", "estimatedTokens": 2 },
            { "id": "b2", "estimatedTokens": 2 },
            { "id": "c1", "estimatedTokens": 4 },
            { "id": "c2", "estimatedTokens": 1 }
        ],
        "edges": [
            { "from": "a1", "to": "a2" },
            { "from": "b1", "to": "b2" },
            { "from": "c1", "to": "c2" }
        ]
    })
}

/// plan → implement (impl phase, guarded on src/) → verify (test phase).
pub fn gated_graph() -> Value {
    json!({
        "name": "gated",
        "entry": "plan",
        "nodes": [
            { "id": "plan", "phase": "plan" },
            { "id": "implement", "phase": "impl", "files": ["src/lib.rs"] },
            { "id": "verify", "phase": "test", "files": ["src/lib.rs"] }
        ],
        "edges": [
            { "from": "plan", "to": "implement" },
            { "from": "implement", "to": "verify" }
        ]
    })
}
