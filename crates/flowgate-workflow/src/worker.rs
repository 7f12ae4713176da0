use std::path::PathBuf;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::NodeWorker;
use flowgate_core::types::{NodeOutput, NodeTask};

const MAX_OUTPUT: usize = 30_000;

/// Worker that runs a node's `payload.command` with `bash -c`.
///
/// Nodes without a command complete immediately and echo their payload,
/// which makes a whole graph dry-runnable.
pub struct CommandWorker {
    working_dir: PathBuf,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: Option<String>,
}

impl CommandWorker {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }

    async fn run_command(&self, task: &NodeTask, command: &str) -> Result<NodeOutput> {
        debug!(node_id = %task.node_id, attempt = task.attempt, command = %command, "Running node command");

        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .env("FLOWGATE_GRAPH_ID", &task.graph_id)
            .env("FLOWGATE_NODE_ID", &task.node_id)
            .env("FLOWGATE_ATTEMPT", task.attempt.to_string())
            .kill_on_drop(true);

        let output = tokio::select! {
            output = cmd.output() => output?,
            _ = task.cancel.cancelled() => {
                return Err(FlowgateError::Cancelled(task.node_id.clone()));
            }
        };

        let stdout = truncate_output(String::from_utf8_lossy(&output.stdout).into_owned());
        let stderr = truncate_output(String::from_utf8_lossy(&output.stderr).into_owned());

        if output.status.success() {
            Ok(NodeOutput::new(serde_json::json!({
                "exitCode": 0,
                "stdout": stdout,
                "stderr": stderr,
            })))
        } else {
            let code = output.status.code().unwrap_or(-1);
            let detail = if stderr.is_empty() { stdout } else { stderr };
            Err(FlowgateError::NodeExecution {
                node: task.node_id.clone(),
                message: format!("Exit code {}\n{}", code, detail.trim_end()),
            })
        }
    }
}

impl NodeWorker for CommandWorker {
    fn run(&self, task: NodeTask) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let payload: CommandPayload =
                serde_json::from_value(task.payload.clone()).unwrap_or(CommandPayload { command: None });
            match payload.command {
                Some(command) if !command.trim().is_empty() => {
                    self.run_command(&task, &command).await
                }
                _ => Ok(NodeOutput::new(task.payload.clone())),
            }
        })
    }
}

fn truncate_output(mut text: String) -> String {
    if text.len() > MAX_OUTPUT {
        let mut cut = MAX_OUTPUT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... (output truncated)");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::types::NodeKind;
    use tokio_util::sync::CancellationToken;

    fn task(payload: serde_json::Value) -> NodeTask {
        NodeTask {
            graph_id: "wf-test".into(),
            node_id: "build".into(),
            label: "Build".into(),
            kind: NodeKind::Task,
            phase: None,
            payload,
            tools: vec![],
            files: vec![],
            attempt: 1,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    fn worker() -> CommandWorker {
        CommandWorker::new(std::env::temp_dir())
    }

    #[tokio::test]
    async fn test_echoes_payload_without_command() {
        let payload = serde_json::json!({ "plan": ["a", "b"] });
        let output = worker().run(task(payload.clone())).await.unwrap();
        assert_eq!(output.result, payload);
    }

    #[tokio::test]
    async fn test_runs_command() {
        let output = worker()
            .run(task(serde_json::json!({ "command": "echo $FLOWGATE_NODE_ID" })))
            .await
            .unwrap();
        assert_eq!(output.result["stdout"], "build\n");
        assert_eq!(output.result["exitCode"], 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let err = worker()
            .run(task(serde_json::json!({ "command": "echo nope >&2; exit 3" })))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Exit code 3"), "{msg}");
        assert!(msg.contains("nope"), "{msg}");
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let t = task(serde_json::json!({ "command": "sleep 30" }));
        let cancel = t.cancel.clone();
        let w = worker();
        let run = w.run(t);
        cancel.cancel();
        let err = tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, FlowgateError::Cancelled(_)));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(MAX_OUTPUT);
        let out = truncate_output(text);
        assert!(out.ends_with("(output truncated)"));
    }
}
