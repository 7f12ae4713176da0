use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use flowgate_core::config::AppConfig;
use flowgate_core::error::FlowgateError;
use flowgate_core::types::{EvidenceKind, WorkflowEvent};
use flowgate_test_utils::{
    aged, config_with_limit, decision_graph, failing, gated_graph, join_graph, linear_graph,
    passing, three_chains, ScriptedWorker, Step,
};
use flowgate_workflow::{
    CompleteOutcome, EvidenceLedger, ExecuteOptions, ExecutionOutcome, FailOutcome,
    GraphDefinition, GraphStatus, NodeCompletion, NodeStatus, StartOutcome, WorkflowEngine,
};

fn definition(value: Value) -> GraphDefinition {
    serde_json::from_value(value).unwrap()
}

fn engine_with(config: AppConfig) -> (Arc<WorkflowEngine>, Arc<EvidenceLedger>) {
    let ledger = Arc::new(EvidenceLedger::new());
    (Arc::new(WorkflowEngine::new(config, ledger.clone())), ledger)
}

fn engine() -> (Arc<WorkflowEngine>, Arc<EvidenceLedger>) {
    engine_with(AppConfig::default())
}

async fn run_node(engine: &WorkflowEngine, graph_id: &str, node_id: &str) -> CompleteOutcome {
    match engine.start_node(graph_id, node_id).await.unwrap() {
        StartOutcome::Started(_) => {}
        StartOutcome::NotReady(nr) => panic!("{node_id} not ready: {}", nr.reason),
    }
    engine
        .complete_node(graph_id, node_id, NodeCompletion::default(), None)
        .await
        .unwrap()
}

fn ready_ids(views: &[flowgate_workflow::NodeView]) -> Vec<String> {
    views.iter().map(|v| v.id.clone()).collect()
}

// ── Caller-driven ───────────────────────────────────────────────

#[tokio::test]
async fn linear_graph_runs_to_completion() {
    let (engine, _) = engine();
    let mut events = engine.event_bus().subscribe();
    let created = engine
        .create_graph(definition(linear_graph()), json!({}))
        .await
        .unwrap();
    let gid = created.graph_id;
    assert_eq!(ready_ids(&created.ready), vec!["a"]);

    for id in ["a", "b", "c"] {
        assert_eq!(ready_ids(&engine.next_nodes(&gid).await.unwrap()), vec![id]);
        run_node(&engine, &gid, id).await;
    }

    let analysis = engine.analyze(&gid).await.unwrap();
    assert_eq!(analysis.status, GraphStatus::Completed);
    assert_eq!(analysis.progress_percent, 100.0);
    assert_eq!(analysis.estimated_remaining_tokens, 0);
    assert!(engine.next_nodes(&gid).await.unwrap().is_empty());

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            WorkflowEvent::GraphCreated { .. } => "created",
            WorkflowEvent::NodeStarted { .. } => "started",
            WorkflowEvent::NodeCompleted { .. } => "completed",
            WorkflowEvent::GraphCompleted { .. } => "graph_completed",
            _ => "other",
        });
    }
    assert_eq!(kinds.first(), Some(&"created"));
    assert_eq!(kinds.last(), Some(&"graph_completed"));
    assert_eq!(kinds.iter().filter(|k| **k == "started").count(), 3);
}

#[tokio::test]
async fn starting_early_reports_what_it_waits_on() {
    let (engine, _) = engine();
    let gid = engine
        .create_graph(definition(linear_graph()), json!({}))
        .await
        .unwrap()
        .graph_id;

    match engine.start_node(&gid, "b").await.unwrap() {
        StartOutcome::NotReady(nr) => {
            assert_eq!(nr.waiting_on, vec!["a"]);
            assert_eq!(nr.status, NodeStatus::Pending);
        }
        other => panic!("unexpected: {other:?}"),
    }

    // completing a node that never started is refused, not an error
    let outcome = engine
        .complete_node(&gid, "a", NodeCompletion::default(), None)
        .await
        .unwrap();
    assert!(matches!(outcome, CompleteOutcome::NotReady(_)));
}

#[tokio::test]
async fn decision_takes_matching_branch_and_skips_the_other() {
    let (engine, _) = engine();
    let gid = engine
        .create_graph(definition(decision_graph()), json!({ "mode": "fast" }))
        .await
        .unwrap()
        .graph_id;

    run_node(&engine, &gid, "start").await;
    match run_node(&engine, &gid, "check").await {
        CompleteOutcome::Completed(progress) => {
            assert_eq!(progress.branch.as_deref(), Some("fast"));
            assert_eq!(progress.skipped, vec!["slow"]);
            assert_eq!(ready_ids(&progress.next_ready), vec!["fast"]);
        }
        other => panic!("unexpected: {other:?}"),
    }
    run_node(&engine, &gid, "fast").await;
    run_node(&engine, &gid, "finish").await;

    let graph = engine.graph(&gid).await.unwrap();
    assert_eq!(graph.status(), GraphStatus::Completed);
    assert_eq!(graph.node("slow").unwrap().status, NodeStatus::Skipped);
    assert_eq!(graph.node("check").unwrap().selected_branch.as_deref(), Some("fast"));
}

#[tokio::test]
async fn decision_falls_back_to_default_branch() {
    let (engine, _) = engine();
    let gid = engine
        .create_graph(definition(decision_graph()), json!({ "mode": "thorough" }))
        .await
        .unwrap()
        .graph_id;
    run_node(&engine, &gid, "start").await;
    match run_node(&engine, &gid, "check").await {
        CompleteOutcome::Completed(progress) => {
            assert_eq!(progress.branch.as_deref(), Some("slow"));
            assert_eq!(progress.skipped, vec!["fast"]);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn completed_results_feed_later_conditions() {
    let def = json!({
        "name": "results",
        "entry": "inspect",
        "nodes": [
            { "id": "inspect" },
            { "id": "route", "kind": "decision" },
            { "id": "deep" },
            { "id": "shallow" }
        ],
        "edges": [
            { "from": "inspect", "to": "route" },
            {
                "from": "route",
                "to": "deep",
                "condition": { "type": "truthy", "path": "results.inspect.complex" }
            },
            { "from": "route", "to": "shallow" }
        ]
    });
    let (engine, _) = engine();
    let gid = engine.create_graph(definition(def), json!({})).await.unwrap().graph_id;
    engine.start_node(&gid, "inspect").await.unwrap();
    engine
        .complete_node(&gid, "inspect", NodeCompletion::new(json!({ "complex": true })), None)
        .await
        .unwrap();
    match run_node(&engine, &gid, "route").await {
        CompleteOutcome::Completed(progress) => assert_eq!(progress.branch.as_deref(), Some("deep")),
        other => panic!("unexpected: {other:?}"),
    }
    let graph = engine.graph(&gid).await.unwrap();
    assert_eq!(graph.context()["results"]["inspect"]["complex"], json!(true));
}

#[tokio::test]
async fn retries_then_exhausts() {
    let def = json!({
        "name": "flaky",
        "entry": "a",
        "nodes": [
            { "id": "a", "maxRetries": 2 },
            { "id": "b" }
        ],
        "edges": [{ "from": "a", "to": "b" }]
    });
    let (engine, _) = engine();
    let gid = engine.create_graph(definition(def), json!({})).await.unwrap().graph_id;

    for expected_next in [2, 3] {
        engine.start_node(&gid, "a").await.unwrap();
        match engine.fail_node(&gid, "a", "flaky").await.unwrap() {
            FailOutcome::Retrying { attempt, .. } => assert_eq!(attempt, expected_next),
            other => panic!("unexpected: {other:?}"),
        }
    }
    engine.start_node(&gid, "a").await.unwrap();
    match engine.fail_node(&gid, "a", "still flaky").await.unwrap() {
        FailOutcome::Failed(report) => {
            assert_eq!(report.graph_status, GraphStatus::Failed);
            assert_eq!(report.skipped, vec!["b"]);
        }
        other => panic!("unexpected: {other:?}"),
    }

    let graph = engine.graph(&gid).await.unwrap();
    assert_eq!(graph.node("a").unwrap().attempts, 3);
    assert_eq!(graph.node("a").unwrap().error.as_deref(), Some("still flaky"));
    assert!(matches!(
        engine.start_node(&gid, "b").await.unwrap(),
        StartOutcome::NotReady(_)
    ));
}

#[tokio::test]
async fn on_error_continue_and_skip() {
    let def = json!({
        "name": "tolerant",
        "entry": "root",
        "nodes": [
            { "id": "root" },
            { "id": "optional", "onError": "continue" },
            { "id": "after_optional" },
            { "id": "extra", "onError": "skip" },
            { "id": "after_extra" }
        ],
        "edges": [
            { "from": "root", "to": "optional" },
            { "from": "optional", "to": "after_optional" },
            { "from": "root", "to": "extra" },
            { "from": "extra", "to": "after_extra" }
        ]
    });
    let (engine, _) = engine();
    let gid = engine.create_graph(definition(def), json!({})).await.unwrap().graph_id;
    run_node(&engine, &gid, "root").await;

    engine.start_node(&gid, "optional").await.unwrap();
    engine.fail_node(&gid, "optional", "lint noise").await.unwrap();
    engine.start_node(&gid, "extra").await.unwrap();
    match engine.fail_node(&gid, "extra", "not needed").await.unwrap() {
        FailOutcome::Failed(report) => {
            assert_eq!(report.status, NodeStatus::Skipped);
            assert_eq!(report.skipped, vec!["after_extra"]);
        }
        other => panic!("unexpected: {other:?}"),
    }

    assert_eq!(
        ready_ids(&engine.next_nodes(&gid).await.unwrap()),
        vec!["after_optional"]
    );
    run_node(&engine, &gid, "after_optional").await;
    let graph = engine.graph(&gid).await.unwrap();
    assert_eq!(graph.status(), GraphStatus::Completed);
    assert_eq!(graph.node("optional").unwrap().status, NodeStatus::Failed);
}

#[tokio::test]
async fn join_waits_for_every_branch_including_a_skipped_failure() {
    let def = json!({
        "name": "fan-in",
        "entry": "p1",
        "nodes": [
            { "id": "p1" },
            { "id": "p2" },
            { "id": "p3", "onError": "skip" },
            { "id": "j", "kind": "join" }
        ],
        "edges": [
            { "from": "p1", "to": "j" },
            { "from": "p2", "to": "j" },
            { "from": "p3", "to": "j" }
        ]
    });
    let (engine, _) = engine();
    let gid = engine.create_graph(definition(def), json!({})).await.unwrap().graph_id;

    run_node(&engine, &gid, "p2").await;
    run_node(&engine, &gid, "p1").await;
    assert_eq!(ready_ids(&engine.next_nodes(&gid).await.unwrap()), vec!["p3"]);

    engine.start_node(&gid, "p3").await.unwrap();
    match engine.fail_node(&gid, "p3", "flaky mirror").await.unwrap() {
        FailOutcome::Failed(report) => {
            assert_eq!(report.status, NodeStatus::Skipped);
            assert!(report.skipped.is_empty());
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(ready_ids(&engine.next_nodes(&gid).await.unwrap()), vec!["j"]);
}

// ── Gates ───────────────────────────────────────────────────────

#[tokio::test]
async fn failing_evidence_blocks_until_a_newer_pass() {
    let (engine, ledger) = engine();
    let gid = engine
        .create_graph(definition(gated_graph()), json!({}))
        .await
        .unwrap()
        .graph_id;
    run_node(&engine, &gid, "plan").await;

    ledger
        .record(failing(EvidenceKind::Guard, &["src"], "2 clippy errors"))
        .await;
    match run_node(&engine, &gid, "implement").await {
        CompleteOutcome::Blocked { gate, .. } => {
            assert!(gate.missing_evidence.is_empty());
            assert_eq!(gate.failing_evidence[0].reason, "2 clippy errors");
            let last = gate.next_tool_calls.last().unwrap();
            assert_eq!(last.tool, "complete_node");
            assert_eq!(last.arguments["nodeId"], "implement");
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(
        engine.graph(&gid).await.unwrap().node("implement").unwrap().status,
        NodeStatus::Blocked
    );

    tokio::time::sleep(Duration::from_millis(5)).await;
    ledger.record(passing(EvidenceKind::Guard, &["src"])).await;
    let outcome = engine
        .complete_node(&gid, "implement", NodeCompletion::default(), None)
        .await
        .unwrap();
    match outcome {
        CompleteOutcome::Completed(progress) => {
            assert!(progress.gate.unwrap().is_passed());
            assert_eq!(ready_ids(&progress.next_ready), vec!["verify"]);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn stale_and_out_of_scope_evidence_count_as_missing() {
    let mut config = AppConfig::default();
    config.gates.max_age_ms = 1_000;
    let (engine, ledger) = engine_with(config);
    let gid = engine
        .create_graph(definition(gated_graph()), json!({}))
        .await
        .unwrap()
        .graph_id;
    run_node(&engine, &gid, "plan").await;

    ledger.record(aged(EvidenceKind::Guard, 60_000)).await;
    ledger.record(passing(EvidenceKind::Guard, &["docs"])).await;
    match run_node(&engine, &gid, "implement").await {
        CompleteOutcome::Blocked { gate, .. } => {
            assert_eq!(gate.missing_evidence, vec![EvidenceKind::Guard]);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_phase_requires_test_evidence() {
    let (engine, ledger) = engine();
    let gid = engine
        .create_graph(definition(gated_graph()), json!({}))
        .await
        .unwrap()
        .graph_id;
    run_node(&engine, &gid, "plan").await;
    ledger.record(passing(EvidenceKind::Guard, &[])).await;
    run_node(&engine, &gid, "implement").await;

    match run_node(&engine, &gid, "verify").await {
        CompleteOutcome::Blocked { gate, .. } => {
            assert_eq!(gate.missing_evidence, vec![EvidenceKind::Test]);
            assert_eq!(gate.next_tool_calls[0].tool, "test_run");
            assert_eq!(gate.next_tool_calls[0].arguments["files"], json!(["src/lib.rs"]));
        }
        other => panic!("unexpected: {other:?}"),
    }
    ledger.record(passing(EvidenceKind::Test, &["src/lib.rs"])).await;
    let outcome = engine
        .complete_node(&gid, "verify", NodeCompletion::default(), None)
        .await
        .unwrap();
    assert!(
        matches!(outcome, CompleteOutcome::Completed(ref p) if p.graph_status == GraphStatus::Completed)
    );
}

// ── Analysis ────────────────────────────────────────────────────

#[tokio::test]
async fn three_chains_analysis() {
    let (engine, _) = engine();
    let created = engine
        .create_graph(definition(three_chains()), json!({}))
        .await
        .unwrap();
    assert_eq!(ready_ids(&created.ready), vec!["a1", "b1", "c1"]);

    let analysis = created.summary;
    assert_eq!(analysis.critical_path.node_ids, vec!["a1", "a2"]);
    assert_eq!(analysis.critical_path.total_tokens, 8);
    assert_eq!(
        analysis.parallel_groups,
        vec![vec!["a1", "b1", "c1"], vec!["a2", "b2", "c2"]]
    );
    assert_eq!(analysis.max_parallelism, 3);
    assert_eq!(analysis.total_estimated_tokens, 17);
}

// ── Engine-driven ───────────────────────────────────────────────

#[tokio::test]
async fn execute_join_graph_auto_completes_join() {
    let (engine, _) = engine();
    let worker = Arc::new(ScriptedWorker::new().with_tokens(5));
    let summary = engine
        .execute_graph(
            definition(join_graph()),
            json!({}),
            ExecuteOptions::default(),
            worker.clone(),
        )
        .await
        .unwrap();

    assert_eq!(summary.outcome, ExecutionOutcome::Completed);
    assert_eq!(worker.attempts_for("merge"), 0);
    assert_eq!(summary.node("merge").unwrap().status, NodeStatus::Done);
    assert_eq!(summary.node("after").unwrap().status, NodeStatus::Done);
    assert_eq!(summary.analysis.actual_tokens_used, 20);
    let order = worker.started_order();
    assert_eq!(order.first().map(String::as_str), Some("root"));
    assert_eq!(order.last().map(String::as_str), Some("after"));
}

#[tokio::test]
async fn execute_respects_concurrency_limit() {
    let nodes: Vec<Value> = (0..6).map(|i| json!({ "id": format!("n{i}") })).collect();
    let def = json!({ "name": "wide", "entry": "n0", "nodes": nodes });
    let (engine, _) = engine_with(config_with_limit(2));
    let worker = Arc::new(ScriptedWorker::new().with_delay(Duration::from_millis(30)));

    let summary = engine
        .execute_graph(definition(def), json!({}), ExecuteOptions::default(), worker.clone())
        .await
        .unwrap();
    assert_eq!(summary.outcome, ExecutionOutcome::Completed);
    assert_eq!(worker.calls().len(), 6);
    assert!(worker.peak_concurrency() <= 2, "peak {}", worker.peak_concurrency());
    assert!(worker.peak_concurrency() >= 2);
}

#[tokio::test]
async fn execute_dispatches_by_priority() {
    let def = json!({
        "name": "prio",
        "entry": "low",
        "nodes": [
            { "id": "low", "priority": 1 },
            { "id": "high", "priority": 10 },
            { "id": "mid", "priority": 5 }
        ]
    });
    let (engine, _) = engine();
    let worker = Arc::new(ScriptedWorker::new());
    engine
        .execute_graph(
            definition(def),
            json!({}),
            ExecuteOptions {
                concurrency_limit: Some(1),
                ..Default::default()
            },
            worker.clone(),
        )
        .await
        .unwrap();
    assert_eq!(worker.started_order(), vec!["high", "mid", "low"]);
}

#[tokio::test]
async fn execute_retries_scripted_failures() {
    let def = json!({
        "name": "retry",
        "entry": "a",
        "nodes": [{ "id": "a", "maxRetries": 2 }]
    });
    let (engine, _) = engine();
    let worker = Arc::new(
        ScriptedWorker::new().script("a", vec![Step::fail("one"), Step::fail("two")]),
    );
    let summary = engine
        .execute_graph(definition(def), json!({}), ExecuteOptions::default(), worker.clone())
        .await
        .unwrap();
    assert_eq!(summary.outcome, ExecutionOutcome::Completed);
    assert_eq!(
        worker.calls(),
        vec![("a".to_string(), 1), ("a".to_string(), 2), ("a".to_string(), 3)]
    );
    assert_eq!(summary.node("a").unwrap().attempts, 3);
}

#[tokio::test]
async fn execute_times_out_hung_node() {
    let def = json!({
        "name": "hang",
        "entry": "stuck",
        "nodes": [
            { "id": "stuck", "timeoutMs": 50 },
            { "id": "next" }
        ],
        "edges": [{ "from": "stuck", "to": "next" }]
    });
    let (engine, _) = engine();
    let worker = Arc::new(ScriptedWorker::new().script("stuck", vec![Step::Hang]));
    let summary = engine
        .execute_graph(definition(def), json!({}), ExecuteOptions::default(), worker.clone())
        .await
        .unwrap();

    assert_eq!(summary.outcome, ExecutionOutcome::Failed);
    let stuck = summary.node("stuck").unwrap();
    assert_eq!(stuck.status, NodeStatus::Failed);
    assert!(stuck.error.as_deref().unwrap().contains("timed out after 50ms"));
    assert_eq!(summary.node("next").unwrap().status, NodeStatus::Skipped);
    assert_eq!(worker.attempts_for("next"), 0);
}

#[tokio::test]
async fn execute_follows_decision_from_context() {
    let (engine, _) = engine();
    let worker = Arc::new(ScriptedWorker::new());
    let summary = engine
        .execute_graph(
            definition(decision_graph()),
            json!({ "mode": "fast" }),
            ExecuteOptions::default(),
            worker.clone(),
        )
        .await
        .unwrap();
    assert_eq!(summary.outcome, ExecutionOutcome::Completed);
    assert_eq!(worker.attempts_for("slow"), 0);
    assert_eq!(summary.node("slow").unwrap().status, NodeStatus::Skipped);
    assert_eq!(summary.node("finish").unwrap().status, NodeStatus::Done);
}

#[tokio::test]
async fn deleting_a_running_graph_cancels_execution() {
    let (engine, _) = engine();
    let worker = Arc::new(ScriptedWorker::new().with_delay(Duration::from_millis(150)));
    let run = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .execute_graph(
                    definition(linear_graph()),
                    json!({}),
                    ExecuteOptions::default(),
                    worker,
                )
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let listing = engine.list_graphs().await;
    assert_eq!(listing.len(), 1);
    engine.delete_graph(&listing[0].id).await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.outcome, ExecutionOutcome::Cancelled);
    assert!(matches!(
        engine.analyze(&summary.graph_id).await.unwrap_err(),
        FlowgateError::GraphNotFound(_)
    ));
}

#[tokio::test]
async fn structural_errors_surface_from_execute() {
    let def = json!({
        "name": "loop",
        "entry": "a",
        "nodes": [{ "id": "a" }, { "id": "b" }, { "id": "c" }],
        "edges": [
            { "from": "a", "to": "b" },
            { "from": "b", "to": "c" },
            { "from": "c", "to": "b" }
        ]
    });
    let (engine, _) = engine();
    let err = engine
        .execute_graph(
            definition(def),
            json!({}),
            ExecuteOptions::default(),
            Arc::new(ScriptedWorker::new()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FlowgateError::CycleDetected(_)));
    assert!(engine.list_graphs().await.is_empty());
}
