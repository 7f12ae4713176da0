use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{Duration, Utc};
use proptest::prelude::*;
use serde_json::json;

use flowgate_core::config::{EngineConfig, GateConfig};
use flowgate_core::error::FlowgateError;
use flowgate_core::types::{Evidence, EvidenceKind, NodeKind, OnError};
use flowgate_workflow::gate::{evaluate_gate, GateSubject};
use flowgate_workflow::{
    CompleteOutcome, FailOutcome, GateDecision, GatePolicy, GraphDefinition, GraphStatus,
    NodeCompletion, NodeStatus, StartOutcome, WorkflowEdge, WorkflowGraph, WorkflowNode,
};

/// Acyclic definitions: node i may only receive edges from nodes < i, so
/// node 0 is always a root and a valid entry.
fn dag_strategy(max_nodes: usize) -> impl Strategy<Value = GraphDefinition> {
    (1..=max_nodes).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n).prop_map(
            move |raw| {
                let mut def = GraphDefinition::new("prop", "n0");
                let mut edges = BTreeSet::new();
                for (i, sources) in raw.into_iter().enumerate() {
                    def = def.with_node(WorkflowNode::new(format!("n{i}"), format!("Node {i}")));
                    if i > 0 {
                        for s in sources {
                            edges.insert((s % i, i));
                        }
                    }
                }
                for (from, to) in edges {
                    def = def.with_edge(WorkflowEdge::new(format!("n{from}"), format!("n{to}")));
                }
                def
            },
        )
    })
}

fn build(def: GraphDefinition) -> WorkflowGraph {
    WorkflowGraph::build(def, json!({}), &EngineConfig::default()).unwrap()
}

/// Same shape as `dag_strategy`, with random token estimates.
fn weighted_dag_strategy(max_nodes: usize) -> impl Strategy<Value = GraphDefinition> {
    (
        dag_strategy(max_nodes),
        proptest::collection::vec(0u64..1_000, max_nodes),
    )
        .prop_map(|(mut def, weights)| {
            for (node, w) in def.nodes.iter_mut().zip(weights) {
                node.estimated_tokens = w;
            }
            def
        })
}

/// Turns the flagged nodes that have outgoing edges into decisions. Their
/// edges are unconditional, so the first declared one is always taken.
fn branching_dag_strategy(max_nodes: usize) -> impl Strategy<Value = GraphDefinition> {
    (
        dag_strategy(max_nodes),
        proptest::collection::vec(any::<bool>(), max_nodes),
    )
        .prop_map(|(mut def, flags)| {
            let sources: HashSet<String> = def.edges.iter().map(|e| e.from.clone()).collect();
            for (node, decide) in def.nodes.iter_mut().zip(flags) {
                if decide && sources.contains(&node.id) {
                    node.kind = NodeKind::Decision;
                }
            }
            def
        })
}

fn successors(def: &GraphDefinition, id: &str) -> Vec<String> {
    def.edges
        .iter()
        .filter(|e| e.from == id)
        .map(|e| e.to.clone())
        .collect()
}

/// Heaviest root-to-sink path weight by walking every path.
fn brute_force_heaviest(def: &GraphDefinition) -> u64 {
    let weight: HashMap<&str, u64> = def
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.estimated_tokens))
        .collect();

    fn walk(def: &GraphDefinition, weight: &HashMap<&str, u64>, id: &str) -> u64 {
        let here = weight[id];
        successors(def, id)
            .iter()
            .map(|next| walk(def, weight, next))
            .max()
            .map_or(here, |rest| here + rest)
    }

    def.nodes
        .iter()
        .filter(|n| predecessors(def, &n.id).is_empty())
        .map(|n| walk(def, &weight, &n.id))
        .max()
        .unwrap_or(0)
}

/// Start and complete ready nodes until nothing is ready.
fn run_to_rest(graph: &mut WorkflowGraph) {
    loop {
        let ready = graph.ready_nodes();
        if ready.is_empty() {
            break;
        }
        for view in ready {
            graph.start_node(&view.id).unwrap();
            graph
                .complete_node(&view.id, NodeCompletion::default(), GateDecision::NotRequired)
                .unwrap();
        }
    }
}

fn predecessors(def: &GraphDefinition, id: &str) -> Vec<String> {
    def.edges
        .iter()
        .filter(|e| e.to == id)
        .map(|e| e.from.clone())
        .collect()
}

proptest! {
    #[test]
    fn initial_ready_set_is_exactly_the_roots(def in dag_strategy(10)) {
        let roots: HashSet<String> = def
            .nodes
            .iter()
            .filter(|n| predecessors(&def, &n.id).is_empty())
            .map(|n| n.id.clone())
            .collect();
        let graph = build(def);
        let ready: HashSet<String> = graph.ready_nodes().into_iter().map(|v| v.id).collect();
        prop_assert_eq!(ready, roots);
    }

    #[test]
    fn closing_a_loop_is_rejected(n in 3usize..8) {
        let mut def = GraphDefinition::new("loop", "n0");
        for i in 0..n {
            def = def.with_node(WorkflowNode::new(format!("n{i}"), ""));
        }
        for i in 1..n {
            def = def.with_edge(WorkflowEdge::new(format!("n{}", i - 1), format!("n{i}")));
        }
        def = def.with_edge(WorkflowEdge::new(format!("n{}", n - 1), "n1"));
        let err = WorkflowGraph::build(def, json!({}), &EngineConfig::default()).unwrap_err();
        prop_assert!(matches!(err, FlowgateError::CycleDetected(_)), "got {}", err);
    }

    #[test]
    fn nodes_only_start_after_their_predecessors(def in dag_strategy(10)) {
        let preds: Vec<(String, Vec<String>)> = def
            .nodes
            .iter()
            .map(|n| (n.id.clone(), predecessors(&def, &n.id)))
            .collect();
        let mut graph = build(def);

        let mut steps = 0;
        while graph.status() == GraphStatus::Active && steps < 100 {
            steps += 1;
            let ready = graph.ready_nodes();
            prop_assert!(!ready.is_empty(), "active graph with nothing ready");
            for view in ready {
                let (_, deps) = preds.iter().find(|(id, _)| *id == view.id).unwrap();
                for dep in deps {
                    prop_assert_eq!(graph.node(dep).unwrap().status, NodeStatus::Done);
                }
                let started = graph.start_node(&view.id).unwrap();
                prop_assert!(matches!(started, StartOutcome::Started(_)));
                let done = graph
                    .complete_node(&view.id, NodeCompletion::default(), GateDecision::NotRequired)
                    .unwrap();
                prop_assert!(matches!(done, CompleteOutcome::Completed(_)));
            }
        }
        prop_assert_eq!(graph.status(), GraphStatus::Completed);
        prop_assert!(graph.nodes().iter().all(|n| n.status == NodeStatus::Done));
    }

    #[test]
    fn attempts_never_exceed_retries_plus_one(max_retries in 0u32..5) {
        let def = GraphDefinition::new("retry", "a")
            .with_node(WorkflowNode::new("a", "A").with_retries(max_retries));
        let mut graph = build(def);

        let mut attempts = 0;
        loop {
            match graph.start_node("a").unwrap() {
                StartOutcome::Started(_) => attempts += 1,
                StartOutcome::NotReady(_) => break,
            }
            if let FailOutcome::Failed(_) = graph.fail_node("a", "boom").unwrap() {
                break;
            }
        }
        prop_assert_eq!(attempts, max_retries + 1);
        prop_assert_eq!(graph.status(), GraphStatus::Failed);
        prop_assert!(matches!(graph.start_node("a").unwrap(), StartOutcome::NotReady(_)));
    }

    #[test]
    fn failure_skips_every_unfinished_node(def in dag_strategy(8), victim in any::<usize>()) {
        let n = def.nodes.len();
        let victim = format!("n{}", victim % n);
        let mut graph = build(def);

        // run until the victim starts, then fail it with the default policy
        'outer: loop {
            let ready = graph.ready_nodes();
            prop_assert!(!ready.is_empty());
            for view in ready {
                graph.start_node(&view.id).unwrap();
                if view.id == victim {
                    graph.fail_node(&view.id, "boom").unwrap();
                    break 'outer;
                }
                graph
                    .complete_node(&view.id, NodeCompletion::default(), GateDecision::NotRequired)
                    .unwrap();
            }
        }
        prop_assert_eq!(graph.status(), GraphStatus::Failed);
        for node in graph.nodes() {
            prop_assert!(node.status.is_terminal());
            if node.id != victim {
                prop_assert!(matches!(node.status, NodeStatus::Done | NodeStatus::Skipped));
            }
        }
        prop_assert!(graph.ready_nodes().is_empty());
    }

    #[test]
    fn gate_evaluation_is_deterministic_and_age_bounded(
        age_ms in 0i64..10_000,
        max_age_ms in 1u64..10_000,
        passed in any::<bool>(),
    ) {
        let now = Utc::now();
        let subject = GateSubject {
            graph_id: "wf-prop".into(),
            node_id: "impl".into(),
            files: vec!["src/lib.rs".into()],
        };
        let policy = GatePolicy::guard().with_max_age(max_age_ms);
        let evidence = Evidence::new(EvidenceKind::Guard, passed).at(now - Duration::milliseconds(age_ms));
        let config = GateConfig::default();

        let first = evaluate_gate(&subject, &policy, Some(&evidence), None, now, &config);
        let second = evaluate_gate(&subject, &policy, Some(&evidence), None, now, &config);
        prop_assert_eq!(&first, &second);

        let stale = age_ms > max_age_ms as i64;
        prop_assert_eq!(first.missing_evidence.contains(&EvidenceKind::Guard), stale);
        prop_assert_eq!(first.is_passed(), !stale && passed);
        if !first.is_passed() {
            prop_assert_eq!(
                first.next_tool_calls.last().map(|c| c.tool.as_str()),
                Some("complete_node")
            );
        }
    }

    #[test]
    fn ready_nodes_is_idempotent(def in dag_strategy(10), steps in 0usize..10) {
        let mut graph = build(def);
        for _ in 0..steps {
            let Some(view) = graph.ready_nodes().into_iter().next() else {
                break;
            };
            graph.start_node(&view.id).unwrap();
            graph
                .complete_node(&view.id, NodeCompletion::default(), GateDecision::NotRequired)
                .unwrap();
        }
        let first = graph.ready_nodes();
        let second = graph.ready_nodes();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn critical_path_is_the_heaviest_path(def in weighted_dag_strategy(8)) {
        let expected = brute_force_heaviest(&def);
        let weight: HashMap<String, u64> = def
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.estimated_tokens))
            .collect();
        let edges: HashSet<(String, String)> = def
            .edges
            .iter()
            .map(|e| (e.from.clone(), e.to.clone()))
            .collect();
        let graph = build(def.clone());
        let path = graph.critical_path();

        prop_assert_eq!(path.total_tokens, expected);
        let sum: u64 = path.node_ids.iter().map(|id| weight[id]).sum();
        prop_assert_eq!(sum, expected);
        prop_assert_eq!(path.cumulative_tokens.last().copied().unwrap_or(0), expected);

        // a real root-to-sink path
        let first = path.node_ids.first().unwrap();
        let last = path.node_ids.last().unwrap();
        prop_assert!(predecessors(&def, first).is_empty());
        prop_assert!(successors(&def, last).is_empty());
        for pair in path.node_ids.windows(2) {
            prop_assert!(edges.contains(&(pair[0].clone(), pair[1].clone())));
        }
    }

    #[test]
    fn skipped_exactly_when_no_live_path_remains(def in branching_dag_strategy(10)) {
        // node i only has edges from nodes < i, so index order is topological
        let mut live: HashMap<String, bool> = HashMap::new();
        for node in &def.nodes {
            let preds = predecessors(&def, &node.id);
            let alive = preds.is_empty()
                || preds.iter().any(|p| {
                    let source = def.nodes.iter().find(|n| n.id == *p).unwrap();
                    let taken = source.kind != NodeKind::Decision
                        || successors(&def, p).first() == Some(&node.id);
                    live[p] && taken
                });
            live.insert(node.id.clone(), alive);
        }

        let mut graph = build(def);
        run_to_rest(&mut graph);

        prop_assert_eq!(graph.status(), GraphStatus::Completed);
        for node in graph.nodes() {
            let expected = if live[&node.id] { NodeStatus::Done } else { NodeStatus::Skipped };
            prop_assert_eq!(node.status, expected, "node {}", node.id);
        }
    }

    #[test]
    fn join_ready_only_after_every_branch_finishes(
        order in (2usize..6).prop_flat_map(|k| Just((0..k).collect::<Vec<_>>()).prop_shuffle()),
        failures in proptest::collection::vec(any::<bool>(), 6),
    ) {
        let k = order.len();
        let mut def = GraphDefinition::new("fan-in", "p0")
            .with_node(WorkflowNode::join("j", "Join"));
        for i in 0..k {
            def = def
                .with_node(
                    WorkflowNode::new(format!("p{i}"), "")
                        .with_retries(0)
                        .with_on_error(OnError::Continue),
                )
                .with_edge(WorkflowEdge::new(format!("p{i}"), "j"));
        }
        let mut graph = build(def);
        for i in 0..k {
            graph.start_node(&format!("p{i}")).unwrap();
        }

        for (step, i) in order.into_iter().enumerate() {
            let id = format!("p{i}");
            if failures[i] {
                graph.fail_node(&id, "boom").unwrap();
            } else {
                graph
                    .complete_node(&id, NodeCompletion::default(), GateDecision::NotRequired)
                    .unwrap();
            }
            let join_ready = graph.ready_nodes().iter().any(|v| v.id == "j");
            prop_assert_eq!(join_ready, step + 1 == k);
        }
        prop_assert_eq!(graph.node("j").unwrap().status, NodeStatus::Ready);
    }
}
