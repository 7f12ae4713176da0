//! Mermaid flowchart export.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use flowgate_core::error::FlowgateError;
use flowgate_core::types::NodeKind;

use super::model::WorkflowGraph;
use super::node::NodeStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    #[serde(rename = "TD")]
    TopDown,
    #[serde(rename = "LR")]
    LeftRight,
    #[serde(rename = "BT")]
    BottomTop,
    #[serde(rename = "RL")]
    RightLeft,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopDown => "TD",
            Self::LeftRight => "LR",
            Self::BottomTop => "BT",
            Self::RightLeft => "RL",
        }
    }
}

impl FromStr for Direction {
    type Err = FlowgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TD" | "TB" => Ok(Self::TopDown),
            "LR" => Ok(Self::LeftRight),
            "BT" => Ok(Self::BottomTop),
            "RL" => Ok(Self::RightLeft),
            other => Err(FlowgateError::ToolValidation(format!(
                "unknown diagram direction '{}', expected TD, LR, BT or RL",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiagramOptions {
    pub direction: Direction,
    /// Colour nodes by their current status.
    pub node_states: bool,
}

fn class_style(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Pending => "fill:#f5f5f5,stroke:#9e9e9e",
        NodeStatus::Ready => "fill:#e3f2fd,stroke:#1e88e5",
        NodeStatus::Running => "fill:#fff3e0,stroke:#fb8c00",
        NodeStatus::Blocked => "fill:#ffebee,stroke:#e53935,stroke-width:2px",
        NodeStatus::Done => "fill:#e8f5e9,stroke:#43a047",
        NodeStatus::Failed => "fill:#ffcdd2,stroke:#b71c1c",
        NodeStatus::Skipped => "fill:#eeeeee,stroke:#bdbdbd,stroke-dasharray:4 2",
    }
}

/// Render the graph as a Mermaid flowchart. Output is deterministic:
/// nodes and links are sorted by id.
pub fn render_mermaid(graph: &WorkflowGraph, options: &DiagramOptions) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "flowchart {}", options.direction.as_str());

    let mut nodes: Vec<_> = graph.nodes().iter().collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    for node in &nodes {
        let id = mermaid_id(&node.id);
        let label = escape(&node.label);
        let _ = match node.kind {
            NodeKind::Task => writeln!(out, "    {}[\"{}\"]", id, label),
            NodeKind::Decision => writeln!(out, "    {}{{\"{}\"}}", id, label),
            NodeKind::Join => writeln!(out, "    {}((\"{}\"))", id, label),
        };
    }

    let mut links: Vec<(String, String, String)> = graph
        .edges()
        .iter()
        .map(|edge| {
            let arrow = match edge.condition {
                Some(ref condition) => format!("-->|{}|", escape(&condition.to_string())),
                None => "-->".to_string(),
            };
            (edge.from.clone(), edge.to.clone(), arrow)
        })
        .collect();
    let topo = graph.topology();
    for (to, preds) in topo.preds.iter().enumerate() {
        for link in preds.iter().filter(|l| l.edge.is_none()) {
            links.push((
                graph.nodes()[link.node].id.clone(),
                graph.nodes()[to].id.clone(),
                "-.->".to_string(),
            ));
        }
    }
    links.sort();
    for (from, to, arrow) in &links {
        let _ = writeln!(out, "    {} {} {}", mermaid_id(from), arrow, mermaid_id(to));
    }

    if options.node_states {
        let mut by_status: BTreeMap<&'static str, (NodeStatus, Vec<String>)> = BTreeMap::new();
        for node in &nodes {
            by_status
                .entry(node.status.as_str())
                .or_insert_with(|| (node.status, Vec::new()))
                .1
                .push(mermaid_id(&node.id));
        }
        for (name, (status, ids)) in &by_status {
            let _ = writeln!(out, "    classDef {} {}", name, class_style(*status));
            let _ = writeln!(out, "    class {} {}", ids.join(","), name);
        }
    }

    out
}

/// Mermaid ids may only contain word characters.
fn mermaid_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn escape(text: &str) -> String {
    text.replace('"', "#quot;").replace('|', "#124;")
}
