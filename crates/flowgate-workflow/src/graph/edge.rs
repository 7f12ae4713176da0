use serde::{Deserialize, Serialize};

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Branch condition. Only meaningful on edges leaving a decision node;
    /// an edge without one is the default branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,
}

/// Predicate over the graph context, addressed by a dotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EdgeCondition {
    /// Value at `path` deep-equals `value`.
    Equals {
        path: String,
        value: serde_json::Value,
    },
    /// Something is stored at `path` (an explicit `null` counts).
    Exists { path: String },
    /// Value at `path` is truthy.
    Truthy { path: String },
}

impl WorkflowEdge {
    /// Create an unconditional edge.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// Create a conditional branch edge.
    pub fn when(
        from: impl Into<String>,
        to: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(condition),
        }
    }

    /// Whether this edge would be taken under `context`.
    /// Unconditional edges always match.
    pub fn matches(&self, context: &serde_json::Value) -> bool {
        self.condition
            .as_ref()
            .map_or(true, |condition| condition.evaluate(context))
    }
}

impl EdgeCondition {
    pub fn equals(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self::Equals {
            path: path.into(),
            value,
        }
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::Exists { path: path.into() }
    }

    pub fn truthy(path: impl Into<String>) -> Self {
        Self::Truthy { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Equals { path, .. } | Self::Exists { path } | Self::Truthy { path } => path,
        }
    }

    /// Evaluate against a context object. Missing paths are false for
    /// every condition type.
    pub fn evaluate(&self, context: &serde_json::Value) -> bool {
        let found = lookup_path(context, self.path());
        match self {
            Self::Equals { value, .. } => found.is_some_and(|v| v == value),
            Self::Exists { .. } => found.is_some(),
            Self::Truthy { .. } => found.is_some_and(is_truthy),
        }
    }
}

impl std::fmt::Display for EdgeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equals { path, value } => write!(f, "{} == {}", path, value),
            Self::Exists { path } => write!(f, "exists {}", path),
            Self::Truthy { path } => write!(f, "{}", path),
        }
    }
}

/// Resolve a dot-separated path. Numeric segments index into arrays.
pub fn lookup_path<'a>(
    context: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    if path.is_empty() {
        return Some(context);
    }
    path.split('.').try_fold(context, |current, segment| match current {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Truthiness: null, false, zero, and the empty string are false;
/// everything else (including empty arrays and objects) is true.
pub fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

/// Pick the first edge, in declaration order, whose condition holds.
pub fn select_branch<'a>(
    edges: impl IntoIterator<Item = &'a WorkflowEdge>,
    context: &serde_json::Value,
) -> Option<&'a WorkflowEdge> {
    edges.into_iter().find(|edge| edge.matches(context))
}
