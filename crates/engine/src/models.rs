//! Core domain models for the workflow engine.
//!
//! Nodes refer to each other only by id. The graph owns every node behind an
//! `Arc`, so swapping a node is a pointer replacement rather than an in-place
//! edit.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use agents::NodeResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Results of a run, keyed by node id.
pub type ResultMap = BTreeMap<String, NodeResult>;

// ---------------------------------------------------------------------------
// NodeKind
// ---------------------------------------------------------------------------

/// What a node does when its stage runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Handed to a collaborator.
    #[default]
    Task,
    /// Fans out to its children's collaborators concurrently.
    ParallelGroup,
    /// Resolved by the engine itself from its dependencies' results.
    Conditional,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Task => write!(f, "task"),
            NodeKind::ParallelGroup => write!(f, "parallel-group"),
            NodeKind::Conditional => write!(f, "conditional"),
        }
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// Predicate over an upstream node's result.
///
/// Used on edges (the target only runs if the predicate holds for the source)
/// and by conditional nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Same as no condition: the upstream node succeeded.
    Always,
    /// The upstream node succeeded.
    Succeeded,
    /// The output, rendered as text, contains `text`.
    OutputContains { text: String },
    /// The output equals `value` exactly.
    OutputEquals { value: Value },
    /// The value at a JSON pointer inside the output equals `value`.
    FieldEquals { pointer: String, value: Value },
}

impl Condition {
    /// Evaluate against an upstream result. Every condition requires the
    /// upstream node to have succeeded.
    pub fn evaluate(&self, result: &NodeResult) -> bool {
        result.is_success()
            && self.evaluate_value(result.output.as_ref().unwrap_or(&Value::Null))
    }

    /// Evaluate against a bare value (a success output or the run context).
    pub fn evaluate_value(&self, value: &Value) -> bool {
        match self {
            Condition::Always | Condition::Succeeded => true,
            Condition::OutputContains { text } => match value {
                Value::String(s) => s.contains(text.as_str()),
                other => other.to_string().contains(text.as_str()),
            },
            Condition::OutputEquals { value: expected } => value == expected,
            Condition::FieldEquals { pointer, value: expected } => {
                value.pointer(pointer) == Some(expected)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A single unit of work in the workflow graph.
///
/// `depends_on` is derived from the graph's edges; set it on a node before
/// `add_node` and the graph turns each entry into an edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique identifier within the workflow.
    pub id: String,
    pub kind: NodeKind,
    /// Registered collaborator id. Task nodes only.
    pub collaborator: Option<String>,
    /// Opaque task description handed to the collaborator.
    pub payload: String,
    pub depends_on: BTreeSet<String>,
    /// Members of a parallel group.
    pub children: BTreeSet<String>,
    /// Gate evaluated by a conditional node.
    pub condition: Option<Condition>,
    /// Expected duration, used for the critical path.
    pub estimate: Option<Duration>,
}

impl Node {
    fn bare(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            collaborator: None,
            payload: String::new(),
            depends_on: BTreeSet::new(),
            children: BTreeSet::new(),
            condition: None,
            estimate: None,
        }
    }

    pub fn task(
        id: impl Into<String>,
        collaborator: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            collaborator: Some(collaborator.into()),
            payload: payload.into(),
            ..Self::bare(id, NodeKind::Task)
        }
    }

    pub fn parallel_group<I, S>(id: impl Into<String>, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            children: children.into_iter().map(Into::into).collect(),
            ..Self::bare(id, NodeKind::ParallelGroup)
        }
    }

    pub fn conditional(id: impl Into<String>, condition: Condition) -> Self {
        Self {
            condition: Some(condition),
            ..Self::bare(id, NodeKind::Conditional)
        }
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimate = Some(estimate);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Declare dependencies; the graph converts them into edges on insert.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge: `to` depends on `from`.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub condition: Option<Condition>,
}

// ---------------------------------------------------------------------------
// WorkflowStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conditions_require_upstream_success() {
        let failed = NodeResult::failure("boom");
        assert!(!Condition::Always.evaluate(&failed));
        assert!(Condition::Always.evaluate(&NodeResult::success(json!(null))));
        assert!(!Condition::Succeeded.evaluate(&failed));
        assert!(!Condition::OutputContains { text: "boom".into() }.evaluate(&failed));
    }

    #[test]
    fn conditions_inspect_output() {
        let result = NodeResult::success(json!({ "verdict": "approve", "score": 9 }));

        assert!(Condition::Succeeded.evaluate(&result));
        assert!(Condition::OutputContains { text: "approve".into() }.evaluate(&result));
        let score = Condition::FieldEquals { pointer: "/score".into(), value: json!(9) };
        assert!(score.evaluate(&result));
        let missing = Condition::FieldEquals { pointer: "/missing".into(), value: json!(9) };
        assert!(!missing.evaluate(&result));
        assert!(!Condition::OutputEquals { value: json!("approve") }.evaluate(&result));

        let text = NodeResult::success(json!("ship it"));
        assert!(Condition::OutputEquals { value: json!("ship it") }.evaluate(&text));
    }

    #[test]
    fn condition_serialization_is_tagged() {
        let cond = Condition::OutputContains { text: "yes".into() };
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json, json!({ "type": "output_contains", "text": "yes" }));
        let parsed: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, cond);
    }

    #[test]
    fn builders_fill_kind_specific_fields() {
        let task = Node::task("draft", "writer", "write a draft").depends_on(["outline"]);
        assert_eq!(task.kind, NodeKind::Task);
        assert_eq!(task.collaborator.as_deref(), Some("writer"));
        assert!(task.depends_on.contains("outline"));

        let group = Node::parallel_group("fanout", ["a", "b"]);
        assert_eq!(group.kind, NodeKind::ParallelGroup);
        assert_eq!(group.children.len(), 2);
        assert!(group.collaborator.is_none());
    }
}
