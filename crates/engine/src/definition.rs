//! Serde model of a workflow file.
//!
//! ```json
//! {
//!   "description": "nightly report",
//!   "nodes": [
//!     { "id": "fetch", "collaborator": "echo", "payload": "pull data" },
//!     { "id": "render", "collaborator": "echo", "depends_on": ["fetch"], "estimate_ms": 200 }
//!   ],
//!   "edges": [
//!     { "from": "fetch", "to": "render", "condition": { "type": "succeeded" } }
//!   ]
//! }
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{Condition, Node, NodeKind};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    /// Edges beyond those implied by `depends_on`, typically conditional.
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

impl WorkflowDefinition {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub collaborator: Option<String>,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub children: BTreeSet<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub estimate_ms: Option<u64>,
}

impl NodeDefinition {
    /// The node without its dependencies; those are added as edges once
    /// every node exists, so definition order does not matter.
    pub fn to_node(&self) -> Node {
        Node {
            id: self.id.clone(),
            kind: self.kind,
            collaborator: self.collaborator.clone(),
            payload: self.payload.clone(),
            depends_on: BTreeSet::new(),
            children: self.children.clone(),
            condition: self.condition.clone(),
            estimate: self.estimate_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_defaults() {
        let def = WorkflowDefinition::from_json(
            r#"{
                "nodes": [
                    { "id": "a", "collaborator": "echo" },
                    { "id": "g", "kind": "parallel_group", "children": ["a"] },
                    { "id": "c", "kind": "conditional", "depends_on": ["g"],
                      "condition": { "type": "output_contains", "text": "ok" } }
                ],
                "edges": [ { "from": "g", "to": "c" } ]
            }"#,
        )
        .unwrap();

        assert_eq!(def.description, "");
        assert_eq!(def.nodes[0].kind, NodeKind::Task);
        assert_eq!(def.nodes[1].kind, NodeKind::ParallelGroup);
        assert_eq!(
            def.nodes[2].condition,
            Some(Condition::OutputContains { text: "ok".into() })
        );
        assert_eq!(def.edges[0].condition, None);
    }

    #[test]
    fn to_node_defers_dependencies() {
        let def = NodeDefinition {
            id: "b".into(),
            kind: NodeKind::Task,
            collaborator: Some("echo".into()),
            payload: "work".into(),
            depends_on: ["a".to_string()].into(),
            children: BTreeSet::new(),
            condition: None,
            estimate_ms: Some(250),
        };

        let node = def.to_node();
        assert!(node.depends_on.is_empty());
        assert_eq!(node.estimate, Some(Duration::from_millis(250)));
        assert_eq!(node.collaborator.as_deref(), Some("echo"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let json = r#"{ "nodes": [ { "id": "a", "kind": "loop" } ] }"#;
        assert!(WorkflowDefinition::from_json(json).is_err());
    }
}
