//! Dynamic adjuster: swap a node's collaborator or payload between stages.
//!
//! The graph shape never changes here, so the plan and every checkpoint
//! stay valid. The executor reads nodes by id at launch time, which is how
//! an adjustment made before a node's stage takes effect.

use std::sync::Arc;

use tracing::info;

use crate::error::EngineError;
use crate::executor::CollaboratorRegistry;
use crate::models::{Node, NodeKind, WorkflowStatus};
use crate::workflow::WorkflowState;

/// Fields to replace on a node. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMutation {
    pub collaborator: Option<String>,
    pub payload: Option<String>,
}

impl NodeMutation {
    pub fn collaborator(id: impl Into<String>) -> Self {
        Self {
            collaborator: Some(id.into()),
            payload: None,
        }
    }

    pub fn payload(payload: impl Into<String>) -> Self {
        Self {
            collaborator: None,
            payload: Some(payload.into()),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.collaborator.is_none() && self.payload.is_none()
    }
}

/// Apply `mutation` to `node_id`, replacing the node copy-on-write.
/// Returns the new version.
///
/// # Errors
/// - [`EngineError::InvalidMutation`] for an empty mutation, or a
///   collaborator change on a node that is not a task.
/// - [`EngineError::UnknownNode`] if the node does not exist.
/// - [`EngineError::NodeAlreadyStarted`] if the node is in flight or already
///   resolved in the running pass.
/// - [`EngineError::UnknownCollaborator`] if the new collaborator is not
///   registered.
pub(crate) fn apply(
    state: &mut WorkflowState,
    registry: &CollaboratorRegistry,
    node_id: &str,
    mutation: &NodeMutation,
) -> Result<Arc<Node>, EngineError> {
    if mutation.is_empty() {
        return Err(EngineError::InvalidMutation {
            node_id: node_id.to_owned(),
            reason: "mutation changes nothing".into(),
        });
    }

    let current = state
        .graph
        .node(node_id)
        .cloned()
        .ok_or_else(|| EngineError::UnknownNode(node_id.to_owned()))?;

    let started = state.in_flight.contains(node_id)
        || (state.status == WorkflowStatus::Running && state.results.contains_key(node_id));
    if started {
        return Err(EngineError::NodeAlreadyStarted(node_id.to_owned()));
    }

    let mut next = Node::clone(&current);
    if let Some(collaborator) = &mutation.collaborator {
        if current.kind != NodeKind::Task {
            return Err(EngineError::InvalidMutation {
                node_id: node_id.to_owned(),
                reason: format!("a {} node has no collaborator", current.kind),
            });
        }
        if !registry.contains_key(collaborator) {
            return Err(EngineError::UnknownCollaborator(collaborator.clone()));
        }
        next.collaborator = Some(collaborator.clone());
    }
    if let Some(payload) = &mutation.payload {
        next.payload = payload.clone();
    }

    let next = Arc::new(next);
    state.graph.replace_node(Node::clone(&next));
    info!(
        node_id,
        collaborator = next.collaborator.as_deref().unwrap_or("-"),
        "node adjusted"
    );
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agents::{EchoCollaborator, NodeResult};
    use serde_json::json;

    fn setup() -> (WorkflowState, CollaboratorRegistry) {
        let mut state = WorkflowState::default();
        state.graph.add_node(Node::task("a", "echo", "first")).unwrap();
        state
            .graph
            .add_node(Node::parallel_group("g", Vec::<String>::new()))
            .unwrap();

        let mut registry = CollaboratorRegistry::new();
        registry.insert("echo".into(), Arc::new(EchoCollaborator::new()));
        registry.insert("backup".into(), Arc::new(EchoCollaborator::new()));
        (state, registry)
    }

    #[test]
    fn swaps_collaborator_and_payload() {
        let (mut state, registry) = setup();
        let before = Arc::clone(state.graph.node("a").unwrap());
        let generation = state.graph.generation();

        let mutation = NodeMutation::collaborator("backup").with_payload("second");
        let after = apply(&mut state, &registry, "a", &mutation).unwrap();

        assert_eq!(after.collaborator.as_deref(), Some("backup"));
        assert_eq!(after.payload, "second");
        // Old readers keep the old version.
        assert_eq!(before.collaborator.as_deref(), Some("echo"));
        assert_eq!(state.graph.generation(), generation);
    }

    #[test]
    fn rejects_bad_mutations() {
        let (mut state, registry) = setup();

        assert!(matches!(
            apply(&mut state, &registry, "a", &NodeMutation::default()),
            Err(EngineError::InvalidMutation { .. })
        ));
        assert!(matches!(
            apply(&mut state, &registry, "zzz", &NodeMutation::payload("x")),
            Err(EngineError::UnknownNode(id)) if id == "zzz"
        ));
        assert!(matches!(
            apply(&mut state, &registry, "a", &NodeMutation::collaborator("nope")),
            Err(EngineError::UnknownCollaborator(id)) if id == "nope"
        ));
        assert!(matches!(
            apply(&mut state, &registry, "g", &NodeMutation::collaborator("echo")),
            Err(EngineError::InvalidMutation { .. })
        ));
    }

    #[test]
    fn rejects_nodes_already_started() {
        let (mut state, registry) = setup();

        state.in_flight.insert("a".into());
        assert!(matches!(
            apply(&mut state, &registry, "a", &NodeMutation::payload("x")),
            Err(EngineError::NodeAlreadyStarted(_))
        ));

        state.in_flight.clear();
        state.status = WorkflowStatus::Running;
        state.results.insert("a".into(), NodeResult::success(json!(1)));
        assert!(matches!(
            apply(&mut state, &registry, "a", &NodeMutation::payload("x")),
            Err(EngineError::NodeAlreadyStarted(_))
        ));

        // Between runs the node may be changed for the next attempt.
        state.status = WorkflowStatus::Failed;
        assert!(apply(&mut state, &registry, "a", &NodeMutation::payload("x")).is_ok());
    }
}
