//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::models::ResultMap;

/// Graph-build failures. Always fatal; a workflow that fails validation never
/// reaches execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Two nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNode(String),

    /// An edge endpoint doesn't exist.
    #[error("edge '{from}' -> '{to}' references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    /// A dependency or child id doesn't resolve.
    #[error("node '{node}' references unknown node '{reference}'")]
    UnknownReference { node: String, reference: String },

    /// The graph is not acyclic. The path starts and ends on the same node.
    #[error("workflow graph contains a cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("parallel group '{group}' is invalid: {reason}")]
    InvalidGroup { group: String, reason: String },

    /// A node lacks a field its kind requires.
    #[error("node '{node}' is incomplete: {reason}")]
    IncompleteNode { node: String, reason: String },
}

/// Errors produced by the engine API and the executor.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // ------ Lookup / usage errors ------
    #[error("unknown workflow {0}")]
    UnknownWorkflow(Uuid),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("unknown checkpoint {0}")]
    UnknownCheckpoint(Uuid),

    #[error("no collaborator registered as '{0}'")]
    UnknownCollaborator(String),

    #[error("workflow {0} is running")]
    WorkflowBusy(Uuid),

    // ------ Adjustment errors ------
    /// The node is in flight or already ran in the current pass.
    #[error("node '{0}' has already started in the current run")]
    NodeAlreadyStarted(String),

    #[error("invalid mutation for node '{node_id}': {reason}")]
    InvalidMutation { node_id: String, reason: String },

    // ------ Checkpoint errors ------
    #[error("stage {stage} has not completed (next stage to run is {cursor})")]
    InvalidStage { stage: usize, cursor: usize },

    /// The checkpoint was taken before the graph last changed shape.
    #[error("checkpoint {0} was taken against an older graph")]
    StaleCheckpoint(Uuid),

    /// A snapshot violated the consistent-cut invariant. Never retried.
    #[error("inconsistent checkpoint at node '{node_id}': {reason}")]
    InconsistentCheckpoint { node_id: String, reason: String },

    // ------ Execution errors ------
    /// A collaborator call broke instead of reporting a result, and
    /// checkpoint recovery was not possible.
    #[error("executor fault at node '{node_id}': {message}")]
    ExecutorFault {
        node_id: String,
        message: String,
        partial: ResultMap,
    },

    #[error("workflow {workflow_id} was cancelled")]
    Cancelled { workflow_id: Uuid, partial: ResultMap },
}

impl EngineError {
    /// Results accumulated before a fatal fault or cancellation.
    pub fn partial_results(&self) -> Option<&ResultMap> {
        match self {
            EngineError::ExecutorFault { partial, .. } | EngineError::Cancelled { partial, .. } => {
                Some(partial)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_names_the_path() {
        let err = ValidationError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "workflow graph contains a cycle: a -> b -> a");
    }

    #[test]
    fn partial_results_only_on_runtime_failures() {
        let fault = EngineError::ExecutorFault {
            node_id: "n".into(),
            message: "crash".into(),
            partial: ResultMap::new(),
        };
        assert!(fault.partial_results().is_some());
        assert!(EngineError::UnknownNode("n".into()).partial_results().is_none());
    }
}
