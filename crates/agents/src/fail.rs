//! `FailingCollaborator` — a built-in collaborator that always reports failure.

use async_trait::async_trait;
use tracing::debug;

use crate::{Collaborator, CollaboratorError, ExecutionContext, NodeResult};

/// Answers every call with a failure result carrying a fixed message.
///
/// A failure is an ordinary node outcome, not a fault: dependents are skipped
/// and the run carries on. Useful for exercising skip cascades from a
/// workflow definition.
#[derive(Debug, Clone)]
pub struct FailingCollaborator {
    message: String,
}

impl FailingCollaborator {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Default for FailingCollaborator {
    fn default() -> Self {
        Self::new("failed")
    }
}

#[async_trait]
impl Collaborator for FailingCollaborator {
    async fn execute(
        &self,
        _payload: &str,
        ctx: &ExecutionContext,
    ) -> Result<NodeResult, CollaboratorError> {
        debug!(node_id = %ctx.node_id, message = %self.message, "reporting failure");
        Ok(NodeResult::failure(self.message.clone()))
    }
}
