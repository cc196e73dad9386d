//! The `Collaborator` trait — the contract every agent must fulfil.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{CollaboratorError, NodeResult};

/// Context handed to a collaborator for one node attempt.
///
/// Defined here (in the agents crate) so both the engine and individual
/// collaborator implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the workflow the node belongs to.
    pub workflow_id: Uuid,
    /// ID of the node being executed.
    pub node_id: String,
    /// Caller-supplied context for the whole run.
    pub input: Value,
    /// Outputs of the node's successful dependencies, keyed by node id.
    pub upstream: HashMap<String, Value>,
    /// Fires when the workflow is cancelled. Collaborators that can stop early
    /// should watch it; the engine never aborts a running call itself.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(workflow_id: Uuid, node_id: impl Into<String>, input: Value) -> Self {
        Self {
            workflow_id,
            node_id: node_id.into(),
            input,
            upstream: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// The unit that actually performs a node's work.
///
/// Implementations are opaque to the engine: it hands over the node's payload
/// and context and records whatever comes back. Timeouts are the
/// collaborator's responsibility.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Run `payload` and report a structured result.
    ///
    /// Return `Ok` with a `failure` result for ordinary task failures; reserve
    /// `Err` for breakage the engine should treat as a fault.
    async fn execute(
        &self,
        payload: &str,
        ctx: &ExecutionContext,
    ) -> Result<NodeResult, CollaboratorError>;
}
