//! `EchoCollaborator` — a built-in collaborator that reflects its input.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{Collaborator, CollaboratorError, ExecutionContext, NodeResult};

/// Succeeds with the payload and the upstream outputs it was given.
///
/// Handy for dry runs of a workflow definition: the result map shows exactly
/// what each node would have received.
#[derive(Debug, Clone, Default)]
pub struct EchoCollaborator {
    delay: Option<Duration>,
}

impl EchoCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` before answering, observing cancellation.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

#[async_trait]
impl Collaborator for EchoCollaborator {
    async fn execute(
        &self,
        payload: &str,
        ctx: &ExecutionContext,
    ) -> Result<NodeResult, CollaboratorError> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => return Err(CollaboratorError::Cancelled),
            }
        }

        debug!(node_id = %ctx.node_id, "echoing payload");

        let upstream: serde_json::Map<String, Value> = ctx
            .upstream
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(NodeResult::success(json!({
            "node": ctx.node_id,
            "payload": payload,
            "upstream": upstream,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn echoes_payload_and_upstream() {
        let mut ctx = ExecutionContext::new(Uuid::new_v4(), "summarize", Value::Null);
        ctx.upstream.insert("fetch".into(), json!("raw text"));

        let result = EchoCollaborator::new().execute("summarize it", &ctx).await.unwrap();

        let output = result.output.unwrap();
        assert_eq!(output["node"], "summarize");
        assert_eq!(output["payload"], "summarize it");
        assert_eq!(output["upstream"]["fetch"], "raw text");
    }

    #[tokio::test]
    async fn delayed_echo_stops_on_cancel() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), "slow", Value::Null);
        ctx.cancel.cancel();

        let result = EchoCollaborator::with_delay(Duration::from_secs(60))
            .execute("never", &ctx)
            .await;
        assert_eq!(result, Err(CollaboratorError::Cancelled));
    }
}
