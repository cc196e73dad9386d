//! `MockCollaborator` — a test double for `Collaborator`.
//!
//! Useful in unit and integration tests where a real agent is either
//! unavailable or irrelevant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Collaborator, CollaboratorError, ExecutionContext, NodeResult};

/// Behaviour injected into `MockCollaborator` at construction time.
pub enum MockBehaviour {
    /// Succeed with a specific JSON value.
    ReturnValue(Value),
    /// Report a structured `failure` result.
    Fail(String),
    /// Return `Err(Crashed)` on every call.
    Crash(String),
    /// Crash on the first call, succeed with the value afterwards.
    CrashOnce(Value),
    /// Panic inside the call.
    Panic(String),
}

/// A mock collaborator that records every call it receives and returns a
/// programmer-specified result.
pub struct MockCollaborator {
    /// Label used in test assertions.
    pub name: String,
    /// What the collaborator will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All payloads seen by this collaborator (in call order).
    pub calls: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockCollaborator {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always reports a `failure` result.
    pub fn failing(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Fail(msg.into()))
    }

    /// Create a mock whose call always errors out.
    pub fn crashing(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Crash(msg.into()))
    }

    /// Create a mock that crashes once and then succeeds with `value`.
    pub fn crashing_once(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::CrashOnce(value))
    }

    /// Create a mock that panics when called.
    pub fn panicking(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Panic(msg.into()))
    }

    /// Sleep for `delay` inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times this collaborator has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Payloads received so far.
    pub fn payloads(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Highest number of calls that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collaborator for MockCollaborator {
    async fn execute(
        &self,
        payload: &str,
        ctx: &ExecutionContext,
    ) -> Result<NodeResult, CollaboratorError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.push(payload.to_owned());
            calls.len()
        };

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let succeed = |v: &Value| {
            // Tag the output with the mock's name so tests can tell which
            // collaborator handled a node.
            let mut out = json!({ "collaborator": self.name, "node": ctx.node_id });
            if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
                for (k, val) in v_obj {
                    out_obj.insert(k.clone(), val.clone());
                }
            }
            NodeResult::success(out)
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(succeed(v)),
            MockBehaviour::Fail(msg) => Ok(NodeResult::failure(msg.clone())),
            MockBehaviour::Crash(msg) => Err(CollaboratorError::Crashed(msg.clone())),
            MockBehaviour::CrashOnce(_) if call_index == 1 => {
                Err(CollaboratorError::Crashed(format!("{} crashed on first call", self.name)))
            }
            MockBehaviour::CrashOnce(v) => Ok(succeed(v)),
            MockBehaviour::Panic(msg) => panic!("{msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeStatus;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4(), "n", Value::Null)
    }

    #[tokio::test]
    async fn returning_mock_tags_output_and_counts_calls() {
        let mock = MockCollaborator::returning("writer", json!({ "words": 3 }));
        let result = mock.execute("write", &ctx()).await.unwrap();

        let output = result.output.unwrap();
        assert_eq!(output["collaborator"], "writer");
        assert_eq!(output["words"], 3);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.payloads(), vec!["write"]);
    }

    #[tokio::test]
    async fn failing_mock_reports_structured_failure() {
        let mock = MockCollaborator::failing("critic", "bad draft");
        let result = mock.execute("review", &ctx()).await.unwrap();
        assert_eq!(result.status, NodeStatus::Failure);
        assert_eq!(result.error.as_deref(), Some("bad draft"));
    }

    #[tokio::test]
    async fn crashing_once_recovers_on_second_call() {
        let mock = MockCollaborator::crashing_once("flaky", json!({}));
        assert!(matches!(
            mock.execute("x", &ctx()).await,
            Err(CollaboratorError::Crashed(_))
        ));
        assert!(mock.execute("x", &ctx()).await.unwrap().is_success());
        assert_eq!(mock.call_count(), 2);
    }
}
