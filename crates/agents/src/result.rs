//! The per-node outcome reported back to the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal status of one node attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    Failure,
    Skipped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Success => write!(f, "success"),
            NodeStatus::Failure => write!(f, "failure"),
            NodeStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of a single node attempt.
///
/// `output` is only set on success and `error` only on failure; a skipped
/// node carries the skip reason in `error` so nothing is dropped silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock time observed for the attempt.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl NodeResult {
    pub fn success(output: Value) -> Self {
        Self {
            status: NodeStatus::Success,
            output: Some(output),
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Failure,
            output: None,
            error: Some(error.into()),
            duration: Duration::ZERO,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Skipped,
            output: None,
            error: Some(reason.into()),
            duration: Duration::ZERO,
        }
    }

    /// Replace the recorded duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Success
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
