//! Collaborator-level error type.

use thiserror::Error;

/// Errors escaping a collaborator's `execute` call.
///
/// These are distinct from a reported failure: a collaborator that ran and
/// decided the work failed returns `Ok(NodeResult::failure(..))`. An `Err`
/// means the call itself broke, and the engine treats it as an executor fault:
/// - `Crashed`   — unexpected breakage; triggers checkpoint recovery.
/// - `Cancelled` — the collaborator observed the cancellation token.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator crashed instead of reporting a structured result.
    #[error("collaborator crashed: {0}")]
    Crashed(String),

    /// The collaborator stopped because the workflow was cancelled.
    #[error("collaborator cancelled")]
    Cancelled,
}
