//! `agents` crate — the contract between the engine and the units that do the work.
//!
//! Every collaborator (an LLM-backed agent, a tool runner, a test double) must
//! implement [`Collaborator`]. The engine only ever sees this trait object and
//! the [`NodeResult`] it reports.

pub mod error;
pub mod result;
pub mod traits;
pub mod echo;
pub mod fail;
pub mod mock;

pub use error::CollaboratorError;
pub use result::{NodeResult, NodeStatus};
pub use traits::{Collaborator, ExecutionContext};
pub use echo::EchoCollaborator;
pub use fail::FailingCollaborator;
