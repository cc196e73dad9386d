//! `engine` crate — workflow graphs, staged planning, checkpointed execution
//! and live adjustment of pending nodes.

pub mod adjuster;
pub mod checkpoint;
pub mod definition;
#[allow(clippy::module_inception)]
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod models;
pub mod planner;
mod workflow;

pub use adjuster::NodeMutation;
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use definition::{EdgeDefinition, NodeDefinition, WorkflowDefinition};
pub use engine::Engine;
pub use error::{EngineError, ValidationError};
pub use events::{Event, EventBus, EventName, SubscriptionId};
pub use executor::{CollaboratorRegistry, ExecutorConfig};
pub use graph::{Graph, ValidatedGraph};
pub use models::{Condition, Edge, Node, NodeKind, ResultMap, WorkflowStatus};
pub use planner::{create_execution_plan, ExecutionPlan, Stage};
pub use workflow::WorkflowSummary;
