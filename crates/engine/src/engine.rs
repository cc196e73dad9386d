//! `Engine` facade: the public entry point a controller talks to.
//!
//! Holds the collaborator registry, the event bus, the checkpoint store and
//! one slot per workflow. Every call names its workflow by id.

use std::collections::HashMap;
use std::sync::Arc;

use agents::Collaborator;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adjuster::{self, NodeMutation};
use crate::checkpoint::{self, Checkpoint, CheckpointStore};
use crate::definition::WorkflowDefinition;
use crate::error::EngineError;
use crate::events::{Event, EventBus, EventName, SubscriptionId};
use crate::executor::{CollaboratorRegistry, ExecutorConfig, WorkflowExecutor};
use crate::models::{Condition, Node, ResultMap, WorkflowStatus};
use crate::planner::ExecutionPlan;
use crate::workflow::{WorkflowSlot, WorkflowSummary};

pub struct Engine {
    registry: CollaboratorRegistry,
    config: ExecutorConfig,
    bus: EventBus,
    checkpoints: CheckpointStore,
    workflows: RwLock<HashMap<Uuid, Arc<WorkflowSlot>>>,
}

impl Engine {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            registry: CollaboratorRegistry::new(),
            bus: EventBus::new(config.event_capacity, config.handler_budget),
            checkpoints: CheckpointStore::new(),
            workflows: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Register a collaborator under `id`, replacing any previous one.
    pub fn register(&mut self, id: impl Into<String>, collaborator: Arc<dyn Collaborator>) {
        self.registry.insert(id.into(), collaborator);
    }

    pub fn with_collaborator<C>(mut self, id: impl Into<String>, collaborator: C) -> Self
    where
        C: Collaborator + 'static,
    {
        self.register(id, Arc::new(collaborator));
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.bus.subscribe(name, handler)
    }

    // -----------------------------------------------------------------------
    // Graph building
    // -----------------------------------------------------------------------

    pub fn create_workflow(&self, description: impl Into<String>) -> Uuid {
        let slot = Arc::new(WorkflowSlot::new(description));
        let id = slot.id;
        self.workflows.write().insert(id, slot);
        info!(workflow_id = %id, "workflow created");
        id
    }

    /// # Errors
    /// [`EngineError::WorkflowBusy`] while the workflow runs, or the graph's
    /// [`ValidationError`](crate::ValidationError).
    pub fn add_node(&self, workflow_id: Uuid, node: Node) -> Result<(), EngineError> {
        let slot = self.slot(workflow_id)?;
        let Ok(_idle) = slot.run_lock.try_lock() else {
            return Err(EngineError::WorkflowBusy(workflow_id));
        };
        let mut state = slot.state.lock();
        state.graph.add_node(node)?;
        state.reset_for_new_shape();
        Ok(())
    }

    /// Add `from -> to`: `to` depends on `from`. With a condition, `to` only
    /// runs when the condition holds for `from`'s result.
    pub fn add_edge(
        &self,
        workflow_id: Uuid,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: Option<Condition>,
    ) -> Result<(), EngineError> {
        let slot = self.slot(workflow_id)?;
        let Ok(_idle) = slot.run_lock.try_lock() else {
            return Err(EngineError::WorkflowBusy(workflow_id));
        };
        let mut state = slot.state.lock();
        state.graph.add_edge(from, to, condition)?;
        state.reset_for_new_shape();
        Ok(())
    }

    /// Build a workflow from a parsed definition. Nothing is left behind if
    /// the definition is invalid.
    pub fn load_definition(&self, definition: &WorkflowDefinition) -> Result<Uuid, EngineError> {
        let id = self.create_workflow(definition.description.clone());
        match self.populate(id, definition) {
            Ok(()) => Ok(id),
            Err(e) => {
                self.remove_workflow(id);
                Err(e)
            }
        }
    }

    fn populate(&self, id: Uuid, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        for node in &definition.nodes {
            self.add_node(id, node.to_node())?;
        }
        for node in &definition.nodes {
            for dep in &node.depends_on {
                self.add_edge(id, dep.clone(), node.id.clone(), None)?;
            }
        }
        for edge in &definition.edges {
            self.add_edge(id, edge.from.clone(), edge.to.clone(), edge.condition.clone())?;
        }
        self.validate(id)
    }

    pub fn validate(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let slot = self.slot(workflow_id)?;
        let state = slot.state.lock();
        state.graph.validate()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Planning and execution
    // -----------------------------------------------------------------------

    /// Validate and plan the workflow. The plan is cached until the graph
    /// changes shape.
    pub fn create_execution_plan(
        &self,
        workflow_id: Uuid,
    ) -> Result<Arc<ExecutionPlan>, EngineError> {
        let slot = self.slot(workflow_id)?;
        let mut state = slot.state.lock();
        Ok(state.ensure_plan()?)
    }

    /// Run the workflow to completion, resuming at the stage after a restored
    /// checkpoint if there is one.
    #[instrument(skip(self, input))]
    pub async fn execute(&self, workflow_id: Uuid, input: Value) -> Result<ResultMap, EngineError> {
        let slot = self.slot(workflow_id)?;
        WorkflowExecutor::new(&self.registry, &self.bus, &self.checkpoints, &self.config)
            .run(&slot, input)
            .await
    }

    /// Ask a running workflow to stop at the next stage boundary. Returns
    /// `false` if nothing was running.
    pub fn cancel(&self, workflow_id: Uuid) -> Result<bool, EngineError> {
        let slot = self.slot(workflow_id)?;
        let state = slot.state.lock();
        if state.status != WorkflowStatus::Running {
            return Ok(false);
        }
        slot.cancel.lock().cancel();
        drop(state);
        info!(workflow_id = %workflow_id, "cancellation requested");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Snapshot the results of stages `0..=after_stage`.
    ///
    /// # Errors
    /// [`EngineError::InvalidStage`] unless that stage has completed.
    pub fn create_checkpoint(
        &self,
        workflow_id: Uuid,
        after_stage: usize,
    ) -> Result<Arc<Checkpoint>, EngineError> {
        let slot = self.slot(workflow_id)?;
        let checkpoint = {
            let state = slot.state.lock();
            let plan = state
                .plan
                .clone()
                .filter(|p| p.generation() == state.graph.generation())
                .filter(|_| after_stage < state.cursor)
                .ok_or(EngineError::InvalidStage {
                    stage: after_stage,
                    cursor: state.cursor,
                })?;
            checkpoint::snapshot(workflow_id, &state.graph, &plan, &state.results, after_stage)?
        };

        let checkpoint = self.checkpoints.append(checkpoint);
        self.bus.publish(Event::new(
            EventName::CheckpointCreated,
            workflow_id,
            json!({ "checkpoint_id": checkpoint.id, "after_stage": after_stage }),
        ));
        Ok(checkpoint)
    }

    /// Replace the live results with the checkpoint's copy. The next
    /// `execute` resumes at the stage after it.
    ///
    /// # Errors
    /// - [`EngineError::UnknownCheckpoint`] if the id is not one of this
    ///   workflow's checkpoints.
    /// - [`EngineError::WorkflowBusy`] while the workflow runs.
    /// - [`EngineError::StaleCheckpoint`] if the graph changed shape since.
    pub fn restore_from_checkpoint(
        &self,
        workflow_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<(), EngineError> {
        let slot = self.slot(workflow_id)?;
        let checkpoint = self
            .checkpoints
            .get(workflow_id, checkpoint_id)
            .ok_or(EngineError::UnknownCheckpoint(checkpoint_id))?;

        let Ok(_idle) = slot.run_lock.try_lock() else {
            return Err(EngineError::WorkflowBusy(workflow_id));
        };
        {
            let mut state = slot.state.lock();
            if checkpoint.generation != state.graph.generation() {
                warn!(checkpoint_id = %checkpoint_id, "refusing to restore a stale checkpoint");
                return Err(EngineError::StaleCheckpoint(checkpoint_id));
            }
            state.ensure_plan()?;
            state.restore(&checkpoint);
        }

        info!(
            workflow_id = %workflow_id,
            checkpoint_id = %checkpoint_id,
            resume_stage = checkpoint.resume_stage(),
            "checkpoint restored"
        );
        self.bus.publish(Event::new(
            EventName::CheckpointRestored,
            workflow_id,
            json!({ "checkpoint_id": checkpoint_id, "resume_stage": checkpoint.resume_stage() }),
        ));
        Ok(())
    }

    pub fn checkpoints(&self, workflow_id: Uuid) -> Vec<Arc<Checkpoint>> {
        self.checkpoints.list(workflow_id)
    }

    pub fn latest_checkpoint(&self, workflow_id: Uuid) -> Option<Arc<Checkpoint>> {
        self.checkpoints.latest(workflow_id)
    }

    // -----------------------------------------------------------------------
    // Adjustment
    // -----------------------------------------------------------------------

    /// Change a node that has not started yet. Safe to call from an event
    /// handler while the workflow runs.
    pub fn adjust_workflow(
        &self,
        workflow_id: Uuid,
        node_id: &str,
        mutation: NodeMutation,
    ) -> Result<Arc<Node>, EngineError> {
        let slot = self.slot(workflow_id)?;
        let node = {
            let mut state = slot.state.lock();
            adjuster::apply(&mut state, &self.registry, node_id, &mutation)?
        };

        self.bus.publish(Event::new(
            EventName::NodeAdjusted,
            workflow_id,
            json!({
                "node_id": node_id,
                "collaborator": node.collaborator,
                "payload": node.payload,
            }),
        ));
        Ok(node)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, EngineError> {
        Ok(self.slot(workflow_id)?.state.lock().status)
    }

    pub fn results(&self, workflow_id: Uuid) -> Result<ResultMap, EngineError> {
        Ok(self.slot(workflow_id)?.state.lock().results.clone())
    }

    /// The current plan, if one has been built.
    pub fn plan(&self, workflow_id: Uuid) -> Result<Option<Arc<ExecutionPlan>>, EngineError> {
        Ok(self.slot(workflow_id)?.state.lock().plan.clone())
    }

    pub fn node(&self, workflow_id: Uuid, node_id: &str) -> Result<Arc<Node>, EngineError> {
        self.slot(workflow_id)?
            .state
            .lock()
            .graph
            .node(node_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNode(node_id.to_owned()))
    }

    pub fn describe(&self, workflow_id: Uuid) -> Result<WorkflowSummary, EngineError> {
        let slot = self.slot(workflow_id)?;
        let state = slot.state.lock();
        Ok(WorkflowSummary {
            id: slot.id,
            description: slot.description.clone(),
            status: state.status,
            nodes: state.graph.len(),
            stages: state.plan.as_ref().map(|p| p.len()),
            next_stage: state.cursor,
            resolved: state.results.len(),
            checkpoints: self.checkpoints.list(workflow_id).len(),
        })
    }

    pub fn workflows(&self) -> Vec<Uuid> {
        self.workflows.read().keys().copied().collect()
    }

    /// Drop a workflow and its checkpoints. Returns whether it existed.
    pub fn remove_workflow(&self, workflow_id: Uuid) -> bool {
        let removed = self.workflows.write().remove(&workflow_id).is_some();
        if removed {
            self.checkpoints.remove_workflow(workflow_id);
        }
        removed
    }

    fn slot(&self, workflow_id: Uuid) -> Result<Arc<WorkflowSlot>, EngineError> {
        self.workflows
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or(EngineError::UnknownWorkflow(workflow_id))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut collaborators: Vec<&String> = self.registry.keys().collect();
        collaborators.sort();
        f.debug_struct("Engine")
            .field("collaborators", &collaborators)
            .field("workflows", &self.workflows.read().len())
            .field("config", &self.config)
            .finish()
    }
}
