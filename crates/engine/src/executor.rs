//! Workflow execution engine.
//!
//! `WorkflowExecutor` is the single driving routine of one `execute` call:
//! 1. Builds (or reuses) the plan and picks the starting stage.
//! 2. Per stage: gates each node on its dependencies and edge conditions,
//!    launches the runnable ones concurrently, and waits for all of them.
//! 3. Records results, skips every dependent of a failed node, and takes a
//!    checkpoint in the same critical section.
//! 4. On a collaborator crash, restores the latest checkpoint once and
//!    resumes; a second crash (or no checkpoint) is fatal.
//! 5. Stops at the next stage boundary once the workflow is cancelled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agents::{Collaborator, ExecutionContext, NodeResult};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::{self, Checkpoint, CheckpointStore};
use crate::error::EngineError;
use crate::events::{Event, EventBus, EventName};
use crate::models::{Node, NodeKind, ResultMap, WorkflowStatus};
use crate::planner::ExecutionPlan;
use crate::workflow::{WorkflowSlot, WorkflowState};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Cap on concurrently running collaborator calls per workflow.
    /// `None` launches a whole stage at once.
    pub max_concurrency: Option<usize>,
    /// Time an event handler may take before it is reported as slow.
    pub handler_budget: Duration,
    /// Attempt one checkpoint restore when a collaborator crashes.
    pub recover_from_faults: bool,
    /// Buffer of the event bus's async tap.
    pub event_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            handler_budget: Duration::from_millis(50),
            recover_from_faults: true,
            event_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator registry
// ---------------------------------------------------------------------------

/// Maps collaborator ids to their implementations.
pub type CollaboratorRegistry = HashMap<String, Arc<dyn Collaborator>>;

// ---------------------------------------------------------------------------
// Launch units
// ---------------------------------------------------------------------------

/// Outcome of one collaborator call; `Err` carries a fault message.
type Attempt = Result<NodeResult, String>;

struct Call {
    node_id: String,
    collaborator_id: String,
    collaborator: Option<Arc<dyn Collaborator>>,
    payload: String,
    ctx: ExecutionContext,
}

enum Launch {
    Task(Call),
    Group { group_id: String, children: Vec<Call> },
}

impl Launch {
    fn node_ids(&self) -> Vec<String> {
        match self {
            Launch::Task(call) => vec![call.node_id.clone()],
            Launch::Group { group_id, children } => children
                .iter()
                .map(|c| c.node_id.clone())
                .chain(std::iter::once(group_id.clone()))
                .collect(),
        }
    }
}

enum StageOutcome {
    Completed(Arc<Checkpoint>),
    Cancelled,
    Faulted { node_id: String, message: String },
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

pub(crate) struct WorkflowExecutor<'a> {
    registry: &'a CollaboratorRegistry,
    bus: &'a EventBus,
    checkpoints: &'a CheckpointStore,
    config: &'a ExecutorConfig,
    semaphore: Option<Arc<Semaphore>>,
}

impl<'a> WorkflowExecutor<'a> {
    pub(crate) fn new(
        registry: &'a CollaboratorRegistry,
        bus: &'a EventBus,
        checkpoints: &'a CheckpointStore,
        config: &'a ExecutorConfig,
    ) -> Self {
        let semaphore = config.max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            registry,
            bus,
            checkpoints,
            config,
            semaphore,
        }
    }

    /// Run the workflow from its cursor to the last stage.
    ///
    /// # Errors
    /// Validation failures, fatal executor faults, inconsistent checkpoints
    /// and cancellation. Node failures are not errors; they show up in the
    /// returned map.
    #[instrument(skip_all, fields(workflow_id = %slot.id))]
    pub(crate) async fn run(
        &self,
        slot: &WorkflowSlot,
        input: Value,
    ) -> Result<ResultMap, EngineError> {
        let _driving = slot.run_lock.lock().await;

        let (plan, cancel) = {
            let mut state = slot.state.lock();
            // A restored checkpoint leaves the status pending; anything else
            // at the end of the plan starts over.
            let finished = match &state.plan {
                None => true,
                Some(p) => state.cursor >= p.len() && state.status != WorkflowStatus::Pending,
            };
            if finished {
                state.reset_for_fresh_run();
            }
            let plan = state.ensure_plan()?;
            // Every run gets its own signal, installed together with the
            // running status that `Engine::cancel` checks.
            let cancel = CancellationToken::new();
            *slot.cancel.lock() = cancel.clone();
            state.status = WorkflowStatus::Running;
            (plan, cancel)
        };

        let start = slot.state.lock().cursor;
        info!(
            stages = plan.len(),
            from_stage = start,
            parallelism = plan.parallelism,
            "executing workflow"
        );
        self.publish(
            slot,
            EventName::WorkflowStarted,
            json!({ "from_stage": start, "stages": plan.len() }),
        );

        let mut recovered = false;
        let mut last_checkpoint = slot.state.lock().resumed_from.clone();

        loop {
            let index = slot.state.lock().cursor;
            if index >= plan.len() {
                break;
            }
            if cancel.is_cancelled() {
                return Err(self.finish_cancelled(slot));
            }

            let outcome = match self.run_stage(slot, &plan, index, &input, &cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(stage = index, error = %e, "stage aborted");
                    slot.state.lock().status = WorkflowStatus::Failed;
                    let payload = json!({ "error": e.to_string() });
                    self.publish(slot, EventName::WorkflowFailed, payload);
                    return Err(e);
                }
            };

            match outcome {
                StageOutcome::Completed(checkpoint) => last_checkpoint = Some(checkpoint),
                StageOutcome::Cancelled => return Err(self.finish_cancelled(slot)),
                StageOutcome::Faulted { node_id, message } => {
                    error!(stage = index, node_id = %node_id, message = %message, "executor fault");

                    let candidate = last_checkpoint
                        .clone()
                        .filter(|_| self.config.recover_from_faults && !recovered);
                    let Some(checkpoint) = candidate else {
                        return Err(self.finish_faulted(slot, node_id, message));
                    };

                    {
                        let mut state = slot.state.lock();
                        state.restore(&checkpoint);
                        state.status = WorkflowStatus::Running;
                    }
                    recovered = true;
                    warn!(
                        checkpoint_id = %checkpoint.id,
                        resume_stage = checkpoint.resume_stage(),
                        "recovering from checkpoint"
                    );
                    self.publish(
                        slot,
                        EventName::Recovered,
                        json!({
                            "node_id": node_id,
                            "error": message,
                            "checkpoint_id": checkpoint.id,
                            "resume_stage": checkpoint.resume_stage(),
                        }),
                    );
                }
            }
        }

        let (results, status) = {
            let mut state = slot.state.lock();
            let failed = state.results.values().any(|r| r.status == agents::NodeStatus::Failure);
            state.status = if failed {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Completed
            };
            (state.results.clone(), state.status)
        };

        info!(status = %status, nodes = results.len(), "workflow finished");
        self.publish(
            slot,
            EventName::WorkflowCompleted,
            json!({ "status": status, "nodes": results.len() }),
        );
        Ok(results)
    }

    async fn run_stage(
        &self,
        slot: &WorkflowSlot,
        plan: &ExecutionPlan,
        index: usize,
        input: &Value,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome, EngineError> {
        let stage = &plan.stages[index];
        debug!(stage = index, nodes = ?stage.nodes, "stage started");
        self.publish(
            slot,
            EventName::StageStarted,
            json!({ "stage": index, "nodes": stage.nodes }),
        );

        // ------------------------------------------------------------------
        // Gate and prepare every node of the stage.
        // ------------------------------------------------------------------
        let mut launches: Vec<Launch> = Vec::new();
        let mut started: Vec<String> = Vec::new();
        let mut touched: Vec<String> = Vec::new();
        let mut resolved_inline: Vec<String> = Vec::new();
        {
            let mut state = slot.state.lock();
            for id in &stage.nodes {
                if state.results.contains_key(id) {
                    continue;
                }
                let Some(node) = state.graph.node(id).cloned() else {
                    continue;
                };

                if let Some(reason) = blocked_reason(&state, plan, &node) {
                    debug!(node_id = %id, reason = %reason, "node skipped");
                    let written = state.mark_skipped(&node, &reason);
                    touched.extend(written.iter().cloned());
                    resolved_inline.extend(written);
                    continue;
                }

                match node.kind {
                    NodeKind::Conditional => {
                        let result = resolve_conditional(&state, &node, input);
                        state.results.insert(id.clone(), result);
                        started.push(id.clone());
                        touched.push(id.clone());
                        resolved_inline.push(id.clone());
                    }
                    NodeKind::Task => {
                        let call = self.prepare_call(&state, slot, &node, input, cancel);
                        launches.push(Launch::Task(call));
                    }
                    NodeKind::ParallelGroup => {
                        let children = node
                            .children
                            .iter()
                            .filter_map(|c| state.graph.node(c).cloned())
                            .map(|child| self.prepare_call(&state, slot, &child, input, cancel))
                            .collect();
                        launches.push(Launch::Group {
                            group_id: id.clone(),
                            children,
                        });
                    }
                }
            }

            for launch in &launches {
                let ids = launch.node_ids();
                // Group first, then its children, for node-started.
                if let Some((group, children)) = ids.split_last() {
                    started.push(group.clone());
                    started.extend(children.iter().cloned());
                }
                touched.extend(ids.iter().cloned());
                state.in_flight.extend(ids);
            }
        }

        for id in &started {
            self.publish(slot, EventName::NodeStarted, json!({ "stage": index, "node_id": id }));
        }

        // ------------------------------------------------------------------
        // Launch concurrently and barrier-join.
        // ------------------------------------------------------------------
        let futures = launches.into_iter().map(|launch| {
            let semaphore = self.semaphore.clone();
            async move {
                match launch {
                    Launch::Task(call) => vec![run_call(call, semaphore).await],
                    Launch::Group { group_id, children } => {
                        run_group(group_id, children, semaphore).await
                    }
                }
            }
        });
        let outcomes: Vec<Vec<(String, Attempt)>> = join_all(futures).await;

        // ------------------------------------------------------------------
        // Cancelled mid-stage: discard everything this stage produced.
        // ------------------------------------------------------------------
        if cancel.is_cancelled() {
            let mut state = slot.state.lock();
            for id in outcomes.iter().flatten().map(|(id, _)| id) {
                state.in_flight.remove(id);
            }
            for id in &resolved_inline {
                state.results.remove(id);
            }
            info!(stage = index, "stage results discarded after cancellation");
            return Ok(StageOutcome::Cancelled);
        }

        // ------------------------------------------------------------------
        // Record, cascade and snapshot under one lock.
        // ------------------------------------------------------------------
        let mut fault: Option<(String, String)> = None;
        let mut cascaded: Vec<String> = Vec::new();
        let checkpoint = {
            let mut state = slot.state.lock();
            for (id, attempt) in outcomes.into_iter().flatten() {
                state.in_flight.remove(&id);
                match attempt {
                    Ok(result) => {
                        state.observed.insert(id.clone(), result.duration);
                        state.results.insert(id, result);
                    }
                    Err(message) => {
                        if fault.is_none() {
                            fault = Some((id, message));
                        }
                    }
                }
            }

            if fault.is_none() {
                for id in &stage.nodes {
                    let unsuccessful = state.results.get(id).map_or(false, |r| !r.is_success());
                    if !unsuccessful {
                        continue;
                    }
                    let reason = format!("upstream '{id}' did not succeed");
                    for dependent in plan.transitive_dependents(id) {
                        if state.results.contains_key(&dependent) {
                            continue;
                        }
                        if let Some(node) = state.graph.node(&dependent).cloned() {
                            cascaded.extend(state.mark_skipped(&node, &reason));
                        }
                    }
                }
                let checkpoint =
                    checkpoint::snapshot(slot.id, &state.graph, plan, &state.results, index)?;
                state.cursor = index + 1;
                Some(checkpoint)
            } else {
                None
            }
        };

        let completed: Vec<(String, NodeResult)> = {
            let state = slot.state.lock();
            touched
                .iter()
                .chain(cascaded.iter())
                .filter_map(|id| state.results.get(id).map(|r| (id.clone(), r.clone())))
                .collect()
        };
        for (id, result) in &completed {
            self.publish(slot, EventName::NodeCompleted, node_completed_payload(index, id, result));
        }

        let checkpoint = match (checkpoint, fault) {
            (Some(checkpoint), None) => checkpoint,
            (_, fault) => {
                let (node_id, message) = fault.unwrap_or_default();
                return Ok(StageOutcome::Faulted { node_id, message });
            }
        };

        self.publish(
            slot,
            EventName::StageCompleted,
            json!({ "stage": index, "checkpoint_id": checkpoint.id }),
        );
        let checkpoint = self.checkpoints.append(checkpoint);
        self.publish(
            slot,
            EventName::CheckpointCreated,
            json!({ "checkpoint_id": checkpoint.id, "after_stage": index }),
        );
        debug!(stage = index, checkpoint_id = %checkpoint.id, "stage completed");

        Ok(StageOutcome::Completed(checkpoint))
    }

    fn prepare_call(
        &self,
        state: &WorkflowState,
        slot: &WorkflowSlot,
        node: &Node,
        input: &Value,
        cancel: &CancellationToken,
    ) -> Call {
        let mut ctx = ExecutionContext::new(slot.id, node.id.clone(), input.clone());
        ctx.cancel = cancel.child_token();
        for dep in &node.depends_on {
            if let Some(output) = state.results.get(dep).and_then(|r| r.output.clone()) {
                ctx.upstream.insert(dep.clone(), output);
            }
        }

        let collaborator_id = node.collaborator.clone().unwrap_or_default();
        Call {
            node_id: node.id.clone(),
            collaborator: self.registry.get(&collaborator_id).cloned(),
            collaborator_id,
            payload: node.payload.clone(),
            ctx,
        }
    }

    fn finish_cancelled(&self, slot: &WorkflowSlot) -> EngineError {
        let partial = {
            let mut state = slot.state.lock();
            state.status = WorkflowStatus::Cancelled;
            state.results.clone()
        };

        warn!(resolved = partial.len(), "workflow cancelled");
        self.publish(slot, EventName::WorkflowCancelled, json!({ "resolved": partial.len() }));
        EngineError::Cancelled {
            workflow_id: slot.id,
            partial,
        }
    }

    fn finish_faulted(&self, slot: &WorkflowSlot, node_id: String, message: String) -> EngineError {
        let partial = {
            let mut state = slot.state.lock();
            state.status = WorkflowStatus::Failed;
            state.results.clone()
        };

        error!(node_id = %node_id, "executor fault is fatal: no checkpoint to recover from");
        self.publish(
            slot,
            EventName::WorkflowFailed,
            json!({ "node_id": node_id, "error": message }),
        );
        EngineError::ExecutorFault {
            node_id,
            message,
            partial,
        }
    }

    fn publish(&self, slot: &WorkflowSlot, name: EventName, payload: Value) {
        self.bus.publish(Event::new(name, slot.id, payload));
    }
}

// ---------------------------------------------------------------------------
// Gating
// ---------------------------------------------------------------------------

/// Why `node` must not run, or `None` if every dependency succeeded and every
/// incoming edge condition holds.
fn blocked_reason(state: &WorkflowState, plan: &ExecutionPlan, node: &Node) -> Option<String> {
    for dep in plan.dependencies(&node.id) {
        match state.results.get(dep) {
            Some(result) if result.is_success() => {}
            Some(result) => {
                return Some(format!("dependency '{dep}' resolved to {}", result.status));
            }
            None => return Some(format!("dependency '{dep}' has no result")),
        }
    }

    let targets: Vec<&String> = std::iter::once(&node.id).chain(node.children.iter()).collect();
    for edge in state.graph.edges().iter().filter(|e| targets.contains(&&e.to)) {
        let Some(condition) = &edge.condition else {
            continue;
        };
        let holds = state
            .results
            .get(&edge.from)
            .map_or(false, |upstream| condition.evaluate(upstream));
        if !holds {
            return Some(format!("condition on edge '{}' -> '{}' not met", edge.from, edge.to));
        }
    }
    None
}

/// A conditional node passes when its condition holds for every dependency,
/// or for the run context when it has none.
fn resolve_conditional(state: &WorkflowState, node: &Node, input: &Value) -> NodeResult {
    let Some(condition) = &node.condition else {
        return NodeResult::failure("conditional node has no condition");
    };

    let passed = if node.depends_on.is_empty() {
        condition.evaluate_value(input)
    } else {
        node.depends_on
            .iter()
            .all(|dep| state.results.get(dep).map_or(false, |r| condition.evaluate(r)))
    };

    if passed {
        NodeResult::success(Value::Bool(true))
    } else {
        NodeResult::skipped(format!("condition of '{}' not met", node.id))
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

async fn run_call(call: Call, semaphore: Option<Arc<Semaphore>>) -> (String, Attempt) {
    let Call {
        node_id,
        collaborator_id,
        collaborator,
        payload,
        ctx,
    } = call;

    let Some(collaborator) = collaborator else {
        warn!(node_id = %node_id, collaborator = %collaborator_id, "collaborator not registered");
        let message = format!("no collaborator registered as '{collaborator_id}'");
        return (node_id, Ok(NodeResult::failure(message)));
    };

    let _permit = match semaphore {
        Some(semaphore) => match semaphore.acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(e) => return (node_id, Err(e.to_string())),
        },
        None => None,
    };

    let started = Instant::now();
    // Spawned so a panicking collaborator surfaces as a JoinError.
    let joined = tokio::spawn(async move { collaborator.execute(&payload, &ctx).await }).await;
    let elapsed = started.elapsed();

    let attempt = match joined {
        Ok(Ok(result)) => Ok(result.with_duration(elapsed)),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) if e.is_panic() => Err(format!("collaborator '{collaborator_id}' panicked")),
        Err(e) => Err(e.to_string()),
    };
    (node_id, attempt)
}

/// Run every child concurrently. Children come first in the returned list,
/// the group's own result last.
async fn run_group(
    group_id: String,
    children: Vec<Call>,
    semaphore: Option<Arc<Semaphore>>,
) -> Vec<(String, Attempt)> {
    let mut attempts: Vec<(String, Attempt)> =
        join_all(children.into_iter().map(|c| run_call(c, semaphore.clone()))).await;

    let fault = attempts.iter().find_map(|(id, a)| a.as_ref().err().map(|e| (id, e)));
    let group_attempt = match fault {
        Some((child, message)) => Err(format!("child '{child}' faulted: {message}")),
        None => {
            let mut outputs = Map::new();
            let mut failed = Vec::new();
            let mut longest = Duration::ZERO;
            let succeeded = attempts.iter().filter_map(|(id, a)| a.as_ref().ok().map(|r| (id, r)));
            for (id, result) in succeeded {
                longest = longest.max(result.duration);
                match (&result.output, result.is_success()) {
                    (Some(output), true) => {
                        outputs.insert(id.clone(), output.clone());
                    }
                    (None, true) => {
                        outputs.insert(id.clone(), Value::Null);
                    }
                    _ => failed.push(id.as_str()),
                }
            }
            let result = if failed.is_empty() {
                NodeResult::success(Value::Object(outputs))
            } else {
                NodeResult::failure(format!("children failed: {}", failed.join(", ")))
            };
            Ok(result.with_duration(longest))
        }
    };

    attempts.push((group_id, group_attempt));
    attempts
}

fn node_completed_payload(stage: usize, id: &str, result: &NodeResult) -> Value {
    json!({
        "stage": stage,
        "node_id": id,
        "status": result.status,
        "error": result.error,
        "duration_ms": result.duration.as_millis() as u64,
    })
}
