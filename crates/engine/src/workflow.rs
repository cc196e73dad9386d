//! Per-workflow state owned by the engine.
//!
//! The live graph, results and stage cursor sit behind one mutex. Only the
//! executor's driving routine and the adjuster write to them; everything
//! else reads snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use agents::NodeResult;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::error::ValidationError;
use crate::graph::Graph;
use crate::models::{Node, ResultMap, WorkflowStatus};
use crate::planner::{create_execution_plan, ExecutionPlan};

pub(crate) struct WorkflowSlot {
    pub(crate) id: Uuid,
    pub(crate) description: String,
    pub(crate) state: Mutex<WorkflowState>,
    /// Held for the whole of an `execute` call: one driving routine at a time.
    pub(crate) run_lock: tokio::sync::Mutex<()>,
    pub(crate) cancel: Mutex<CancellationToken>,
}

impl WorkflowSlot {
    pub(crate) fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            state: Mutex::new(WorkflowState::default()),
            run_lock: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }
}

pub(crate) struct WorkflowState {
    pub(crate) graph: Graph,
    pub(crate) plan: Option<Arc<ExecutionPlan>>,
    pub(crate) results: ResultMap,
    /// Index of the next stage to run.
    pub(crate) cursor: usize,
    pub(crate) status: WorkflowStatus,
    pub(crate) in_flight: HashSet<String>,
    /// Durations measured on earlier attempts, fed back into planning.
    pub(crate) observed: HashMap<String, Duration>,
    /// Checkpoint the current pass resumed from, if any.
    pub(crate) resumed_from: Option<Arc<Checkpoint>>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            graph: Graph::new(),
            plan: None,
            results: ResultMap::new(),
            cursor: 0,
            status: WorkflowStatus::Pending,
            in_flight: HashSet::new(),
            observed: HashMap::new(),
            resumed_from: None,
        }
    }
}

impl WorkflowState {
    /// Current plan, rebuilt if missing or built from an older graph.
    pub(crate) fn ensure_plan(&mut self) -> Result<Arc<ExecutionPlan>, ValidationError> {
        if let Some(plan) = &self.plan {
            if plan.generation() == self.graph.generation() {
                return Ok(Arc::clone(plan));
            }
        }
        let plan = Arc::new(create_execution_plan(&self.graph.validate()?, &self.observed));
        self.plan = Some(Arc::clone(&plan));
        Ok(plan)
    }

    /// The graph changed shape: stage placement and results no longer apply.
    pub(crate) fn reset_for_new_shape(&mut self) {
        self.plan = None;
        self.results.clear();
        self.cursor = 0;
        self.status = WorkflowStatus::Pending;
        self.resumed_from = None;
    }

    /// Start the next pass from stage 0.
    pub(crate) fn reset_for_fresh_run(&mut self) {
        // Dropping the plan lets observed durations reshape the estimates.
        self.plan = None;
        self.results.clear();
        self.cursor = 0;
        self.resumed_from = None;
    }

    pub(crate) fn restore(&mut self, checkpoint: &Arc<Checkpoint>) {
        self.results = checkpoint.results().clone();
        self.cursor = checkpoint.resume_stage();
        self.status = WorkflowStatus::Pending;
        self.resumed_from = Some(Arc::clone(checkpoint));
    }

    /// Record `node` (and a group's children) as skipped. Returns the ids
    /// written, children first.
    pub(crate) fn mark_skipped(&mut self, node: &Node, reason: &str) -> Vec<String> {
        let mut written = Vec::new();
        for child in &node.children {
            if !self.results.contains_key(child) {
                self.results.insert(child.clone(), NodeResult::skipped(reason));
                written.push(child.clone());
            }
        }
        self.results.insert(node.id.clone(), NodeResult::skipped(reason));
        written.push(node.id.clone());
        written
    }
}

/// Read-only view of a workflow.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub description: String,
    pub status: WorkflowStatus,
    pub nodes: usize,
    /// `None` until a plan has been built.
    pub stages: Option<usize>,
    pub next_stage: usize,
    pub resolved: usize,
    pub checkpoints: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_is_cached_until_the_graph_changes() {
        let mut state = WorkflowState::default();
        state.graph.add_node(Node::task("a", "mock", "a")).unwrap();

        let first = state.ensure_plan().unwrap();
        let again = state.ensure_plan().unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        state.graph.add_node(Node::task("b", "mock", "b")).unwrap();
        let rebuilt = state.ensure_plan().unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert_eq!(rebuilt.stages[0].nodes, vec!["a", "b"]);
    }

    #[test]
    fn skipping_a_group_skips_its_children() {
        let mut state = WorkflowState::default();
        let group = Node::parallel_group("g", ["c1", "c2"]);

        let written = state.mark_skipped(&group, "upstream failed");

        assert_eq!(written, vec!["c1", "c2", "g"]);
        assert!(state.results.values().all(|r| r.status == agents::NodeStatus::Skipped));
    }
}
