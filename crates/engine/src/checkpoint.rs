//! Checkpoint store — per-workflow, append-only, in-memory.
//!
//! A checkpoint taken after stage `k` holds the result of every node placed
//! in stages `0..=k`. It must be a consistent cut:
//! - every node in the snapshot has all of its dependencies in the snapshot,
//! - a `success` node has only `success` dependencies,
//! - no node of stages `0..=k` is missing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::EngineError;
use crate::graph::Graph;
use crate::models::ResultMap;
use crate::planner::ExecutionPlan;

/// Immutable snapshot of a workflow's resolved results.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Stage index the snapshot was taken after.
    pub after_stage: usize,
    /// Graph generation at snapshot time.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    results: Arc<ResultMap>,
}

impl Checkpoint {
    pub fn results(&self) -> &ResultMap {
        &self.results
    }

    /// Stage the executor resumes at after restoring this checkpoint.
    pub fn resume_stage(&self) -> usize {
        self.after_stage + 1
    }
}

/// Build a checkpoint from the live result map.
///
/// # Errors
/// [`EngineError::InconsistentCheckpoint`] if the cut is not consistent. That
/// only happens when the executor itself misbehaved, so it is never retried.
pub fn snapshot(
    workflow_id: Uuid,
    graph: &Graph,
    plan: &ExecutionPlan,
    live: &ResultMap,
    after_stage: usize,
) -> Result<Checkpoint, EngineError> {
    let mut results = ResultMap::new();
    for node in graph.nodes() {
        let Some(stage) = plan.stage_of(&node.id) else {
            continue;
        };
        if stage > after_stage {
            continue;
        }
        match live.get(&node.id) {
            Some(result) => {
                results.insert(node.id.clone(), result.clone());
            }
            None => {
                return Err(EngineError::InconsistentCheckpoint {
                    node_id: node.id.clone(),
                    reason: format!("stage {stage} node has no result"),
                });
            }
        }
    }

    verify_consistent_cut(graph, &results)?;

    Ok(Checkpoint {
        id: Uuid::new_v4(),
        workflow_id,
        after_stage,
        generation: plan.generation(),
        created_at: Utc::now(),
        results: Arc::new(results),
    })
}

/// Check the dependency half of the consistent-cut invariant.
pub fn verify_consistent_cut(graph: &Graph, results: &ResultMap) -> Result<(), EngineError> {
    for (node_id, result) in results {
        let node = graph
            .node(node_id)
            .ok_or_else(|| EngineError::InconsistentCheckpoint {
                node_id: node_id.clone(),
                reason: "node is not part of the graph".into(),
            })?;

        for dep in &node.depends_on {
            match results.get(dep) {
                None => {
                    return Err(EngineError::InconsistentCheckpoint {
                        node_id: node_id.clone(),
                        reason: format!("dependency '{dep}' is not in the snapshot"),
                    });
                }
                Some(dep_result) if result.is_success() && !dep_result.is_success() => {
                    return Err(EngineError::InconsistentCheckpoint {
                        node_id: node_id.clone(),
                        reason: format!(
                            "succeeded although dependency '{dep}' is {}",
                            dep_result.status
                        ),
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Append-only checkpoint lists keyed by workflow id.
///
/// Read-mostly: lookups take a shared lock and hand out `Arc`s.
#[derive(Debug, Default)]
pub struct CheckpointStore {
    inner: RwLock<HashMap<Uuid, Vec<Arc<Checkpoint>>>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, checkpoint: Checkpoint) -> Arc<Checkpoint> {
        let checkpoint = Arc::new(checkpoint);
        self.inner
            .write()
            .entry(checkpoint.workflow_id)
            .or_default()
            .push(Arc::clone(&checkpoint));
        checkpoint
    }

    pub fn get(&self, workflow_id: Uuid, checkpoint_id: Uuid) -> Option<Arc<Checkpoint>> {
        self.inner
            .read()
            .get(&workflow_id)?
            .iter()
            .find(|c| c.id == checkpoint_id)
            .cloned()
    }

    /// Most recently appended checkpoint.
    pub fn latest(&self, workflow_id: Uuid) -> Option<Arc<Checkpoint>> {
        self.inner.read().get(&workflow_id)?.last().cloned()
    }

    /// All checkpoints in append order.
    pub fn list(&self, workflow_id: Uuid) -> Vec<Arc<Checkpoint>> {
        self.inner
            .read()
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_workflow(&self, workflow_id: Uuid) {
        self.inner.write().remove(&workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Node;
    use crate::planner::create_execution_plan;
    use agents::NodeResult;
    use serde_json::json;

    fn chain() -> Graph {
        // a → b → c
        let mut g = Graph::new();
        for id in ["a", "b", "c"] {
            g.add_node(Node::task(id, "mock", id)).unwrap();
        }
        g.add_edge("a", "b", None).unwrap();
        g.add_edge("b", "c", None).unwrap();
        g
    }

    fn plan(g: &Graph) -> ExecutionPlan {
        create_execution_plan(&g.validate().unwrap(), &HashMap::new())
    }

    #[test]
    fn snapshot_keeps_only_completed_stages() {
        let g = chain();
        let plan = plan(&g);
        let mut live = ResultMap::new();
        live.insert("a".into(), NodeResult::failure("boom"));
        live.insert("b".into(), NodeResult::skipped("upstream failed"));
        live.insert("c".into(), NodeResult::skipped("upstream failed"));

        let cp = snapshot(Uuid::new_v4(), &g, &plan, &live, 0).unwrap();
        assert_eq!(cp.results().keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(cp.resume_stage(), 1);
    }

    #[test]
    fn missing_stage_result_is_inconsistent() {
        let g = chain();
        let plan = plan(&g);
        let mut live = ResultMap::new();
        live.insert("a".into(), NodeResult::success(json!(1)));

        assert!(matches!(
            snapshot(Uuid::new_v4(), &g, &plan, &live, 1),
            Err(EngineError::InconsistentCheckpoint { node_id, .. }) if node_id == "b"
        ));
    }

    #[test]
    fn success_after_failed_dependency_is_inconsistent() {
        let g = chain();
        let mut results = ResultMap::new();
        results.insert("a".into(), NodeResult::failure("boom"));
        results.insert("b".into(), NodeResult::success(json!(2)));

        assert!(matches!(
            verify_consistent_cut(&g, &results),
            Err(EngineError::InconsistentCheckpoint { node_id, .. }) if node_id == "b"
        ));
    }

    #[test]
    fn dependency_outside_snapshot_is_inconsistent() {
        let g = chain();
        let mut results = ResultMap::new();
        results.insert("c".into(), NodeResult::skipped("x"));
        assert!(verify_consistent_cut(&g, &results).is_err());
    }

    #[test]
    fn store_appends_per_workflow() {
        let g = chain();
        let plan = plan(&g);
        let store = CheckpointStore::new();
        let wf = Uuid::new_v4();
        let mut live = ResultMap::new();
        live.insert("a".into(), NodeResult::success(json!(1)));

        let first = store.append(snapshot(wf, &g, &plan, &live, 0).unwrap());
        live.insert("b".into(), NodeResult::success(json!(2)));
        let second = store.append(snapshot(wf, &g, &plan, &live, 1).unwrap());

        assert_eq!(store.list(wf).len(), 2);
        assert_eq!(store.latest(wf).unwrap().id, second.id);
        assert_eq!(store.get(wf, first.id).unwrap().after_stage, 0);
        assert!(store.latest(Uuid::new_v4()).is_none());

        store.remove_workflow(wf);
        assert!(store.list(wf).is_empty());
    }
}
