//! Graph model — nodes and dependency edges for one workflow, plus validation.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the workflow (checked on insert).
//! 2. Every edge must reference existing nodes (checked on insert).
//! 3. Every dependency and child id must resolve.
//! 4. Parallel groups own task children exclusively.
//! 5. The directed graph must be acyclic (three-color DFS).
//!
//! A successful [`Graph::validate`] returns a [`ValidatedGraph`], the only
//! input the planner accepts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::ValidationError;
use crate::models::{Condition, Edge, Node, NodeKind};

/// Dependency map keyed by node id.
pub type DependencyMap = BTreeMap<String, BTreeSet<String>>;

/// In-memory graph of one workflow.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<String, Arc<Node>>,
    edges: Vec<Edge>,
    /// Bumped on every structural change; plans and checkpoints remember it.
    generation: u64,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. Any ids in `node.depends_on` become edges and must
    /// already exist.
    ///
    /// # Errors
    /// - [`ValidationError::DuplicateNode`] if the id is taken.
    /// - [`ValidationError::DanglingEdge`] if a declared dependency is missing.
    pub fn add_node(&mut self, mut node: Node) -> Result<(), ValidationError> {
        if self.nodes.contains_key(&node.id) {
            return Err(ValidationError::DuplicateNode(node.id));
        }
        if let Some(missing) = node.depends_on.iter().find(|d| !self.nodes.contains_key(*d)) {
            return Err(ValidationError::DanglingEdge {
                from: missing.clone(),
                to: node.id.clone(),
                missing: missing.clone(),
            });
        }

        let deps = std::mem::take(&mut node.depends_on);
        let id = node.id.clone();
        self.nodes.insert(id.clone(), Arc::new(node));
        self.generation += 1;

        for dep in deps {
            self.add_edge(dep, id.clone(), None)?;
        }
        Ok(())
    }

    /// Add `from -> to` (so `to` depends on `from`). Re-adding an existing
    /// edge replaces its condition.
    ///
    /// # Errors
    /// - [`ValidationError::DanglingEdge`] if either endpoint is missing.
    /// - [`ValidationError::Cycle`] for a self edge.
    pub fn add_edge(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: Option<Condition>,
    ) -> Result<(), ValidationError> {
        let (from, to) = (from.into(), to.into());

        for endpoint in [&from, &to] {
            if !self.nodes.contains_key(endpoint) {
                return Err(ValidationError::DanglingEdge {
                    from: from.clone(),
                    to: to.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
        if from == to {
            return Err(ValidationError::Cycle(vec![from.clone(), from]));
        }

        match self.edges.iter_mut().find(|e| e.from == from && e.to == to) {
            Some(existing) => existing.condition = condition,
            None => self.edges.push(Edge {
                from: from.clone(),
                to: to.clone(),
                condition,
            }),
        }

        // Copy-on-write: readers holding the previous Arc keep the old node.
        if let Some(target) = self.nodes.get_mut(&to) {
            Arc::make_mut(target).depends_on.insert(from);
        }
        self.generation += 1;
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges pointing at `id`.
    pub fn incoming(&self, id: &str) -> impl Iterator<Item = &Edge> {
        let id = id.to_owned();
        self.edges.iter().filter(move |e| e.to == id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Swap in a new version of an existing node without touching the graph
    /// shape. Returns the previous version.
    pub(crate) fn replace_node(&mut self, node: Node) -> Option<Arc<Node>> {
        let slot = self.nodes.get_mut(&node.id)?;
        Some(std::mem::replace(slot, Arc::new(node)))
    }

    /// Check references, group rules and acyclicity.
    ///
    /// # Errors
    /// The first [`ValidationError`] found.
    pub fn validate(&self) -> Result<ValidatedGraph<'_>, ValidationError> {
        // -------------------------------------------------------------------
        // 1. Every reference resolves, every node is complete
        // -------------------------------------------------------------------
        for node in self.nodes.values() {
            for reference in node.depends_on.iter().chain(node.children.iter()) {
                if !self.nodes.contains_key(reference) {
                    return Err(ValidationError::UnknownReference {
                        node: node.id.clone(),
                        reference: reference.clone(),
                    });
                }
            }
            match node.kind {
                NodeKind::Task if node.collaborator.is_none() => {
                    return Err(ValidationError::IncompleteNode {
                        node: node.id.clone(),
                        reason: "task node has no collaborator".into(),
                    });
                }
                NodeKind::Conditional if node.condition.is_none() => {
                    return Err(ValidationError::IncompleteNode {
                        node: node.id.clone(),
                        reason: "conditional node has no condition".into(),
                    });
                }
                NodeKind::ParallelGroup => {}
                _ if !node.children.is_empty() => {
                    return Err(ValidationError::InvalidGroup {
                        group: node.id.clone(),
                        reason: format!("a {} node cannot have children", node.kind),
                    });
                }
                _ => {}
            }
        }

        // -------------------------------------------------------------------
        // 2. Group ownership
        // -------------------------------------------------------------------
        let owner = self.group_owners()?;

        // -------------------------------------------------------------------
        // 3. Acyclicity, first on the declared edges so the cycle is reported
        //    with the caller's own node names, then on the staged graph
        //    where children are folded into their groups.
        // -------------------------------------------------------------------
        let declared: DependencyMap = self
            .nodes
            .values()
            .map(|n| (n.id.clone(), n.depends_on.clone()))
            .collect();
        if let Some(cycle) = find_cycle(&declared) {
            return Err(ValidationError::Cycle(cycle));
        }

        let dependencies = self.staged_dependencies(&owner);
        if let Some(cycle) = find_cycle(&dependencies) {
            return Err(ValidationError::Cycle(cycle));
        }

        Ok(ValidatedGraph {
            graph: self,
            dependencies,
            owner,
        })
    }

    /// Map each child to its parallel group, enforcing the group rules.
    fn group_owners(&self) -> Result<HashMap<String, String>, ValidationError> {
        let mut owner: HashMap<String, String> = HashMap::new();

        for group in self.nodes.values().filter(|n| n.kind == NodeKind::ParallelGroup) {
            let invalid = |reason: String| ValidationError::InvalidGroup {
                group: group.id.clone(),
                reason,
            };

            if group.children.is_empty() {
                return Err(invalid("group has no children".into()));
            }
            for child_id in &group.children {
                let Some(child) = self.nodes.get(child_id) else {
                    continue;
                };
                if child.kind != NodeKind::Task {
                    return Err(invalid(format!("child '{child_id}' is a {} node", child.kind)));
                }
                if let Some(other) = owner.insert(child_id.clone(), group.id.clone()) {
                    return Err(invalid(format!("child '{child_id}' already belongs to '{other}'")));
                }
                if group.depends_on.contains(child_id) {
                    return Err(invalid(format!("group depends on its own child '{child_id}'")));
                }
                if child.depends_on.contains(&group.id) {
                    return Err(invalid(format!("child '{child_id}' depends on its own group")));
                }
                let sibling = child.depends_on.iter().find(|d| group.children.contains(*d));
                if let Some(sibling) = sibling {
                    return Err(invalid(format!(
                        "child '{child_id}' depends on sibling '{sibling}'"
                    )));
                }
            }
        }
        Ok(owner)
    }

    /// Dependencies between staged nodes: children disappear into their
    /// group, which inherits their dependencies.
    fn staged_dependencies(&self, owner: &HashMap<String, String>) -> DependencyMap {
        let resolve = |id: &String| owner.get(id).unwrap_or(id).clone();

        self.nodes
            .values()
            .filter(|n| !owner.contains_key(&n.id))
            .map(|n| {
                let mut deps: BTreeSet<String> = n.depends_on.iter().map(resolve).collect();
                for child_id in &n.children {
                    if let Some(child) = self.nodes.get(child_id) {
                        deps.extend(child.depends_on.iter().map(resolve));
                    }
                }
                deps.remove(&n.id);
                (n.id.clone(), deps)
            })
            .collect()
    }
}

/// Proof that a graph passed [`Graph::validate`].
#[derive(Debug)]
pub struct ValidatedGraph<'g> {
    graph: &'g Graph,
    dependencies: DependencyMap,
    owner: HashMap<String, String>,
}

impl<'g> ValidatedGraph<'g> {
    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Staged node → staged dependencies.
    pub fn dependencies(&self) -> &DependencyMap {
        &self.dependencies
    }

    /// Group that owns `child`, if any.
    pub fn owner_of(&self, child: &str) -> Option<&str> {
        self.owner.get(child).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-color DFS along edge direction (dependency → dependent). Returns the
/// first cycle found, e.g. `["a", "b", "a"]`.
fn find_cycle(dependencies: &DependencyMap) -> Option<Vec<String>> {
    let mut forward: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (node, deps) in dependencies {
        forward.entry(node.as_str()).or_default();
        for dep in deps {
            forward.entry(dep.as_str()).or_default().push(node.as_str());
        }
    }

    let mut color: HashMap<&str, Color> = forward.keys().map(|&k| (k, Color::White)).collect();
    let mut path: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        forward: &BTreeMap<&'a str, Vec<&'a str>>,
        color: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        color.insert(node, Color::Gray);
        path.push(node);

        for &next in forward.get(node).map(Vec::as_slice).unwrap_or_default() {
            match color.get(next).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| (*s).to_owned()).collect();
                    cycle.push(next.to_owned());
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = visit(next, forward, color, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        color.insert(node, Color::Black);
        None
    }

    for &start in forward.keys() {
        if color.get(start) == Some(&Color::White) {
            if let Some(cycle) = visit(start, &forward, &mut color, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}
