//! Execution planner — turns a validated graph into ordered stages.
//!
//! Each node's stage is its topological level (Kahn's algorithm):
//! `level = 1 + max(level of dependencies)`, sources at level 0. That is the
//! earliest stage the node can run in, and no two nodes of one stage depend
//! on each other.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::graph::{DependencyMap, ValidatedGraph};
use crate::models::NodeKind;

/// Nodes that run concurrently between two barriers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    /// Staged node ids, sorted.
    pub nodes: Vec<String>,
    /// More than one staged node, or a parallel group fanning out.
    pub parallel: bool,
}

/// Ordered stages plus the plan's summary figures.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub stages: Vec<Stage>,
    /// Width of the widest stage.
    pub parallelism: usize,
    /// Sum over stages of the slowest node in the stage.
    #[serde(rename = "estimated_duration_ms", serialize_with = "as_millis")]
    pub estimated_duration: Duration,
    /// Longest source-to-sink chain.
    pub critical_path: Vec<String>,
    #[serde(skip)]
    generation: u64,
    /// Stage index of every node, group children included.
    #[serde(skip)]
    stage_of: HashMap<String, usize>,
    #[serde(skip)]
    dependencies: DependencyMap,
    #[serde(skip)]
    dependents: DependencyMap,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Graph generation the plan was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stage_of(&self, id: &str) -> Option<usize> {
        self.stage_of.get(id).copied()
    }

    /// Staged dependencies of a staged node.
    pub fn dependencies(&self, id: &str) -> impl Iterator<Item = &String> {
        self.dependencies.get(id).into_iter().flatten()
    }

    /// Every staged node reachable downstream of `id`, in id order.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for next in self.dependents.get(current).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}

/// Build the plan for a validated graph.
///
/// `observed` holds durations measured on earlier runs; they take precedence
/// over a node's declared estimate.
pub fn create_execution_plan(
    validated: &ValidatedGraph<'_>,
    observed: &HashMap<String, Duration>,
) -> ExecutionPlan {
    let graph = validated.graph();
    let dependencies = validated.dependencies().clone();

    let mut dependents: DependencyMap = dependencies
        .keys()
        .map(|id| (id.clone(), BTreeSet::new()))
        .collect();
    for (id, deps) in &dependencies {
        for dep in deps {
            dependents.entry(dep.clone()).or_default().insert(id.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Kahn leveling
    // -----------------------------------------------------------------------
    let mut in_degree: BTreeMap<&str, usize> = dependencies
        .iter()
        .map(|(id, deps)| (id.as_str(), deps.len()))
        .collect();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut level: HashMap<&str, usize> = HashMap::with_capacity(dependencies.len());
    let mut topo: Vec<&str> = Vec::with_capacity(dependencies.len());

    while let Some(id) = queue.pop_front() {
        let lvl = dependencies[id]
            .iter()
            .filter_map(|d| level.get(d.as_str()))
            .map(|l| l + 1)
            .max()
            .unwrap_or(0);
        level.insert(id, lvl);
        topo.push(id);

        for next in &dependents[id] {
            if let Some(deg) = in_degree.get_mut(next.as_str()) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(next.as_str());
                }
            }
        }
    }

    let depth = level.values().max().map_or(0, |l| l + 1);
    let mut buckets: Vec<Vec<String>> = vec![Vec::new(); depth];
    for (&id, &lvl) in &level {
        buckets[lvl].push(id.to_owned());
    }
    let stages: Vec<Stage> = buckets
        .into_iter()
        .map(|mut nodes| {
            nodes.sort();
            let fans_out = nodes
                .iter()
                .filter_map(|id| graph.node(id))
                .any(|node| node.kind == NodeKind::ParallelGroup);
            Stage {
                parallel: nodes.len() > 1 || fans_out,
                nodes,
            }
        })
        .collect();

    let mut stage_of: HashMap<String, usize> = HashMap::new();
    for (idx, stage) in stages.iter().enumerate() {
        for id in &stage.nodes {
            stage_of.insert(id.clone(), idx);
            if let Some(node) = graph.node(id) {
                for child in &node.children {
                    stage_of.insert(child.clone(), idx);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Weights, estimate and critical path
    // -----------------------------------------------------------------------
    let weight_of = |id: &str| -> Duration {
        let single = |id: &str| {
            observed
                .get(id)
                .copied()
                .or_else(|| graph.node(id).and_then(|n| n.estimate))
                .unwrap_or(Duration::ZERO)
        };
        let own = single(id);
        graph
            .node(id)
            .map(|n| n.children.iter().map(|c| single(c.as_str())).fold(own, Duration::max))
            .unwrap_or(own)
    };
    let weights: HashMap<&str, Duration> = topo.iter().map(|&id| (id, weight_of(id))).collect();

    let estimated_duration = stages
        .iter()
        .map(|s| {
            s.nodes
                .iter()
                .filter_map(|id| weights.get(id.as_str()).copied())
                .max()
                .unwrap_or(Duration::ZERO)
        })
        .sum();

    let critical_path = critical_path(&topo, &dependencies, &dependents, &weights);
    let parallelism = stages.iter().map(|s| s.nodes.len()).max().unwrap_or(0);

    debug!(
        stages = stages.len(),
        parallelism,
        critical_path = ?critical_path,
        "execution plan built"
    );

    ExecutionPlan {
        stages,
        parallelism,
        estimated_duration,
        critical_path,
        generation: graph.generation(),
        stage_of,
        dependencies,
        dependents,
    }
}

/// Longest path by `(cumulative duration, hop count)`, ties to the lowest id.
fn critical_path(
    topo: &[&str],
    dependencies: &DependencyMap,
    dependents: &DependencyMap,
    weights: &HashMap<&str, Duration>,
) -> Vec<String> {
    // node → (duration, hops, best predecessor)
    let mut best: HashMap<&str, (Duration, usize, Option<&str>)> = HashMap::new();

    for &id in topo {
        let weight = weights.get(id).copied().unwrap_or(Duration::ZERO);
        let mut chosen: Option<(&str, Duration, usize)> = None;
        // Deps iterate in ascending id order; only a strictly longer chain
        // displaces the current choice.
        for dep in &dependencies[id] {
            if let Some(&(dur, hops, _)) = best.get(dep.as_str()) {
                if chosen.map_or(true, |(_, d, h)| (dur, hops) > (d, h)) {
                    chosen = Some((dep.as_str(), dur, hops));
                }
            }
        }
        let entry = match chosen {
            Some((pred, dur, hops)) => (dur + weight, hops + 1, Some(pred)),
            None => (weight, 1, None),
        };
        best.insert(id, entry);
    }

    let mut sinks: Vec<&str> = topo
        .iter()
        .copied()
        .filter(|id| dependents.get(*id).map_or(true, BTreeSet::is_empty))
        .collect();
    sinks.sort_unstable();

    let mut end: Option<(&str, Duration, usize)> = None;
    for sink in sinks {
        if let Some(&(dur, hops, _)) = best.get(sink) {
            if end.map_or(true, |(_, d, h)| (dur, hops) > (d, h)) {
                end = Some((sink, dur, hops));
            }
        }
    }

    let mut path = Vec::new();
    let mut cursor = end.map(|(id, _, _)| id);
    while let Some(id) = cursor {
        path.push(id.to_owned());
        cursor = best.get(id).and_then(|&(_, _, pred)| pred);
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::models::Node;

    fn task(id: &str) -> Node {
        Node::task(id, "mock", id)
    }

    fn build(ids: &[&str], edges: &[(&str, &str)]) -> Graph {
        let mut g = Graph::new();
        for id in ids {
            g.add_node(task(id)).unwrap();
        }
        for (from, to) in edges {
            g.add_edge(*from, *to, None).unwrap();
        }
        g
    }

    fn plan(g: &Graph) -> ExecutionPlan {
        create_execution_plan(&g.validate().unwrap(), &HashMap::new())
    }

    fn stage_ids(plan: &ExecutionPlan) -> Vec<Vec<&str>> {
        plan.stages
            .iter()
            .map(|s| s.nodes.iter().map(String::as_str).collect())
            .collect()
    }

    /// Checks the placement properties on any plan: every node is strictly
    /// after its dependencies, placed at 1 + max(dep stage), and no stage
    /// contains an edge.
    fn assert_well_placed(g: &Graph, plan: &ExecutionPlan) {
        for node in g.nodes() {
            let stage = plan.stage_of(&node.id).unwrap();
            let dep_stages: Vec<usize> = node
                .depends_on
                .iter()
                .map(|d| plan.stage_of(d).unwrap())
                .collect();
            assert!(dep_stages.iter().all(|&d| d < stage), "{} not after deps", node.id);
            assert_eq!(stage, dep_stages.iter().max().map_or(0, |m| m + 1), "{} delayed", node.id);
        }
        for stage in &plan.stages {
            for a in &stage.nodes {
                let node = g.node(a).unwrap();
                assert!(stage.nodes.iter().all(|b| !node.depends_on.contains(b)));
            }
        }
    }

    #[test]
    fn diamond_plans_into_three_stages() {
        let g = build(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let plan = plan(&g);

        assert_eq!(stage_ids(&plan), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert_eq!(plan.parallelism, 2);
        assert_eq!(plan.critical_path, vec!["a", "b", "d"]);
        assert!(!plan.stages[0].parallel);
        assert!(plan.stages[1].parallel);
        assert_well_placed(&g, &plan);
    }

    #[test]
    fn uneven_branches_place_nodes_as_early_as_possible() {
        // a → b → c → e, d → e, f isolated
        let g = build(
            &["a", "b", "c", "d", "e", "f"],
            &[("a", "b"), ("b", "c"), ("c", "e"), ("d", "e")],
        );
        let plan = plan(&g);

        assert_eq!(
            stage_ids(&plan),
            vec![vec!["a", "d", "f"], vec!["b"], vec!["c"], vec!["e"]]
        );
        assert_eq!(plan.parallelism, 3);
        assert_eq!(plan.critical_path, vec!["a", "b", "c", "e"]);
        assert_well_placed(&g, &plan);
    }

    #[test]
    fn critical_path_follows_duration_over_hops() {
        // a(1s) → b(1s) → c(1s) is longer in hops, but x(10s) → c wins.
        let mut g = Graph::new();
        g.add_node(task("a").with_estimate(Duration::from_secs(1))).unwrap();
        g.add_node(task("b").with_estimate(Duration::from_secs(1))).unwrap();
        g.add_node(task("x").with_estimate(Duration::from_secs(10))).unwrap();
        g.add_node(task("c").with_estimate(Duration::from_secs(1))).unwrap();
        g.add_edge("a", "b", None).unwrap();
        g.add_edge("b", "c", None).unwrap();
        g.add_edge("x", "c", None).unwrap();

        let plan = plan(&g);
        assert_eq!(plan.critical_path, vec!["x", "c"]);
        // stage 0: max(a, x) = 10s, stage 1: b = 1s, stage 2: c = 1s
        assert_eq!(plan.estimated_duration, Duration::from_secs(12));
    }

    #[test]
    fn observed_durations_override_estimates() {
        let mut g = Graph::new();
        g.add_node(task("a").with_estimate(Duration::from_secs(5))).unwrap();
        g.add_node(task("b").with_estimate(Duration::from_secs(1))).unwrap();

        let observed = HashMap::from([("a".to_string(), Duration::from_millis(10))]);
        let plan = create_execution_plan(&g.validate().unwrap(), &observed);

        assert_eq!(plan.critical_path, vec!["b"]);
        assert_eq!(plan.estimated_duration, Duration::from_secs(1));
    }

    #[test]
    fn ties_break_on_lowest_sink() {
        let g = build(&["m", "k", "z"], &[]);
        let plan = plan(&g);
        assert_eq!(plan.critical_path, vec!["k"]);
    }

    #[test]
    fn critical_path_is_a_source_to_sink_path() {
        let g = build(
            &["s1", "s2", "m", "t1", "t2"],
            &[("s1", "m"), ("s2", "m"), ("m", "t1"), ("s2", "t2")],
        );
        let plan = plan(&g);
        let path = &plan.critical_path;

        assert!(g.node(&path[0]).unwrap().depends_on.is_empty());
        for pair in path.windows(2) {
            assert!(g.node(&pair[1]).unwrap().depends_on.contains(&pair[0]));
        }
        let last = path.last().unwrap();
        assert!(g.edges().iter().all(|e| &e.from != last));
        assert_eq!(path, &vec!["s1", "m", "t1"]);
    }

    #[test]
    fn group_children_share_the_group_stage() {
        let mut g = build(&["a", "c1", "c2", "z"], &[("a", "c1")]);
        g.add_node(Node::parallel_group("g", ["c1", "c2"])).unwrap();
        g.add_edge("g", "z", None).unwrap();

        let plan = plan(&g);
        assert_eq!(stage_ids(&plan), vec![vec!["a"], vec!["g"], vec!["z"]]);
        assert!(plan.stages[1].parallel);
        assert!(!plan.stages[2].parallel);
        assert_eq!(plan.stage_of("c1"), Some(1));
        assert_eq!(plan.stage_of("c2"), Some(1));
        assert_eq!(
            plan.transitive_dependents("a").into_iter().collect::<Vec<_>>(),
            vec!["g", "z"]
        );
    }

    #[test]
    fn empty_graph_has_empty_plan() {
        let plan = plan(&Graph::new());
        assert!(plan.is_empty());
        assert_eq!(plan.parallelism, 0);
        assert!(plan.critical_path.is_empty());
    }
}
