//! Validated stage dependency graphs.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::DiGraph;
use tracing::debug;

use super::{PipelineError, PipelineResult};
use crate::stage::{StageDefinition, scratch_dir_name};

/// A validated, acyclic set of stages in dependency order.
///
/// Dependencies may name a stage or a group. A group name expands to every
/// stage in that group; a name that is both a stage and a group refers to
/// all of them.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<StageDefinition>,
    prerequisites: Vec<Vec<usize>>,
}

fn invalid(reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidPipelineGraph {
        reason: reason.into(),
    }
}

/// Name lookup over a list of definitions.
struct Names<'a> {
    stages: HashMap<&'a str, usize>,
    groups: HashMap<&'a str, Vec<usize>>,
}

impl<'a> Names<'a> {
    fn new(defs: &'a [StageDefinition]) -> PipelineResult<Self> {
        let mut stages = HashMap::new();
        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut scratch: HashMap<String, &str> = HashMap::new();
        for (i, def) in defs.iter().enumerate() {
            if def.name.trim().is_empty() {
                return Err(invalid(format!("stage #{} has an empty name", i + 1)));
            }
            if stages.insert(def.name.as_str(), i).is_some() {
                return Err(invalid(format!("duplicate stage name '{}'", def.name)));
            }
            // Stage logs live in a directory derived from the name.
            if let Some(other) = scratch.insert(scratch_dir_name(&def.name), def.name.as_str()) {
                return Err(invalid(format!(
                    "stage names '{other}' and '{}' map to the same log directory",
                    def.name
                )));
            }
            if let Some(group) = &def.group {
                groups.entry(group.as_str()).or_default().push(i);
            }
        }
        Ok(Self { stages, groups })
    }

    /// Indices named by `name`, in declaration order. Empty if unknown.
    fn resolve(&self, name: &str) -> Vec<usize> {
        let mut found: BTreeSet<usize> = self
            .groups
            .get(name)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        if let Some(&i) = self.stages.get(name) {
            found.insert(i);
        }
        found.into_iter().collect()
    }
}

fn validate_platform(def: &StageDefinition) -> PipelineResult<()> {
    let Some(platform) = &def.platform else {
        return Ok(());
    };
    let bad = platform.is_empty()
        || platform == "."
        || platform == ".."
        || platform.contains(['/', '\\']);
    if bad {
        return Err(invalid(format!(
            "stage '{}' has an unusable platform name '{platform}'",
            def.name
        )));
    }
    Ok(())
}

impl StageGraph {
    /// Validate `definitions` and order them by dependency.
    ///
    /// Fails with [`PipelineError::InvalidPipelineGraph`] on empty or
    /// duplicate names, unknown or self dependencies, and cycles. Ties in
    /// the ordering keep declaration order.
    pub fn new(definitions: Vec<StageDefinition>) -> PipelineResult<Self> {
        let names = Names::new(&definitions)?;

        let mut prereqs: Vec<Vec<usize>> = Vec::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            validate_platform(def)?;
            let mut deps = BTreeSet::new();
            for dep in &def.depends_on {
                let resolved = names.resolve(dep);
                if resolved.is_empty() {
                    return Err(invalid(format!(
                        "stage '{}' depends on unknown stage or group '{dep}'",
                        def.name
                    )));
                }
                if resolved.contains(&i) {
                    return Err(invalid(format!("stage '{}' depends on itself", def.name)));
                }
                deps.extend(resolved);
            }
            prereqs.push(deps.into_iter().collect());
        }

        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..definitions.len()).map(|i| graph.add_node(i)).collect();
        for (i, deps) in prereqs.iter().enumerate() {
            for &dep in deps {
                graph.add_edge(nodes[dep], nodes[i], ());
            }
        }
        if is_cyclic_directed(&graph) {
            let members: Vec<&str> = tarjan_scc(&graph)
                .into_iter()
                .filter(|scc| scc.len() > 1)
                .flatten()
                .map(|node| definitions[graph[node]].name.as_str())
                .collect();
            return Err(invalid(format!(
                "dependency cycle between: {}",
                members.join(", ")
            )));
        }

        let order = topological_order(&prereqs);
        let mut position = vec![0; order.len()];
        for (pos, &i) in order.iter().enumerate() {
            position[i] = pos;
        }

        let mut slots: Vec<Option<StageDefinition>> = definitions.into_iter().map(Some).collect();
        let stages: Vec<StageDefinition> = order.iter().filter_map(|&i| slots[i].take()).collect();
        let prerequisites = order
            .iter()
            .map(|&i| {
                let mut deps: Vec<usize> = prereqs[i].iter().map(|&d| position[d]).collect();
                deps.sort_unstable();
                deps
            })
            .collect();

        debug!(stages = stages.len(), "validated stage graph");
        Ok(Self {
            stages,
            prerequisites,
        })
    }

    /// Stages in dependency order.
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the graph has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Direct prerequisites of the stage at `index`, as indices into [`stages`](Self::stages).
    pub fn prerequisites(&self, index: usize) -> &[usize] {
        self.prerequisites
            .get(index)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Index of a stage by exact name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Whether `name` refers to any stage or group in this graph.
    pub fn contains(&self, name: &str) -> bool {
        Names::new(&self.stages).is_ok_and(|names| !names.resolve(name).is_empty())
    }

    /// Restrict the graph to the stages and groups named in `targets`.
    ///
    /// With `include_prerequisites`, everything they transitively depend on
    /// is kept too. Edges to stages left out are dropped.
    pub fn select<S: AsRef<str>>(
        &self,
        targets: &[S],
        include_prerequisites: bool,
    ) -> PipelineResult<Self> {
        let names = Names::new(&self.stages)?;
        let mut keep = BTreeSet::new();
        for target in targets {
            let resolved = names.resolve(target.as_ref());
            if resolved.is_empty() {
                return Err(PipelineError::UnknownStage(target.as_ref().to_string()));
            }
            keep.extend(resolved);
        }

        if include_prerequisites {
            let mut stack: Vec<usize> = keep.iter().copied().collect();
            while let Some(i) = stack.pop() {
                for &dep in &self.prerequisites[i] {
                    if keep.insert(dep) {
                        stack.push(dep);
                    }
                }
            }
        }
        self.subgraph(&keep)
    }

    /// Remove the stages and groups named in `names`. Unknown names are ignored.
    pub fn without<S: AsRef<str>>(&self, names: &[S]) -> PipelineResult<Self> {
        let lookup = Names::new(&self.stages)?;
        let mut removed = BTreeSet::new();
        for name in names {
            let resolved = lookup.resolve(name.as_ref());
            if resolved.is_empty() {
                debug!(name = name.as_ref(), "nothing to remove");
            }
            removed.extend(resolved);
        }
        let keep: BTreeSet<usize> = (0..self.stages.len()).filter(|i| !removed.contains(i)).collect();
        self.subgraph(&keep)
    }

    fn subgraph(&self, keep: &BTreeSet<usize>) -> PipelineResult<Self> {
        let defs = keep
            .iter()
            .map(|&i| {
                let mut def = self.stages[i].clone();
                def.depends_on = self.prerequisites[i]
                    .iter()
                    .filter(|dep| keep.contains(dep))
                    .map(|&dep| self.stages[dep].name.clone())
                    .collect();
                def
            })
            .collect();
        Self::new(defs)
    }
}

/// Kahn's algorithm, always taking the lowest declaration index available.
fn topological_order(prereqs: &[Vec<usize>]) -> Vec<usize> {
    let mut indegree: Vec<usize> = prereqs.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); prereqs.len()];
    for (i, deps) in prereqs.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(prereqs.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(graph: &StageGraph) -> Vec<&str> {
        graph.stages().iter().map(|s| s.name.as_str()).collect()
    }

    fn release_graph() -> StageGraph {
        StageGraph::new(vec![
            StageDefinition::new("publish", "true").after(["build"]),
            StageDefinition::new("build-linux", "true").after(["test"]).in_group("build"),
            StageDefinition::new("build-windows", "true").after(["test"]).in_group("build"),
            StageDefinition::new("build-macos", "true").after(["test"]).in_group("build"),
            StageDefinition::new("test", "true").after(["lint"]),
            StageDefinition::new("lint", "true"),
        ])
        .unwrap()
    }

    #[test]
    fn orders_by_dependency_then_declaration() {
        let graph = release_graph();
        assert_eq!(
            names(&graph),
            vec!["lint", "test", "build-linux", "build-windows", "build-macos", "publish"]
        );
    }

    #[test]
    fn group_dependency_expands_to_members() {
        let graph = release_graph();
        let publish = graph.position("publish").unwrap();
        let deps: Vec<&str> = graph
            .prerequisites(publish)
            .iter()
            .map(|&i| graph.stages()[i].name.as_str())
            .collect();
        assert_eq!(deps, vec!["build-linux", "build-windows", "build-macos"]);
    }

    #[test]
    fn stage_and_group_with_same_name() {
        let graph = StageGraph::new(vec![
            StageDefinition::new("lint", "ruff").in_group("lint"),
            StageDefinition::new("typecheck", "mypy").in_group("lint"),
            StageDefinition::new("test", "pytest").after(["lint"]),
        ])
        .unwrap();
        assert_eq!(graph.prerequisites(2), &[0, 1]);
    }

    #[test]
    fn rejects_cycles() {
        let err = StageGraph::new(vec![
            StageDefinition::new("a", "true").after(["c"]),
            StageDefinition::new("b", "true").after(["a"]),
            StageDefinition::new("c", "true").after(["b"]),
        ])
        .unwrap_err();
        let PipelineError::InvalidPipelineGraph { reason } = err else {
            panic!("expected InvalidPipelineGraph, got {err:?}");
        };
        assert!(reason.contains("cycle"));
        for name in ["a", "b", "c"] {
            assert!(reason.contains(name), "{reason}");
        }
    }

    #[test]
    fn rejects_self_dependency() {
        let err = StageGraph::new(vec![StageDefinition::new("a", "true").after(["a"])]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPipelineGraph { .. }));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = StageGraph::new(vec![StageDefinition::new("a", "true").after(["nope"])]).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn rejects_duplicate_and_empty_names() {
        assert!(
            StageGraph::new(vec![
                StageDefinition::new("a", "true"),
                StageDefinition::new("a", "false"),
            ])
            .is_err()
        );
        assert!(StageGraph::new(vec![StageDefinition::new(" ", "true")]).is_err());
    }

    #[test]
    fn rejects_names_sharing_a_log_directory() {
        let err = StageGraph::new(vec![
            StageDefinition::new("build linux", "true"),
            StageDefinition::new("build_linux", "true"),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPipelineGraph { .. }));
        assert!(err.to_string().contains("'build linux' and 'build_linux'"));

        let dots = StageGraph::new(vec![
            StageDefinition::new("..", "true"),
            StageDefinition::new(".", "true"),
        ])
        .unwrap();
        assert_eq!(dots.len(), 2);
    }

    #[test]
    fn rejects_path_like_platform() {
        let err = StageGraph::new(vec![StageDefinition::new("a", "true").for_platform("../x")])
            .unwrap_err();
        assert!(err.to_string().contains("platform"));
    }

    #[test]
    fn empty_graph_is_valid() {
        let graph = StageGraph::new(Vec::new()).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn select_with_prerequisites() {
        let graph = release_graph().select(&["build-linux"], true).unwrap();
        assert_eq!(names(&graph), vec!["lint", "test", "build-linux"]);
    }

    #[test]
    fn select_group_without_prerequisites() {
        let graph = release_graph().select(&["build"], false).unwrap();
        assert_eq!(names(&graph), vec!["build-linux", "build-windows", "build-macos"]);
        assert!(graph.prerequisites(0).is_empty());
    }

    #[test]
    fn select_unknown_target() {
        let err = release_graph().select(&["deploy"], false).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStage(name) if name == "deploy"));
    }

    #[test]
    fn without_drops_stages_and_edges() {
        let graph = release_graph().without(&["lint", "missing"]).unwrap();
        assert_eq!(graph.len(), 5);
        let test = graph.position("test").unwrap();
        assert!(graph.prerequisites(test).is_empty());
    }

    #[test]
    fn contains_stage_or_group() {
        let graph = release_graph();
        assert!(graph.contains("build"));
        assert!(graph.contains("lint"));
        assert!(!graph.contains("deploy"));
    }
}
