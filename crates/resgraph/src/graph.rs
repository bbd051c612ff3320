//! Graph construction - declare resources, derive edges, reject cycles

use crate::error::{Error, Result};
use crate::output::{Output, Ref};
use crate::spec::{AttrRef, Attributes, ResourceId, ResourceSpec};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Lifecycle of a node during one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Resolving,
    Resolved,
    Failed,
    /// Never started (fail-fast or cancellation)
    Skipped,
}

impl NodeState {
    /// Resolved, Failed and Skipped are final for the rest of the run
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Resolved | Self::Failed | Self::Skipped)
    }
}

/// A declared resource together with its run-time state
#[derive(Debug)]
pub struct ResourceNode {
    spec: ResourceSpec,
    seq: usize,
    state: Mutex<NodeState>,
    output: Output<Attributes>,
}

impl ResourceNode {
    pub fn id(&self) -> &ResourceId {
        &self.spec.id
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    /// Declaration sequence number
    pub fn seq(&self) -> usize {
        self.seq
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`. Final states are never left.
    pub(crate) fn set_state(&self, next: NodeState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_final() {
            log::warn!(
                "{} is already {:?}, ignoring transition to {:?}",
                self.spec.id,
                *state,
                next
            );
            return;
        }
        *state = next;
    }

    /// All attributes this node produces
    pub fn output(&self) -> &Output<Attributes> {
        &self.output
    }
}

/// Handle returned by [`GraphBuilder::declare`]
///
/// Used to reference the declared resource's attributes from later
/// declarations.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: ResourceId,
    output: Output<Attributes>,
}

impl NodeHandle {
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn output(&self) -> &Output<Attributes> {
        &self.output
    }

    /// Typed reference to one attribute (a `.`-separated path)
    pub fn attr<T>(&self, attribute: &str) -> Ref<T> {
        Ref::new(
            AttrRef::new(self.id.clone(), attribute),
            self.output.clone(),
        )
    }
}

/// Accumulates resource declarations for one run
///
/// There is no global registry: every declaration goes through a builder
/// passed by reference.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<ResourceNode>,
    index: HashMap<ResourceId, usize>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource. Fails if (type, name) is already declared.
    pub fn declare(&mut self, spec: ResourceSpec) -> Result<NodeHandle> {
        if self.index.contains_key(&spec.id) {
            return Err(Error::DuplicateResource { id: spec.id });
        }

        let seq = self.nodes.len();
        let output = Output::pending();
        let handle = NodeHandle {
            id: spec.id.clone(),
            output: output.clone(),
        };

        log::trace!("declared {} (#{seq})", spec.id);
        self.index.insert(spec.id.clone(), seq);
        self.nodes.push(ResourceNode {
            spec,
            seq,
            state: Mutex::new(NodeState::Pending),
            output,
        });
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Derive edges and freeze the graph
    pub fn build(self) -> Result<Graph> {
        let mut dependencies = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut deps = Vec::new();
            for dep in node.spec.dependency_ids() {
                match self.index.get(&dep) {
                    Some(&idx) => deps.push(idx),
                    None => {
                        return Err(Error::UnknownDependency {
                            from: node.spec.id.clone(),
                            to: dep,
                        });
                    }
                }
            }
            deps.sort_unstable();
            deps.dedup();
            dependencies.push(deps);
        }

        let mut dependents = vec![Vec::new(); self.nodes.len()];
        for (idx, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(idx);
            }
        }

        let order = topological_order(&dependencies).map_err(|cycle| Error::Cycle {
            path: cycle
                .into_iter()
                .map(|idx| self.nodes[idx].spec.id.clone())
                .collect(),
        })?;

        log::debug!(
            "built graph with {} resources and {} edges",
            self.nodes.len(),
            dependencies.iter().map(Vec::len).sum::<usize>()
        );

        Ok(Graph {
            nodes: self.nodes,
            index: self.index,
            dependencies,
            dependents,
            order,
        })
    }
}

/// Immutable, acyclic set of declared resources
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<ResourceNode>,
    index: HashMap<ResourceId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &ResourceNode {
        &self.nodes[idx]
    }

    pub fn index_of(&self, id: &ResourceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.index_of(id).map(|idx| &self.nodes[idx])
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Indices of the nodes `idx` depends on, ascending
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    /// Indices of the nodes depending on `idx`, ascending
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Dependencies before dependents; deterministic for a given declaration
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// `roots` plus everything they transitively depend on, ascending
    pub fn with_dependencies(&self, roots: &[usize]) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = roots.to_vec();
        while let Some(idx) = stack.pop() {
            if seen[idx] {
                continue;
            }
            seen[idx] = true;
            stack.extend(self.dependencies[idx].iter().copied());
        }
        (0..self.nodes.len()).filter(|&idx| seen[idx]).collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-colour DFS. Returns a post-order (dependencies first) or the cycle
/// found through a back edge, closed on its first node.
fn topological_order(dependencies: &[Vec<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let mut colors = vec![Color::White; dependencies.len()];
    let mut order = Vec::with_capacity(dependencies.len());
    // Gray nodes from the root down, each with its next dependency to visit
    let mut path: Vec<(usize, usize)> = Vec::new();

    for root in 0..dependencies.len() {
        if colors[root] != Color::White {
            continue;
        }
        colors[root] = Color::Gray;
        path.push((root, 0));

        while let Some(frame) = path.last_mut() {
            let idx = frame.0;
            let Some(&dep) = dependencies[idx].get(frame.1) else {
                path.pop();
                colors[idx] = Color::Black;
                order.push(idx);
                continue;
            };
            frame.1 += 1;
            match colors[dep] {
                Color::White => {
                    colors[dep] = Color::Gray;
                    path.push((dep, 0));
                }
                Color::Gray => {
                    let start = path.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                    let mut cycle: Vec<usize> = path[start..].iter().map(|&(n, _)| n).collect();
                    cycle.push(dep);
                    return Err(cycle);
                }
                Color::Black => {}
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> ResourceSpec {
        ResourceSpec::new("kubernetes:core/v1:Namespace", "mlflow-namespace")
            .input("metadata", serde_json::json!({"name": "mlflow"}))
    }

    #[test]
    fn test_declare_rejects_duplicates() {
        let mut builder = GraphBuilder::new();
        builder.declare(ns()).unwrap();
        match builder.declare(ns()) {
            Err(Error::DuplicateResource { id }) => assert_eq!(id.name, "mlflow-namespace"),
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[test]
    fn test_same_name_different_type_is_allowed() {
        let mut builder = GraphBuilder::new();
        builder
            .declare(ResourceSpec::new("aws:iam/role:Role", "mlflow"))
            .unwrap();
        builder
            .declare(ResourceSpec::new("kubernetes:core/v1:ServiceAccount", "mlflow"))
            .unwrap();
        assert_eq!(builder.build().unwrap().len(), 2);
    }

    #[test]
    fn test_edges_inferred_from_refs_and_depends_on() {
        let mut builder = GraphBuilder::new();
        let namespace = builder.declare(ns()).unwrap();
        let chart = builder
            .declare(ResourceSpec::new("kubernetes:helm.sh/v3:Chart", "traefik"))
            .unwrap();
        builder
            .declare(
                ResourceSpec::new("kubernetes:core/v1:ServiceAccount", "mlflow-sa")
                    .input("namespace", namespace.attr::<String>("metadata.name"))
                    .depends_on(chart.id().clone()),
            )
            .unwrap();

        let graph = builder.build().unwrap();
        assert_eq!(graph.dependencies(2), &[0, 1]);
        assert_eq!(graph.dependents(0), &[2]);
        assert_eq!(graph.topological_order(), &[0, 1, 2]);
    }

    #[test]
    fn test_unknown_dependency() {
        let mut builder = GraphBuilder::new();
        builder
            .declare(
                ResourceSpec::new("test:B", "b")
                    .input("x", AttrRef::new(ResourceId::new("test:A", "missing"), "id")),
            )
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(Error::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_names_both_nodes() {
        let a = ResourceId::new("test:A", "a");
        let b = ResourceId::new("test:B", "b");
        let mut builder = GraphBuilder::new();
        builder
            .declare(ResourceSpec::new("test:A", "a").input("x", AttrRef::new(b.clone(), "out")))
            .unwrap();
        builder
            .declare(ResourceSpec::new("test:B", "b").input("y", AttrRef::new(a.clone(), "out")))
            .unwrap();

        match builder.build() {
            Err(Error::Cycle { path }) => assert_eq!(path, vec![a.clone(), b, a]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let a = ResourceId::new("test:A", "a");
        let mut builder = GraphBuilder::new();
        builder
            .declare(ResourceSpec::new("test:A", "a").depends_on(a.clone()))
            .unwrap();
        match builder.build() {
            Err(Error::Cycle { path }) => assert_eq!(path, vec![a.clone(), a]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_long_chain_sorts_without_recursion() {
        // Each link depends on the one declared after it, so the walk is as deep as the chain
        const LINKS: usize = 50_000;
        let link = |i: usize| ResourceId::new("t", format!("link-{i}"));
        let mut builder = GraphBuilder::new();
        for i in 0..LINKS {
            let mut spec = ResourceSpec::new("t", format!("link-{i}"));
            if i + 1 < LINKS {
                spec = spec.depends_on(link(i + 1));
            }
            builder.declare(spec).unwrap();
        }

        let graph = builder.build().unwrap();
        let order = graph.topological_order();
        assert_eq!(order.len(), LINKS);
        assert_eq!(order[0], LINKS - 1);
        assert_eq!(order[LINKS - 1], 0);
    }

    #[test]
    fn test_with_dependencies() {
        let mut builder = GraphBuilder::new();
        let a = builder.declare(ResourceSpec::new("t", "a")).unwrap();
        let b = builder
            .declare(ResourceSpec::new("t", "b").input("a", a.attr::<String>("id")))
            .unwrap();
        builder.declare(ResourceSpec::new("t", "unrelated")).unwrap();
        builder
            .declare(ResourceSpec::new("t", "c").input("b", b.attr::<String>("id")))
            .unwrap();

        let graph = builder.build().unwrap();
        assert_eq!(graph.with_dependencies(&[3]), vec![0, 1, 3]);
    }

    #[test]
    fn test_final_state_is_sticky() {
        let mut builder = GraphBuilder::new();
        builder.declare(ns()).unwrap();
        let graph = builder.build().unwrap();
        let node = graph.node(0);

        node.set_state(NodeState::Resolving);
        node.set_state(NodeState::Failed);
        node.set_state(NodeState::Resolved);
        assert_eq!(node.state(), NodeState::Failed);
    }
}
