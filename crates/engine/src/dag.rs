//! Dependency graph — ordering constraints between stages.
//!
//! Rules enforced on every mutation:
//! 1. Stage IDs are unique (delegated to the [`StageRegistry`]).
//! 2. Every edge references registered stages on both sides.
//! 3. The graph stays acyclic: an edge that would close a cycle is rejected
//!    before anything is changed.
//!
//! Because the graph is validated incrementally, [`DependencyGraph::topological_order`]
//! can only fail if that invariant was broken elsewhere.

use std::collections::HashMap;
use std::time::Duration;

use work::Work;

use crate::{EngineError, Stage, StageRegistry};

/// A DAG over the stages of a [`StageRegistry`], which it owns.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    registry: StageRegistry,
    /// `downstream[i]` — positions that depend on stage `i`.
    downstream: Vec<Vec<usize>>,
    /// `upstream[i]` — positions stage `i` depends on.
    upstream: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage. See [`StageRegistry::register`].
    pub fn register(
        &mut self,
        id: impl Into<String>,
        work: Work,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<(), EngineError> {
        self.registry.register(id, work, retries, retry_delay)?;
        self.grow();
        Ok(())
    }

    /// Register a fully built stage.
    pub fn insert(&mut self, stage: Stage) -> Result<(), EngineError> {
        self.registry.insert(stage)?;
        self.grow();
        Ok(())
    }

    fn grow(&mut self) {
        self.downstream.push(Vec::new());
        self.upstream.push(Vec::new());
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Add the constraint "`upstream` must succeed before `downstream` starts".
    ///
    /// Adding an edge that already exists is a no-op.
    ///
    /// # Errors
    /// - [`EngineError::UnknownStage`] if either ID is not registered.
    /// - [`EngineError::CycleDetected`] if the edge would create a cycle
    ///   (including `upstream == downstream`).
    ///
    /// On error the graph is unchanged.
    pub fn add_edge(&mut self, upstream: &str, downstream: &str) -> Result<(), EngineError> {
        let up = self.endpoint(upstream, "upstream")?;
        let down = self.endpoint(downstream, "downstream")?;

        if self.downstream[up].contains(&down) {
            return Ok(());
        }

        // The new edge closes a cycle iff `upstream` is already reachable
        // from `downstream`.
        if let Some(path) = self.find_path(down, up) {
            let mut cycle: Vec<String> = Vec::with_capacity(path.len() + 1);
            cycle.push(upstream.to_owned());
            cycle.extend(path.into_iter().map(|i| self.registry.at(i).id.clone()));
            return Err(EngineError::CycleDetected { path: cycle });
        }

        self.downstream[up].push(down);
        self.upstream[down].push(up);
        Ok(())
    }

    fn endpoint(&self, id: &str, role: &'static str) -> Result<usize, EngineError> {
        self.registry
            .position(id)
            .map_err(|_| EngineError::UnknownStage {
                stage_id: id.to_owned(),
                role,
            })
    }

    /// Depth-first search for a path `from -> … -> to`, inclusive.
    fn find_path(&self, from: usize, to: usize) -> Option<Vec<usize>> {
        let mut parent: HashMap<usize, usize> = HashMap::new();
        let mut visited = vec![false; self.registry.len()];
        let mut stack = vec![from];
        visited[from] = true;

        while let Some(node) = stack.pop() {
            if node == to {
                let mut path = vec![node];
                let mut cur = node;
                while let Some(&p) = parent.get(&cur) {
                    path.push(p);
                    cur = p;
                }
                path.reverse();
                return Some(path);
            }
            for &next in &self.downstream[node] {
                if !visited[next] {
                    visited[next] = true;
                    parent.insert(next, node);
                    stack.push(next);
                }
            }
        }
        None
    }

    /// Direct upstream dependencies of `id`, in edge-insertion order.
    pub fn upstream_of(&self, id: &str) -> Result<Vec<&str>, EngineError> {
        let pos = self.registry.position(id)?;
        Ok(self.ids_at(&self.upstream[pos]))
    }

    /// Direct dependents of `id`, in edge-insertion order.
    pub fn downstream_of(&self, id: &str) -> Result<Vec<&str>, EngineError> {
        let pos = self.registry.position(id)?;
        Ok(self.ids_at(&self.downstream[pos]))
    }

    fn ids_at(&self, positions: &[usize]) -> Vec<&str> {
        positions.iter().map(|&i| self.registry.at(i).id.as_str()).collect()
    }

    /// Every edge as `(upstream, downstream)`, grouped by upstream in
    /// registration order.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.downstream.iter().enumerate().flat_map(move |(up, downs)| {
            let up_id = self.registry.at(up).id.as_str();
            downs
                .iter()
                .map(move |&down| (up_id, self.registry.at(down).id.as_str()))
        })
    }

    pub(crate) fn upstream_positions(&self, position: usize) -> &[usize] {
        &self.upstream[position]
    }

    /// Transitive downstream closure of `position` (excluding itself), in
    /// registration order.
    pub(crate) fn descendants(&self, position: usize) -> Vec<usize> {
        let mut seen = vec![false; self.registry.len()];
        let mut stack = vec![position];
        while let Some(node) = stack.pop() {
            for &next in &self.downstream[node] {
                if !seen[next] {
                    seen[next] = true;
                    stack.push(next);
                }
            }
        }
        seen.iter()
            .enumerate()
            .filter_map(|(i, &s)| s.then_some(i))
            .collect()
    }

    /// Lazily compute the ready sets of this graph.
    ///
    /// Each item is a group of stage IDs whose upstream stages all appear in
    /// earlier groups, so the members of one group may run concurrently.
    /// Within a group IDs are in registration order.
    pub fn topological_order(&self) -> ReadySets<'_> {
        ReadySets::new(self)
    }

    /// [`topological_order`](Self::topological_order), collected.
    pub fn ready_sets(&self) -> Result<Vec<Vec<String>>, EngineError> {
        self.topological_order()
            .map(|set| set.map(|ids| ids.into_iter().map(str::to_owned).collect()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ReadySets
// ---------------------------------------------------------------------------

/// Iterator returned by [`DependencyGraph::topological_order`] (Kahn's
/// algorithm, one level per item).
///
/// Ends once every stage has been emitted. If stages remain that can never
/// become ready, yields a single [`EngineError::CycleDetected`] naming them
/// and then ends.
pub struct ReadySets<'g> {
    graph: &'g DependencyGraph,
    in_degree: Vec<usize>,
    current: Vec<usize>,
    emitted: usize,
    done: bool,
}

impl<'g> ReadySets<'g> {
    fn new(graph: &'g DependencyGraph) -> Self {
        let in_degree: Vec<usize> = graph.upstream.iter().map(Vec::len).collect();
        let current = in_degree
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| (d == 0).then_some(i))
            .collect();

        Self {
            graph,
            in_degree,
            current,
            emitted: 0,
            done: false,
        }
    }
}

impl<'g> Iterator for ReadySets<'g> {
    type Item = Result<Vec<&'g str>, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.current.is_empty() {
            self.done = true;
            if self.emitted == self.in_degree.len() {
                return None;
            }
            let stuck = self
                .in_degree
                .iter()
                .enumerate()
                .filter(|(_, &d)| d > 0)
                .map(|(i, _)| self.graph.registry.at(i).id.clone())
                .collect();
            return Some(Err(EngineError::CycleDetected { path: stuck }));
        }

        let set = std::mem::take(&mut self.current);
        let mut next: Vec<usize> = Vec::new();
        for &node in &set {
            for &dependent in &self.graph.downstream[node] {
                let degree = &mut self.in_degree[dependent];
                *degree -= 1;
                if *degree == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();

        self.emitted += set.len();
        self.current = next;

        let registry = &self.graph.registry;
        Some(Ok(set.iter().map(|&i| registry.at(i).id.as_str()).collect()))
    }
}
