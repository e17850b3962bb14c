//! DAG (Directed Acyclic Graph) engine for task dependency resolution

use crate::error::{Result, TributaryError};
use crate::models::TaskConfig;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};

/// Immutable dependency graph of one workflow.
///
/// Edges point from a dependency to its dependent. Both `depends_on` and
/// `downstream` declarations contribute edges; declaring the same edge from
/// both sides is fine.
#[derive(Debug, Clone)]
pub struct DagEngine {
    graph: DiGraph<String, ()>,
    task_indices: HashMap<String, NodeIndex>,
    order: Vec<String>,
}

impl DagEngine {
    /// Build DAG from task configurations
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTask`, `MissingDependency` or `CycleDetected`.
    pub fn build(tasks: &[TaskConfig]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut task_indices = HashMap::new();

        for task in tasks {
            if task_indices.contains_key(&task.name) {
                return Err(TributaryError::DuplicateTask(task.name.clone()));
            }
            let index = graph.add_node(task.name.clone());
            task_indices.insert(task.name.clone(), index);
        }

        let mut seen = HashSet::new();
        for task in tasks {
            let task_index = task_indices[&task.name];

            for dep_name in &task.depends_on {
                let dep_index = *task_indices.get(dep_name).ok_or_else(|| {
                    TributaryError::MissingDependency {
                        task: task.name.clone(),
                        dependency: dep_name.clone(),
                    }
                })?;
                if seen.insert((dep_index, task_index)) {
                    graph.add_edge(dep_index, task_index, ());
                }
            }

            for down_name in &task.downstream {
                let down_index = *task_indices.get(down_name).ok_or_else(|| {
                    TributaryError::MissingDependency {
                        task: task.name.clone(),
                        dependency: down_name.clone(),
                    }
                })?;
                if seen.insert((task_index, down_index)) {
                    graph.add_edge(task_index, down_index, ());
                }
            }
        }

        let mut engine = Self {
            graph,
            task_indices,
            order: Vec::new(),
        };

        engine.validate_acyclic()?;
        engine.order = engine.kahn_order();

        Ok(engine)
    }

    /// Validate that the graph is acyclic
    pub fn validate_acyclic(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            let cycle_info = self.find_cycle();
            return Err(TributaryError::CycleDetected(cycle_info));
        }
        Ok(())
    }

    /// Find a cycle in the graph for error reporting
    fn find_cycle(&self) -> String {
        // None = unvisited, Some(true) = on the current path, Some(false) = done
        let mut visited: HashMap<NodeIndex, bool> = HashMap::new();
        let mut path = Vec::new();

        let mut starts: Vec<NodeIndex> = self.graph.node_indices().collect();
        starts.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        for node in starts {
            if !visited.contains_key(&node) {
                if let Some(cycle) = self.dfs_find_cycle(node, &mut visited, &mut path) {
                    return cycle;
                }
            }
        }

        "Unknown cycle".to_string()
    }

    fn dfs_find_cycle(
        &self,
        node: NodeIndex,
        visited: &mut HashMap<NodeIndex, bool>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<String> {
        if let Some(&on_path) = visited.get(&node) {
            if on_path {
                // Report only the cycle itself, not the prefix that led to it
                let start = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut names: Vec<&str> =
                    path[start..].iter().map(|n| self.graph[*n].as_str()).collect();
                names.push(self.graph[node].as_str());
                return Some(names.join(" -> "));
            }
            return None;
        }

        visited.insert(node, true);
        path.push(node);

        for neighbor in self.graph.neighbors(node) {
            if let Some(cycle) = self.dfs_find_cycle(neighbor, visited, path) {
                return Some(cycle);
            }
        }

        path.pop();
        visited.insert(node, false);
        None
    }

    /// Kahn's algorithm, always picking the smallest ready task name
    fn kahn_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    self.graph.neighbors_directed(n, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(String, NodeIndex)>> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(&n, _)| Reverse((self.graph[n].clone(), n)))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((name, node))) = ready.pop() {
            order.push(name);
            for next in self.graph.neighbors(node) {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse((self.graph[next].clone(), next)));
                    }
                }
            }
        }

        order
    }

    /// Deterministic topological order of all task names
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.task_indices.contains_key(task_name)
    }

    /// Get tasks grouped by execution level (for parallel execution)
    /// Level 0 = tasks with no dependencies
    /// Level 1 = tasks depending only on level 0, etc.
    pub fn parallel_levels(&self) -> Vec<Vec<String>> {
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut node_levels: HashMap<NodeIndex, usize> = HashMap::new();

        // Walking in topological order means every parent already has a level
        for name in &self.order {
            let node = self.task_indices[name];
            let level = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|parent| node_levels.get(&parent))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            node_levels.insert(node, level);

            while levels.len() <= level {
                levels.push(Vec::new());
            }
            levels[level].push(name.clone());
        }

        levels
    }

    /// Tasks that directly depend on `task_name`, sorted
    pub fn direct_dependents(&self, task_name: &str) -> Vec<String> {
        self.neighbors_sorted(task_name, Direction::Outgoing)
    }

    /// Tasks `task_name` directly depends on, sorted
    pub fn direct_dependencies(&self, task_name: &str) -> Vec<String> {
        self.neighbors_sorted(task_name, Direction::Incoming)
    }

    fn neighbors_sorted(&self, task_name: &str, direction: Direction) -> Vec<String> {
        match self.task_indices.get(task_name) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|idx| self.graph[idx].clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task reachable downstream of `task_name`, in breadth-first order
    pub fn transitive_dependents(&self, task_name: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = self.direct_dependents(task_name).into();

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            queue.extend(self.direct_dependents(&name));
            result.push(name);
        }

        result
    }

    /// All edges as (upstream, downstream), sorted
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges: Vec<(String, String)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| (self.graph[from].clone(), self.graph[to].clone()))
            .collect();
        edges.sort();
        edges
    }
}
