//! Dependency graph of one job's tasks, keyed by task name.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync
//! - BTree collections, so traversal order (and the reported cycle) is
//!   deterministic.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
    reverse_edges: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `task` waits for `depends_on`.
    pub fn add_dependency(&mut self, task: &str, depends_on: &str) {
        self.edges
            .entry(task.to_owned())
            .or_default()
            .insert(depends_on.to_owned());
        self.reverse_edges
            .entry(depends_on.to_owned())
            .or_default()
            .insert(task.to_owned());
    }

    pub fn remove_dependency(&mut self, task: &str, depends_on: &str) {
        if let Entry::Occupied(mut e) = self.edges.entry(task.to_owned()) {
            e.get_mut().remove(depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on.to_owned()) {
            e.get_mut().remove(task);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Tasks waiting for `task`.
    pub fn get_waiting_tasks(&self, task: &str) -> Vec<&str> {
        self.reverse_edges
            .get(task)
            .map(|waiting| waiting.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn get_dependencies(&self, task: &str) -> Vec<&str> {
        self.edges
            .get(task)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Number of direct predecessors.
    pub fn indegree(&self, task: &str) -> usize {
        self.edges.get(task).map_or(0, BTreeSet::len)
    }

    /// First cycle found, as the path `a -> b -> ... -> a`, or `None` for a DAG.
    ///
    /// Three-colour DFS over the forward edges: reaching a gray node closes
    /// a cycle. O(V + E).
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut colors: BTreeMap<&str, Color> = BTreeMap::new();
        let mut path: Vec<&str> = Vec::new();
        for start in self.edges.keys() {
            if !colors.contains_key(start.as_str())
                && let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        colors: &mut BTreeMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for dep in self.edges.get(node).into_iter().flatten() {
            match colors.get(dep.as_str()) {
                Some(Color::Gray) => {
                    let start = path.iter().position(|n| *n == dep.as_str())?;
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| (*n).to_owned()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Some(Color::Black) => {}
                None => {
                    if let Some(cycle) = self.dfs_cycle(dep, colors, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
        None
    }
}
