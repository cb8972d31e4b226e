//! Dependency graph used to order models before compilation.
//!
//! Internal to `velo-flow`; callers see only the compiled order.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::hash::Hash;

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};

/// A directed acyclic graph for dependency management.
///
/// Edges point from an upstream node to its dependent. Insertion order is the
/// tie-breaker whenever several nodes are ready at once, so callers control
/// determinism by choosing the order they add nodes in.
#[derive(Debug, Clone)]
pub struct Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// The underlying petgraph graph.
    graph: DiGraph<T, ()>,
    /// Map from node value to node index for fast lookup.
    index_map: HashMap<T, NodeIndex>,
    /// Position of each node in insertion order.
    rank: HashMap<NodeIndex, usize>,
}

impl<T> Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// Creates a new empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_map: HashMap::new(),
            rank: HashMap::new(),
        }
    }

    /// Returns the number of nodes in the DAG.
    #[must_use]
    #[cfg(test)]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Adds a node to the DAG.
    ///
    /// If the node already exists, this is a no-op.
    /// Returns the node index for use with other methods.
    pub fn add_node(&mut self, value: T) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&value) {
            return idx;
        }
        let idx = self.graph.add_node(value.clone());
        self.index_map.insert(value, idx);
        self.rank.insert(idx, self.rank.len());
        idx
    }

    /// Adds a directed edge from `from` (upstream) to `to` (dependent).
    ///
    /// # Errors
    ///
    /// Returns an error if either node index is invalid.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) -> Result<()> {
        self.weight(from)?;
        self.weight(to)?;
        self.graph.add_edge(from, to, ());
        Ok(())
    }

    /// Returns the node index for a value, if it exists.
    #[must_use]
    pub fn get_index(&self, value: &T) -> Option<NodeIndex> {
        self.index_map.get(value).copied()
    }

    fn weight(&self, idx: NodeIndex) -> Result<&T> {
        self.graph
            .node_weight(idx)
            .ok_or_else(|| Error::DagNodeNotFound {
                node: format!("index {}", idx.index()),
            })
    }

    fn rank_of(&self, idx: NodeIndex) -> usize {
        self.rank.get(&idx).copied().unwrap_or(usize::MAX)
    }

    /// Returns a topologically sorted list of nodes.
    ///
    /// Uses Kahn's algorithm. Among ready nodes the one inserted earliest is
    /// always emitted first, so the order is fully determined by the graph
    /// and the insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CyclicGraph`] naming the nodes of one cycle if the
    /// graph is not acyclic.
    pub fn toposort(&self) -> Result<Vec<T>> {
        let node_count = self.graph.node_count();
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, 0))
            .collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut ready: BTreeSet<(usize, NodeIndex)> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&idx, _)| (self.rank_of(idx), idx))
            .collect();

        let mut result = Vec::with_capacity(node_count);
        while let Some((_, idx)) = ready.pop_first() {
            result.push(self.weight(idx)?.clone());
            for neighbor in self.graph.neighbors(idx) {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        ready.insert((self.rank_of(neighbor), neighbor));
                    }
                }
            }
        }

        if result.len() != node_count {
            return Err(Error::CyclicGraph {
                cycle: self.find_cycle(),
            });
        }
        Ok(result)
    }

    /// Returns the members of one cycle, earliest-inserted first, closed by
    /// repeating the first member.
    fn find_cycle(&self) -> Vec<String> {
        let mut components: Vec<Vec<NodeIndex>> = kosaraju_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || scc.iter().any(|&n| self.graph.contains_edge(n, n))
            })
            .collect();
        for scc in &mut components {
            scc.sort_by_key(|&n| self.rank_of(n));
        }
        components.sort_by_key(|scc| scc.first().map_or(usize::MAX, |&n| self.rank_of(n)));

        let Some(scc) = components.into_iter().next() else {
            return vec!["unknown".to_string()];
        };
        let mut cycle: Vec<String> = scc
            .iter()
            .filter_map(|&n| self.graph.node_weight(n))
            .map(ToString::to_string)
            .collect();
        if let Some(first) = cycle.first().cloned() {
            cycle.push(first);
        }
        cycle
    }
}

impl<T> Default for Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag_of(nodes: &[&str], edges: &[(&str, &str)]) -> Dag<String> {
        let mut dag = Dag::new();
        for n in nodes {
            dag.add_node((*n).to_string());
        }
        for (a, b) in edges {
            let a = dag.get_index(&(*a).to_string()).unwrap();
            let b = dag.get_index(&(*b).to_string()).unwrap();
            dag.add_edge(a, b).unwrap();
        }
        dag
    }

    #[test]
    fn empty_dag_has_no_nodes() {
        let dag: Dag<String> = Dag::new();
        assert_eq!(dag.node_count(), 0);
        assert!(dag.toposort().unwrap().is_empty());
    }

    #[test]
    fn duplicate_nodes_are_ignored() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        assert_eq!(dag.add_node("a".into()), a);
        assert_eq!(dag.node_count(), 1);
    }

    #[test]
    fn linear_dag_sorts_correctly() {
        let dag = dag_of(&["c", "b", "a"], &[("a", "b"), ("b", "c")]);
        assert_eq!(dag.toposort().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn ready_nodes_follow_insertion_order() {
        // d and b both become ready after a; b was inserted first.
        let dag = dag_of(&["a", "b", "c", "d"], &[("a", "d"), ("a", "b"), ("b", "c")]);
        assert_eq!(dag.toposort().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn dag_detects_cycle_and_names_members() {
        let dag = dag_of(&["x", "a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let err = dag.toposort().unwrap_err();
        let Error::CyclicGraph { cycle } = err else {
            panic!("expected cycle error, got {err:?}");
        };
        assert_eq!(cycle, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let dag = dag_of(&["a"], &[("a", "a")]);
        assert!(matches!(dag.toposort(), Err(Error::CyclicGraph { .. })));
    }
}
