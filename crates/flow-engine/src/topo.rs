//! Cycle-safe topological ordering
//!
//! Kahn's algorithm over id lists. Ties resolve in input order, so the
//! result is deterministic for a given node list; any order satisfying
//! the edges is considered valid by callers.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::OperatorId;

/// Result of a topological sort
#[derive(Debug, Clone, Default)]
pub struct TopoResult {
    /// Nodes in dependency order (every edge's source before its target)
    pub order: Vec<OperatorId>,
    /// Nodes unresolvable by the sort, grouped by connected component.
    /// A self-loop shows up as a one-node group.
    pub cycles: Vec<Vec<OperatorId>>,
}

impl TopoResult {
    pub fn is_acyclic(&self) -> bool {
        self.cycles.is_empty()
    }
}

/// Order `nodes` so that for every `(u, v)` in `edges`, `u` precedes `v`.
///
/// Edges mentioning unknown nodes are ignored. Nodes still unresolved
/// when the zero-in-degree queue drains are cyclic and reported in
/// `cycles` instead of `order`.
pub fn topological_sort(nodes: &[OperatorId], edges: &[(OperatorId, OperatorId)]) -> TopoResult {
    let known: HashSet<&str> = nodes.iter().map(String::as_str).collect();

    let mut in_degree: HashMap<&str, usize> =
        nodes.iter().map(|n| (n.as_str(), 0)).collect();
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
    for (source, target) in edges {
        if !known.contains(source.as_str()) || !known.contains(target.as_str()) {
            continue;
        }
        outgoing
            .entry(source.as_str())
            .or_default()
            .push(target.as_str());
        *in_degree.entry(target.as_str()).or_default() += 1;
    }

    let mut queue: VecDeque<&str> = nodes
        .iter()
        .map(String::as_str)
        .filter(|n| in_degree.get(n).copied() == Some(0))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(node) = queue.pop_front() {
        order.push(node.to_string());
        for &next in outgoing.get(node).into_iter().flatten() {
            let degree = in_degree.entry(next).or_default();
            *degree = degree.saturating_sub(1);
            if *degree == 0 {
                queue.push_back(next);
            }
        }
    }

    let leftover: Vec<&str> = nodes
        .iter()
        .map(String::as_str)
        .filter(|n| in_degree.get(n).copied().unwrap_or(0) > 0)
        .collect();

    TopoResult {
        cycles: group_components(&leftover, edges),
        order,
    }
}

/// Group cyclic leftovers by undirected connected component
fn group_components(leftover: &[&str], edges: &[(OperatorId, OperatorId)]) -> Vec<Vec<OperatorId>> {
    let member: HashSet<&str> = leftover.iter().copied().collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (source, target) in edges {
        if member.contains(source.as_str()) && member.contains(target.as_str()) {
            adjacency.entry(source.as_str()).or_default().push(target.as_str());
            adjacency.entry(target.as_str()).or_default().push(source.as_str());
        }
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut groups = Vec::new();
    for &start in leftover {
        if seen.contains(start) {
            continue;
        }
        let mut group = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node) {
                continue;
            }
            group.push(node.to_string());
            queue.extend(adjacency.get(node).into_iter().flatten());
        }
        groups.push(group);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<OperatorId> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<(OperatorId, OperatorId)> {
        pairs
            .iter()
            .map(|(s, t)| (s.to_string(), t.to_string()))
            .collect()
    }

    fn position(order: &[OperatorId], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    #[test]
    fn test_diamond_ordering() {
        let result = topological_sort(
            &ids(&["sink", "left", "right", "root"]),
            &edges(&[
                ("root", "left"),
                ("root", "right"),
                ("left", "sink"),
                ("right", "sink"),
            ]),
        );
        assert!(result.is_acyclic());
        assert_eq!(result.order.len(), 4);
        assert!(position(&result.order, "root") < position(&result.order, "left"));
        assert!(position(&result.order, "root") < position(&result.order, "right"));
        assert!(position(&result.order, "left") < position(&result.order, "sink"));
        assert!(position(&result.order, "right") < position(&result.order, "sink"));
    }

    #[test]
    fn test_disjoint_components() {
        let result = topological_sort(
            &ids(&["a", "b", "x", "y"]),
            &edges(&[("a", "b"), ("x", "y")]),
        );
        assert!(result.is_acyclic());
        assert_eq!(result.order.len(), 4);
        assert!(position(&result.order, "a") < position(&result.order, "b"));
        assert!(position(&result.order, "x") < position(&result.order, "y"));
    }

    #[test]
    fn test_three_node_ring() {
        let result = topological_sort(
            &ids(&["a", "b", "c", "free"]),
            &edges(&[("a", "b"), ("b", "c"), ("c", "a")]),
        );
        assert_eq!(result.order, ids(&["free"]));
        assert_eq!(result.cycles.len(), 1);
        let mut ring = result.cycles[0].clone();
        ring.sort();
        assert_eq!(ring, ids(&["a", "b", "c"]));
    }

    #[test]
    fn test_self_loop_is_one_node_cycle() {
        let result = topological_sort(&ids(&["a", "b"]), &edges(&[("a", "a")]));
        assert_eq!(result.order, ids(&["b"]));
        assert_eq!(result.cycles, vec![ids(&["a"])]);
    }

    #[test]
    fn test_two_separate_cycles_grouped() {
        let result = topological_sort(
            &ids(&["a", "b", "x", "y"]),
            &edges(&[("a", "b"), ("b", "a"), ("x", "y"), ("y", "x")]),
        );
        assert!(result.order.is_empty());
        assert_eq!(result.cycles.len(), 2);
    }

    #[test]
    fn test_unknown_edge_endpoint_ignored() {
        let result = topological_sort(&ids(&["a"]), &edges(&[("a", "ghost")]));
        assert_eq!(result.order, ids(&["a"]));
        assert!(result.is_acyclic());
    }
}
