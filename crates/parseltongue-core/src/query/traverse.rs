//! Capped breadth-first traversal.
//!
//! The walk is independent of storage: callers supply a neighbour function
//! returning the resolved edges incident to a node. Each hop's newly
//! discovered nodes are sorted by [`EntityKey`] order and truncated to the
//! per-hop cap, so the output is fully determined by the graph contents.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::{Edge, EdgeKind, EntityKey, Subgraph};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming,
    Both,
}

impl Direction {
    pub fn follows_outgoing(&self) -> bool {
        matches!(self, Direction::Outgoing | Direction::Both)
    }

    pub fn follows_incoming(&self) -> bool {
        matches!(self, Direction::Incoming | Direction::Both)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraversalLimits {
    pub max_hops: u32,
    pub cap_per_hop: u32,
    /// Ceiling on the total node count, seeds included.
    pub max_nodes: usize,
}

/// Walk from `seeds` along `edge_kinds` (all kinds when empty).
///
/// `neighbours` must return only resolved edges whose both endpoints exist,
/// already filtered by direction. Seeds are assumed to exist.
pub fn capped_bfs<F, E>(
    seeds: &[EntityKey],
    edge_kinds: &[EdgeKind],
    limits: &TraversalLimits,
    mut neighbours: F,
) -> Result<Subgraph, E>
where
    F: FnMut(&EntityKey) -> Result<Vec<Edge>, E>,
{
    let kinds: BTreeSet<EdgeKind> = edge_kinds.iter().copied().collect();
    let seed_set: BTreeSet<EntityKey> = seeds.iter().cloned().collect();
    let max_nodes = limits.max_nodes.max(1);
    let mut truncated = seed_set.len() > max_nodes;
    let mut frontier: Vec<EntityKey> = seed_set.into_iter().take(max_nodes).collect();
    let mut visited: BTreeSet<EntityKey> = frontier.iter().cloned().collect();
    let mut hops = vec![frontier.clone()];
    let mut touched: BTreeSet<Edge> = BTreeSet::new();

    for _ in 0..limits.max_hops {
        if frontier.is_empty() {
            break;
        }
        let mut candidates: BTreeSet<EntityKey> = BTreeSet::new();
        for node in &frontier {
            for edge in neighbours(node)? {
                if !kinds.is_empty() && !kinds.contains(&edge.kind) {
                    continue;
                }
                let other = if edge.from == *node {
                    &edge.to
                } else {
                    &edge.from
                };
                if !visited.contains(other) {
                    candidates.insert(other.clone());
                }
                touched.insert(edge);
            }
        }

        let room = max_nodes.saturating_sub(visited.len());
        let wanted = candidates.len().min(limits.cap_per_hop as usize);
        truncated |= wanted > room;
        let admitted: Vec<EntityKey> = candidates.into_iter().take(wanted.min(room)).collect();
        visited.extend(admitted.iter().cloned());
        hops.push(admitted.clone());
        frontier = admitted;
    }

    let edges: Vec<Edge> = touched
        .into_iter()
        .filter(|e| visited.contains(&e.from) && visited.contains(&e.to))
        .collect();
    Ok(Subgraph {
        nodes: visited.into_iter().collect(),
        edges,
        hops,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, Provenance};
    use std::convert::Infallible;

    fn k(name: &str) -> EntityKey {
        EntityKey::new("rust", "g.rs", EntityKind::Function, name, None)
    }

    fn calls(from: &str, to: &str) -> Edge {
        Edge::resolved(k(from), k(to), EdgeKind::Calls, Provenance::Syntactic)
    }

    fn walk(
        edges: &[Edge],
        seeds: &[&str],
        direction: Direction,
        max_hops: u32,
        cap_per_hop: u32,
    ) -> Subgraph {
        let seeds: Vec<EntityKey> = seeds.iter().map(|s| k(s)).collect();
        let limits = TraversalLimits {
            max_hops,
            cap_per_hop,
            max_nodes: 1000,
        };
        capped_bfs::<_, Infallible>(&seeds, &[], &limits, |node| {
            Ok(edges
                .iter()
                .filter(|e| {
                    (direction.follows_outgoing() && e.from == *node)
                        || (direction.follows_incoming() && e.to == *node)
                })
                .cloned()
                .collect())
        })
        .unwrap()
    }

    #[test]
    fn test_cap_keeps_smallest_keys() {
        let edges = vec![
            calls("s", "c"),
            calls("s", "a"),
            calls("s", "b"),
            calls("a", "z"),
            calls("a", "y"),
        ];
        let sub = walk(&edges, &["s"], Direction::Outgoing, 2, 1);
        assert_eq!(sub.hops[1], vec![k("a")]);
        assert_eq!(sub.hops[2], vec![k("y")]);
        assert_eq!(sub.nodes, vec![k("a"), k("s"), k("y")]);
        assert_eq!(sub.edges, vec![calls("a", "y"), calls("s", "a")]);
    }

    #[test]
    fn test_zero_hops_returns_seeds() {
        let sub = walk(&[calls("s", "a")], &["s"], Direction::Outgoing, 0, 5);
        assert_eq!(sub.nodes, vec![k("s")]);
        assert!(sub.edges.is_empty());
    }

    #[test]
    fn test_cycles_terminate() {
        let edges = vec![calls("a", "b"), calls("b", "a")];
        let sub = walk(&edges, &["a"], Direction::Outgoing, 10, 10);
        assert_eq!(sub.nodes.len(), 2);
        assert_eq!(sub.edges.len(), 2);
        assert!(sub.hops[2].is_empty());
    }

    #[test]
    fn test_incoming_direction() {
        let edges = vec![calls("caller", "target"), calls("target", "callee")];
        let sub = walk(&edges, &["target"], Direction::Incoming, 1, 10);
        assert_eq!(sub.nodes, vec![k("caller"), k("target")]);
        let both = walk(&edges, &["target"], Direction::Both, 1, 10);
        assert_eq!(both.nodes.len(), 3);
    }

    #[test]
    fn test_edge_kind_filter() {
        let edges = vec![
            calls("s", "a"),
            Edge::resolved(k("s"), k("b"), EdgeKind::UsesType, Provenance::Syntactic),
        ];
        let limits = TraversalLimits {
            max_hops: 1,
            cap_per_hop: 10,
            max_nodes: 100,
        };
        let sub = capped_bfs::<_, Infallible>(&[k("s")], &[EdgeKind::UsesType], &limits, |node| {
            Ok(edges.iter().filter(|e| e.from == *node).cloned().collect())
        })
        .unwrap();
        assert_eq!(sub.nodes, vec![k("b"), k("s")]);
    }

    #[test]
    fn test_node_ceiling_applies() {
        let edges: Vec<Edge> = (0..10).map(|i| calls("s", &format!("n{i}"))).collect();
        let limits = TraversalLimits {
            max_hops: 1,
            cap_per_hop: 10,
            max_nodes: 4,
        };
        let sub = capped_bfs::<_, Infallible>(&[k("s")], &[], &limits, |node| {
            Ok(edges.iter().filter(|e| e.from == *node).cloned().collect())
        })
        .unwrap();
        assert_eq!(sub.nodes.len(), 4);
        assert!(sub.truncated);
        let roomy = walk(&edges, &["s"], Direction::Outgoing, 1, 3);
        assert_eq!(roomy.nodes.len(), 4);
        assert!(!roomy.truncated);
    }
}
