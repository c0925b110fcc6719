//! The path engine: K-shortest loopless paths (Yen's algorithm) over
//! residual-capacity weights, and the least-segmentation selection rule.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap};

use rustc_hash::FxHashSet;

use crate::network::{NodeName, Topology};
use crate::units::Mbps;

/// A loopless path together with its total weight (the sum of residual
/// capacities along it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePath {
    pub nodes: Vec<NodeName>,
    pub cost: u64,
}

impl CandidatePath {
    /// The traversed links as unordered pairs, in path order.
    pub fn links(&self) -> Vec<(NodeName, NodeName)> {
        self.nodes
            .windows(2)
            .map(|pair| (pair[0], pair[1]))
            .collect()
    }
}

// Candidates are kept in (cost, node sequence) order so ties resolve
// deterministically.
impl Ord for CandidatePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .cmp(&other.cost)
            .then_with(|| self.nodes.cmp(&other.nodes))
    }
}

impl PartialOrd for CandidatePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Returns up to `k` loopless paths from `src` to `dst` ordered by
/// nondecreasing total weight, ties broken by lexicographic node sequence.
///
/// Fails with [`PathError::NoPath`] when `src == dst` or no path exists.
pub fn k_shortest_simple_paths(
    topo: &Topology,
    src: NodeName,
    dst: NodeName,
    k: usize,
) -> Result<Vec<CandidatePath>, PathError> {
    if src == dst {
        return Err(PathError::NoPath { src, dst });
    }
    let first = shortest_path(topo, src, dst, &FxHashSet::default(), &FxHashSet::default())
        .ok_or(PathError::NoPath { src, dst })?;
    let mut accepted = vec![first];
    let mut candidates = BTreeSet::new();
    while accepted.len() < k {
        // Generate spur paths off every prefix of the latest accepted path.
        let prev = accepted[accepted.len() - 1].clone();
        for i in 0..prev.nodes.len() - 1 {
            let spur = prev.nodes[i];
            let root = &prev.nodes[..=i];
            let mut banned_edges = FxHashSet::default();
            for path in &accepted {
                if path.nodes.len() > i + 1 && path.nodes[..=i] == *root {
                    banned_edges.insert(edge_key(path.nodes[i], path.nodes[i + 1]));
                }
            }
            let banned_nodes = root[..i].iter().copied().collect::<FxHashSet<_>>();
            if let Some(spur_path) = shortest_path(topo, spur, dst, &banned_nodes, &banned_edges) {
                let mut nodes = root[..i].to_vec();
                nodes.extend(spur_path.nodes);
                if let Some(cost) = path_cost(topo, &nodes) {
                    candidates.insert(CandidatePath { nodes, cost });
                }
            }
        }
        // The best remaining candidate becomes the next accepted path.
        let next = loop {
            match candidates.pop_first() {
                Some(c) if accepted.contains(&c) => continue,
                other => break other,
            }
        };
        match next {
            Some(c) => accepted.push(c),
            None => break,
        }
    }
    Ok(accepted)
}

/// Applies the least-segmentation rule to candidate paths: paths with any
/// link under `rate` are discarded, and among the survivors the one with the
/// smallest post-allocation minimum residual wins (ties by pre-allocation
/// cost, then by node sequence).
pub fn least_segmentation(
    topo: &Topology,
    paths: &[CandidatePath],
    rate: Mbps,
) -> Result<CandidatePath, PathError> {
    paths
        .iter()
        .filter_map(|path| {
            let min_after = path
                .links()
                .into_iter()
                .map(|(a, b)| topo.residual(a, b)?.checked_sub(rate))
                .collect::<Option<Vec<_>>>()?
                .into_iter()
                .min()?;
            Some((min_after, path))
        })
        .min_by(|(after_a, a), (after_b, b)| after_a.cmp(after_b).then_with(|| a.cmp(b)))
        .map(|(_, path)| path.clone())
        .ok_or(PathError::InsufficientCapacity { rate })
}

/// The errors produced by the path engine.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// Graph-theoretic unreachability (includes `src == dst`).
    #[error("no path from {src} to {dst}")]
    NoPath {
        /// The requested source.
        src: NodeName,
        /// The requested destination.
        dst: NodeName,
    },

    /// No candidate path has enough residual capacity.
    #[error("no candidate path has residual capacity for {rate}")]
    InsufficientCapacity {
        /// The requested rate.
        rate: Mbps,
    },
}

/// Deterministic Dijkstra: entries are ordered by (cost, node sequence), so
/// equal-cost frontiers expand in lexicographic order.
fn shortest_path(
    topo: &Topology,
    src: NodeName,
    dst: NodeName,
    banned_nodes: &FxHashSet<NodeName>,
    banned_edges: &FxHashSet<(NodeName, NodeName)>,
) -> Option<CandidatePath> {
    if !topo.contains(src) || !topo.contains(dst) {
        return None;
    }
    let mut heap = BinaryHeap::new();
    heap.push(Reverse((0u64, vec![src])));
    let mut settled = FxHashSet::default();
    while let Some(Reverse((cost, nodes))) = heap.pop() {
        let &last = nodes.last()?;
        if !settled.insert(last) {
            continue;
        }
        if last == dst {
            return Some(CandidatePath { nodes, cost });
        }
        for (next, residual) in topo.neighbors(last) {
            if settled.contains(&next) || banned_nodes.contains(&next) {
                continue;
            }
            if banned_edges.contains(&edge_key(last, next)) {
                continue;
            }
            let mut extended = nodes.clone();
            extended.push(next);
            heap.push(Reverse((cost + residual.into_u64(), extended)));
        }
    }
    None
}

fn path_cost(topo: &Topology, nodes: &[NodeName]) -> Option<u64> {
    nodes
        .windows(2)
        .map(|pair| topo.residual(pair[0], pair[1]).map(Mbps::into_u64))
        .sum()
}

fn edge_key(a: NodeName, b: NodeName) -> (NodeName, NodeName) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
