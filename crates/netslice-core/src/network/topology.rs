//! The undirected weighted graph model of the sliced network.

use petgraph::graph::{EdgeIndex, NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use rustc_hash::FxHashMap;

use crate::network::types::{Link, Node, NodeKind, NodeName};
use crate::units::Mbps;

/// A network topology: hosts and switches joined by undirected links carrying
/// a residual capacity.
///
/// Cloning a `Topology` yields an independent snapshot; the store hands these
/// out so path searches never hold its lock.
#[derive(Debug, Clone)]
pub struct Topology {
    pub(crate) graph: UnGraph<Node, Channel>,
    pub(crate) id2idx: FxHashMap<NodeName, NodeIndex>,
}

/// The edge payload: the link's endpoints and its current residual capacity.
#[derive(Debug, Clone)]
pub struct Channel {
    pub a: NodeName,
    pub b: NodeName,
    pub residual: Mbps,
}

impl Channel {
    /// Whether this channel joins the given unordered pair.
    pub fn joins(&self, a: NodeName, b: NodeName) -> bool {
        (self.a == a && self.b == b) || (self.a == b && self.b == a)
    }
}

impl Topology {
    /// Creates a topology from a list of links; nodes are inferred from link
    /// endpoints in order of first appearance.
    ///
    /// Correctness properties:
    ///
    /// - Every link must have distinct endpoints.
    /// - For any two nodes, there must be at most one link between them.
    /// - Every host must be incident to exactly one link, and its peer must
    ///   be a switch.
    /// - Every host suffix must fit the `10.0.0.N` addressing scheme.
    pub fn new(links: &[Link]) -> Result<Self, TopologyError> {
        let mut graph = UnGraph::new_undirected();
        let mut id2idx = FxHashMap::default();
        let mut idx_of = |graph: &mut UnGraph<Node, Channel>, name: NodeName| {
            *id2idx
                .entry(name)
                .or_insert_with(|| graph.add_node(Node::new(name)))
        };
        for &Link { a, b, capacity } in links {
            // CORRECTNESS: Every link must have distinct endpoints.
            if a == b {
                return Err(TopologyError::NodeAdjacentSelf(a));
            }
            let (i, j) = (idx_of(&mut graph, a), idx_of(&mut graph, b));
            // CORRECTNESS: For any two nodes, there must be at most one link
            // between them.
            if graph.find_edge(i, j).is_some() {
                return Err(TopologyError::DuplicateLink { n1: a, n2: b });
            }
            graph.add_edge(
                i,
                j,
                Channel {
                    a,
                    b,
                    residual: capacity,
                },
            );
        }
        for idx in graph.node_indices() {
            let Node { name, kind } = graph[idx];
            if matches!(kind, NodeKind::Host) {
                // CORRECTNESS: Every host must be incident to exactly one
                // link, and its peer must be a switch.
                let peers = graph.neighbors(idx).collect::<Vec<_>>();
                if peers.len() != 1 {
                    return Err(TopologyError::BadHostDegree {
                        host: name,
                        n: peers.len(),
                    });
                }
                let peer = graph[peers[0]].name;
                if !peer.is_switch() {
                    return Err(TopologyError::HostNotOnSwitch { host: name, peer });
                }
                // CORRECTNESS: Every host suffix must fit the `10.0.0.N`
                // addressing scheme.
                if name.host_ip().is_none() {
                    return Err(TopologyError::UnaddressableHost(name));
                }
            }
        }
        Ok(Self { graph, id2idx })
    }

    /// Returns the node with the given name, if any.
    pub fn node(&self, name: NodeName) -> Option<&Node> {
        self.idx_of(name).map(|idx| &self.graph[idx])
    }

    /// Whether a node with the given name exists.
    pub fn contains(&self, name: NodeName) -> bool {
        self.id2idx.contains_key(&name)
    }

    /// Returns the residual capacity of the link `{a,b}`, if it exists.
    pub fn residual(&self, a: NodeName, b: NodeName) -> Option<Mbps> {
        self.channel(a, b).map(|chan| chan.residual)
    }

    /// Returns the channel joining `{a,b}`, if it exists.
    pub fn channel(&self, a: NodeName, b: NodeName) -> Option<&Channel> {
        let eidx = self.edge_between(a, b)?;
        Some(&self.graph[eidx])
    }

    /// Returns each neighbor of `name` together with the residual capacity of
    /// the connecting link.
    pub fn neighbors(&self, name: NodeName) -> impl Iterator<Item = (NodeName, Mbps)> + '_ {
        self.idx_of(name).into_iter().flat_map(move |idx| {
            self.graph.edges(idx).map(move |edge| {
                let peer = if edge.source() == idx {
                    edge.target()
                } else {
                    edge.source()
                };
                (self.graph[peer].name, edge.weight().residual)
            })
        })
    }

    /// Returns the number of switches in the topology.
    pub fn nr_switches(&self) -> usize {
        self.nodes()
            .filter(|n| matches!(n.kind, NodeKind::Switch))
            .count()
    }

    /// Returns the links of the topology in insertion order, with current
    /// residuals.
    pub fn links(&self) -> impl Iterator<Item = Link> + '_ {
        self.channels().map(|chan| Link {
            a: chan.a,
            b: chan.b,
            capacity: chan.residual,
        })
    }

    pub(crate) fn set_residual(
        &mut self,
        a: NodeName,
        b: NodeName,
        residual: Mbps,
    ) -> Result<(), TopologyError> {
        let eidx = self
            .edge_between(a, b)
            .ok_or(TopologyError::UnknownLink { n1: a, n2: b })?;
        self.graph[eidx].residual = residual;
        Ok(())
    }

    fn edge_between(&self, a: NodeName, b: NodeName) -> Option<EdgeIndex> {
        let i = self.idx_of(a)?;
        let j = self.idx_of(b)?;
        self.graph.find_edge(i, j)
    }

    fn idx_of(&self, name: NodeName) -> Option<NodeIndex> {
        self.id2idx.get(&name).copied()
    }

    delegate::delegate! {
        to self.graph {
            /// Returns an iterator over all nodes in the topology.
            #[call(node_weights)]
            pub fn nodes(&self) -> impl Iterator<Item = &Node>;

            /// Returns an iterator over all channels in the topology.
            #[call(edge_weights)]
            pub fn channels(&self) -> impl Iterator<Item = &Channel>;

            /// Returns the number of links in the topology.
            #[call(edge_count)]
            pub fn nr_links(&self) -> usize;

            /// Returns the number of nodes in the topology.
            #[call(node_count)]
            pub fn nr_nodes(&self) -> usize;
        }
    }
}

/// An error type listing the reasons a topology is invalid.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// A node is connected to itself.
    #[error("node {0} is connected to itself")]
    NodeAdjacentSelf(NodeName),

    /// Duplicate link between two nodes.
    #[error("duplicate link between {n1} and {n2}")]
    DuplicateLink {
        /// The first node.
        n1: NodeName,
        /// The second node.
        n2: NodeName,
    },

    /// A host with a link count other than one.
    #[error("host {host} has {n} links (expected exactly 1)")]
    BadHostDegree {
        /// The host's name.
        host: NodeName,
        /// The actual number of links.
        n: usize,
    },

    /// A host linked to something other than a switch.
    #[error("host {host} is linked to {peer}, which is not a switch")]
    HostNotOnSwitch {
        /// The host's name.
        host: NodeName,
        /// The offending peer.
        peer: NodeName,
    },

    /// A host whose suffix does not fit the `10.0.0.N` addressing scheme.
    #[error("host {0} cannot be addressed as 10.0.0.N")]
    UnaddressableHost(NodeName),

    /// A link that does not exist in the topology.
    #[error("no link between {n1} and {n2}")]
    UnknownLink {
        /// The first node.
        n1: NodeName,
        /// The second node.
        n2: NodeName,
    },

    /// A malformed node name.
    #[error(transparent)]
    InvalidName(#[from] crate::network::types::InvalidNodeName),
}
