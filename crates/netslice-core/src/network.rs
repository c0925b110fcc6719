//! The graph model: node and link types, the validated [`Topology`], and its
//! CSV interchange format.

pub mod csv;
pub mod topology;
pub mod types;

pub use topology::{Channel, Topology, TopologyError};
pub use types::{Dpid, InvalidNodeName, Link, MacAddr, Node, NodeKind, NodeName, PortNo};
