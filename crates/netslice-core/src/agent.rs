//! The data-plane agent: the seam between the control plane and the emulated
//! network.
//!
//! The core only ever talks to the [`DataPlaneAgent`] trait; [`HttpAgent`]
//! implements it as JSON over HTTP against the emulator's small RPC surface
//! (`/flow`, `/exec`, `/set_bw`).

use std::net::Ipv4Addr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::adapter::FlowProgram;
use crate::network::{MacAddr, NodeName, PortNo, Topology};
use crate::tunnel::PortAssignment;
use crate::units::Mbps;

/// The operations the core depends on. Each is synchronous with a bounded
/// timeout; failures surface as typed errors to the allocator.
pub trait DataPlaneAgent: Send + Sync {
    /// Resolves the physical port indices and traversed links for a path.
    fn query_ports(&self, path: &[NodeName]) -> Result<PortAssignment, AgentError>;

    /// Installs a tunnel's per-switch match→action rules.
    fn install_flow(&self, program: &FlowProgram) -> Result<(), AgentError>;

    /// Deletes a tunnel's per-switch match→action rules.
    fn delete_flow(&self, program: &FlowProgram) -> Result<(), AgentError>;

    /// Updates the link shaper on both interfaces of `{a,b}`.
    fn set_link_bw(&self, a: NodeName, b: NodeName, bw: Mbps) -> Result<(), AgentError>;

    /// Installs a static ARP entry on a host.
    fn static_arp(&self, host: NodeName, ip: Ipv4Addr, mac: MacAddr) -> Result<(), AgentError>;

    /// Reachability probe: succeeds if the agent answers at all.
    fn ping(&self) -> Result<(), AgentError>;
}

/// Physical port numbering derived from link declaration order: the emulator
/// assigns interface numbers per node in the order links are created, so the
/// index is computable from the topology itself.
#[derive(Debug, Clone)]
pub struct PortIndex {
    ports: FxHashMap<(NodeName, NodeName), PortNo>,
}

impl PortIndex {
    /// Builds the index from a topology's links in insertion order.
    pub fn new(topology: &Topology) -> Self {
        let mut next = FxHashMap::<NodeName, u32>::default();
        let mut ports = FxHashMap::default();
        for link in topology.links() {
            for (node, peer) in [(link.a, link.b), (link.b, link.a)] {
                let n = next.entry(node).or_insert(0);
                *n += 1;
                ports.insert((node, peer), PortNo::new(*n));
            }
        }
        Self { ports }
    }

    /// Resolves `out_ports`/`in_ports` for every interior switch of `path`.
    pub fn assignment(&self, path: &[NodeName]) -> Result<PortAssignment, AgentError> {
        let mut assignment = PortAssignment {
            links: path.windows(2).map(|pair| (pair[0], pair[1])).collect(),
            ..Default::default()
        };
        for (i, &sw) in path.iter().enumerate().skip(1).take(path.len().saturating_sub(2)) {
            let port = |from: NodeName, to: NodeName| {
                self.ports
                    .get(&(from, to))
                    .copied()
                    .ok_or(AgentError::UnknownLink { n1: from, n2: to })
            };
            assignment.out_ports.insert(sw, port(sw, path[i + 1])?);
            assignment.in_ports.insert(sw, port(sw, path[i - 1])?);
        }
        Ok(assignment)
    }
}

/// The JSON-over-HTTP agent client. Owns its own `tokio` runtime so callers
/// stay synchronous.
#[derive(Debug)]
pub struct HttpAgent {
    client: reqwest::Client,
    base: String,
    rt: tokio::runtime::Runtime,
    ports: PortIndex,
}

impl HttpAgent {
    /// Creates a client for the agent at `base_url` (e.g.
    /// `http://localhost:5000`) with the given per-request timeout.
    pub fn new(
        base_url: &str,
        topology: &Topology,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let rt = tokio::runtime::Runtime::new()?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AgentError::Unavailable)?;
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_owned(),
            rt,
            ports: PortIndex::new(topology),
        })
    }

    fn post<B: serde::Serialize>(&self, endpoint: &str, body: &B) -> Result<(), AgentError> {
        let url = format!("{}/{endpoint}", self.base);
        let response = self
            .rt
            .block_on(self.client.post(&url).json(body).send())
            .map_err(AgentError::Unavailable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Rejected {
                status: status.as_u16(),
            });
        }
        debug!(%url, "agent call ok");
        Ok(())
    }
}

#[derive(serde::Serialize)]
struct FlowBody {
    command: &'static str,
    path: Vec<String>,
    tcp_port: u16,
    rate: u64,
    bidirectional: bool,
}

impl FlowBody {
    fn new(command: &'static str, program: &FlowProgram) -> Self {
        Self {
            command,
            path: program.path.iter().map(|n| n.to_string()).collect(),
            tcp_port: program.tcp_port,
            rate: program.rate.into_u64(),
            bidirectional: program.bidirectional,
        }
    }
}

impl DataPlaneAgent for HttpAgent {
    fn query_ports(&self, path: &[NodeName]) -> Result<PortAssignment, AgentError> {
        self.ports.assignment(path)
    }

    fn install_flow(&self, program: &FlowProgram) -> Result<(), AgentError> {
        self.post("flow", &FlowBody::new("add", program))
    }

    fn delete_flow(&self, program: &FlowProgram) -> Result<(), AgentError> {
        self.post("flow", &FlowBody::new("delete", program))
    }

    fn set_link_bw(&self, a: NodeName, b: NodeName, bw: Mbps) -> Result<(), AgentError> {
        #[derive(serde::Serialize)]
        struct SetBwBody {
            node1: String,
            node2: String,
            bw: u64,
        }
        self.post(
            "set_bw",
            &SetBwBody {
                node1: a.to_string(),
                node2: b.to_string(),
                bw: bw.into_u64(),
            },
        )
    }

    fn static_arp(&self, host: NodeName, ip: Ipv4Addr, mac: MacAddr) -> Result<(), AgentError> {
        #[derive(serde::Serialize)]
        struct ExecBody {
            cmd: String,
        }
        self.post(
            "exec",
            &ExecBody {
                cmd: format!("{host} arp -s {ip} {mac}"),
            },
        )
    }

    fn ping(&self) -> Result<(), AgentError> {
        #[derive(serde::Serialize)]
        struct ExecBody {
            cmd: String,
        }
        // Any HTTP answer proves reachability; only transport errors count
        // as unreachable.
        let url = format!("{}/exec", self.base);
        self.rt
            .block_on(
                self.client
                    .post(&url)
                    .json(&ExecBody { cmd: String::new() })
                    .send(),
            )
            .map(|_| ())
            .map_err(AgentError::Unavailable)
    }
}

/// The agent's error type, split by whether the agent answered.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// RPC timeout or transport error.
    #[error("data-plane agent unreachable")]
    Unavailable(#[source] reqwest::Error),

    /// The agent answered with a non-2xx status.
    #[error("data-plane agent rejected the request (status {status})")]
    Rejected {
        /// The HTTP status code.
        status: u16,
    },

    /// A queried link does not exist on the agent's topology.
    #[error("agent has no link between {n1} and {n2}")]
    UnknownLink {
        /// The first node.
        n1: NodeName,
        /// The second node.
        n2: NodeName,
    },

    /// The agent runtime failed to start.
    #[error("failed to start the agent runtime")]
    Runtime(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn port_index_follows_declaration_order() -> anyhow::Result<()> {
        // triangle_config declares: h1-s1, h2-s2, s1-s2, s1-s3, s3-s2.
        let topo = Topology::new(&testing::triangle_config())?;
        let ports = PortIndex::new(&topo);
        let path: Vec<NodeName> = ["h1", "s1", "s2", "h2"]
            .iter()
            .map(|s| s.parse())
            .collect::<Result<_, _>>()?;
        let assignment = ports.assignment(&path)?;

        // s1 port 1 is h1 (declared first), port 2 is s2.
        let s1: NodeName = "s1".parse()?;
        let s2: NodeName = "s2".parse()?;
        assert_eq!(assignment.out_ports[&s1], PortNo::new(2));
        assert_eq!(assignment.in_ports[&s1], PortNo::new(1));
        // s2 port 1 is h2, port 2 is s1.
        assert_eq!(assignment.out_ports[&s2], PortNo::new(1));
        assert_eq!(assignment.in_ports[&s2], PortNo::new(2));
        assert_eq!(assignment.links.len(), 3);
        Ok(())
    }

    #[test]
    fn unknown_hop_fails() -> anyhow::Result<()> {
        let topo = Topology::new(&testing::triangle_config())?;
        let ports = PortIndex::new(&topo);
        let path: Vec<NodeName> = ["h1", "s1", "s9", "h2"]
            .iter()
            .map(|s| s.parse())
            .collect::<Result<_, _>>()?;
        assert!(matches!(
            ports.assignment(&path),
            Err(AgentError::UnknownLink { .. })
        ));
        Ok(())
    }
}
