//! Tunnel records: the unit of allocation, plus the addressing data derived
//! from a tunnel's endpoints at install time.

use std::net::Ipv4Addr;

use rustc_hash::FxHashMap;

use crate::network::{MacAddr, NodeName, PortNo};
use crate::units::Mbps;

identifier!(TunnelId, u64);

/// An allocated reservation: traffic between two hosts on a dedicated TCP
/// port, pinned to a path with a guaranteed rate.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Tunnel {
    pub id: TunnelId,
    /// Ordered node sequence: host endpoints, switch interior, length >= 3.
    pub path: Vec<NodeName>,
    pub rate: Mbps,
    pub tcp_port: u16,
    #[serde(default = "default_bidirectional")]
    pub bidirectional: bool,
}

fn default_bidirectional() -> bool {
    true
}

impl Tunnel {
    /// Checks the structural invariants of the record: path shape, host
    /// endpoints, switch interior, positive rate.
    pub fn validate(&self) -> Result<(), InvalidTunnel> {
        if self.path.len() < 3 {
            return Err(InvalidTunnel::PathTooShort(self.path.len()));
        }
        self.endpoints()?;
        for &node in &self.path[1..self.path.len() - 1] {
            if !node.is_switch() {
                return Err(InvalidTunnel::InteriorNotSwitch(node));
            }
        }
        if self.rate == Mbps::ZERO {
            return Err(InvalidTunnel::ZeroRate);
        }
        Ok(())
    }

    /// The source host.
    pub fn src(&self) -> Option<NodeName> {
        self.path.first().copied()
    }

    /// The destination host.
    pub fn dst(&self) -> Option<NodeName> {
        self.path.last().copied()
    }

    /// The interior switches, in path order.
    pub fn interior(&self) -> &[NodeName] {
        if self.path.len() < 3 {
            &[]
        } else {
            &self.path[1..self.path.len() - 1]
        }
    }

    /// The traversed links as unordered pairs, in path order.
    pub fn links(&self) -> Vec<(NodeName, NodeName)> {
        self.path
            .windows(2)
            .map(|pair| (pair[0], pair[1]))
            .collect()
    }

    /// Resolves the endpoint addressing of the tunnel.
    pub fn endpoints(&self) -> Result<Endpoints, InvalidTunnel> {
        let addrs = |name: Option<NodeName>| {
            let name = name.ok_or(InvalidTunnel::PathTooShort(self.path.len()))?;
            match (name.host_ip(), name.host_mac()) {
                (Some(ip), Some(mac)) => Ok((name, ip, mac)),
                _ => Err(InvalidTunnel::EndpointNotHost(name)),
            }
        };
        let (src, src_ip, src_mac) = addrs(self.src())?;
        let (dst, dst_ip, dst_mac) = addrs(self.dst())?;
        Ok(Endpoints {
            src,
            dst,
            src_ip,
            dst_ip,
            src_mac,
            dst_mac,
        })
    }

    /// The reconciler identity of this tunnel's installed state.
    pub fn fingerprint(&self) -> Result<Fingerprint, InvalidTunnel> {
        let Endpoints {
            src_ip, dst_ip, ..
        } = self.endpoints()?;
        Ok(Fingerprint {
            src_ip,
            dst_ip,
            tcp_port: self.tcp_port,
        })
    }
}

/// Addressing data derived from a tunnel's endpoint names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub src: NodeName,
    pub dst: NodeName,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
}

/// The identity under which an installed tunnel is tracked by the
/// reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub tcp_port: u16,
}

/// The physical port indices a tunnel's interior switches use, as reported
/// by the data-plane agent.
#[derive(Debug, Clone, Default)]
pub struct PortAssignment {
    /// Per interior switch: the port toward the next hop (forward output).
    pub out_ports: FxHashMap<NodeName, PortNo>,
    /// Per interior switch: the port toward the previous hop (reverse
    /// output).
    pub in_ports: FxHashMap<NodeName, PortNo>,
    /// The traversed links, in path order.
    pub links: Vec<(NodeName, NodeName)>,
}

/// The reasons a tunnel record is structurally invalid.
#[derive(Debug, thiserror::Error)]
pub enum InvalidTunnel {
    /// The path has fewer than three nodes.
    #[error("tunnel path has {0} nodes (expected at least 3)")]
    PathTooShort(usize),

    /// A path endpoint that is not an addressable host.
    #[error("tunnel endpoint {0} is not an addressable host")]
    EndpointNotHost(NodeName),

    /// An interior path node that is not a switch.
    #[error("tunnel interior node {0} is not a switch")]
    InteriorNotSwitch(NodeName),

    /// A zero-rate reservation.
    #[error("tunnel rate must be positive")]
    ZeroRate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn valid_tunnel_passes_validation() -> anyhow::Result<()> {
        let tunnel = testing::tunnel(1, &["h1", "s1", "s2", "h2"], 50);
        tunnel.validate()?;
        assert_eq!(tunnel.interior(), ["s1".parse()?, "s2".parse()?]);
        assert_eq!(tunnel.links().len(), 3);
        Ok(())
    }

    #[test]
    fn endpoints_resolve_addresses() -> anyhow::Result<()> {
        let tunnel = testing::tunnel(1, &["h1", "s1", "s2", "h2"], 50);
        let ep = tunnel.endpoints()?;
        assert_eq!(ep.src_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ep.dst_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ep.src_mac.to_string(), "00:00:00:00:00:01");
        assert_eq!(ep.dst_mac.to_string(), "00:00:00:00:00:02");
        Ok(())
    }

    #[test]
    fn short_path_fails() {
        let tunnel = testing::tunnel(1, &["h1", "h2"], 50);
        assert!(matches!(
            tunnel.validate(),
            Err(InvalidTunnel::PathTooShort(2))
        ));
    }

    #[test]
    fn switch_endpoint_fails() {
        let tunnel = testing::tunnel(1, &["s1", "s2", "h2"], 50);
        assert!(matches!(
            tunnel.validate(),
            Err(InvalidTunnel::EndpointNotHost(..))
        ));
    }

    #[test]
    fn host_interior_fails() {
        let tunnel = testing::tunnel(1, &["h1", "h3", "h2"], 50);
        assert!(matches!(
            tunnel.validate(),
            Err(InvalidTunnel::InteriorNotSwitch(..))
        ));
    }

    #[test]
    fn zero_rate_fails() {
        let tunnel = testing::tunnel(1, &["h1", "s1", "s2", "h2"], 0);
        assert!(matches!(tunnel.validate(), Err(InvalidTunnel::ZeroRate)));
    }
}
