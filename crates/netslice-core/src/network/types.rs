use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::units::Mbps;

identifier!(Dpid, u64);
identifier!(PortNo, u32);

/// A validated node name: `h<N>` for hosts, `s<N>` for switches, with `N` a
/// positive decimal suffix.
///
/// Hosts derive their data-plane addresses from the suffix (`10.0.0.N` and
/// `00:00:00:00:00:<N hex>`); switches derive their datapath ID from it.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct NodeName {
    kind: NodeKind,
    index: u64,
}

impl NodeName {
    /// Creates a host name `h<index>`.
    pub const fn host(index: u64) -> Self {
        Self {
            kind: NodeKind::Host,
            index,
        }
    }

    /// Creates a switch name `s<index>`.
    pub const fn switch(index: u64) -> Self {
        Self {
            kind: NodeKind::Switch,
            index,
        }
    }

    /// The kind encoded in the name's prefix.
    pub const fn kind(self) -> NodeKind {
        self.kind
    }

    /// The numeric suffix of the name.
    pub const fn index(self) -> u64 {
        self.index
    }

    /// Whether this names a host.
    pub const fn is_host(self) -> bool {
        matches!(self.kind, NodeKind::Host)
    }

    /// Whether this names a switch.
    pub const fn is_switch(self) -> bool {
        matches!(self.kind, NodeKind::Switch)
    }

    /// The host's assigned IPv4 address (`10.0.0.N`), or `None` for switches
    /// and for suffixes that do not fit in one octet.
    pub fn host_ip(self) -> Option<Ipv4Addr> {
        match self.kind {
            NodeKind::Host => u8::try_from(self.index)
                .ok()
                .map(|n| Ipv4Addr::new(10, 0, 0, n)),
            NodeKind::Switch => None,
        }
    }

    /// The host's assigned MAC address (`00:00:00:00:00:0N`), or `None` for
    /// switches and for suffixes that do not fit in one octet.
    pub fn host_mac(self) -> Option<MacAddr> {
        match self.kind {
            NodeKind::Host => u8::try_from(self.index)
                .ok()
                .map(|n| MacAddr([0, 0, 0, 0, 0, n])),
            NodeKind::Switch => None,
        }
    }

    /// The switch's datapath ID, or `None` for hosts.
    pub fn dpid(self) -> Option<Dpid> {
        match self.kind {
            NodeKind::Switch => Some(Dpid::new(self.index)),
            NodeKind::Host => None,
        }
    }
}

impl FromStr for NodeName {
    type Err = InvalidNodeName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidNodeName(s.to_owned());
        let (kind, suffix) = if let Some(rest) = s.strip_prefix('h') {
            (NodeKind::Host, rest)
        } else if let Some(rest) = s.strip_prefix('s') {
            (NodeKind::Switch, rest)
        } else {
            return Err(err());
        };
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let index = suffix.parse::<u64>().map_err(|_| err())?;
        if index == 0 {
            return Err(err());
        }
        Ok(Self { kind, index })
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            NodeKind::Host => 'h',
            NodeKind::Switch => 's',
        };
        write!(f, "{prefix}{}", self.index)
    }
}

impl TryFrom<String> for NodeName {
    type Error = InvalidNodeName;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NodeName> for String {
    fn from(name: NodeName) -> Self {
        name.to_string()
    }
}

/// The error produced when parsing a malformed node name.
#[derive(Debug, thiserror::Error)]
#[error("invalid node name `{0}` (expected `h<N>` or `s<N>`)")]
pub struct InvalidNodeName(pub String);

/// A 48-bit MAC address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Node {
    pub name: NodeName,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(name: NodeName) -> Self {
        Self {
            kind: name.kind(),
            name,
        }
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum NodeKind {
    Host,
    Switch,
}

/// A `Link` is an undirected channel between two nodes with a residual
/// capacity in Mbps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Link {
    pub a: NodeName,
    pub b: NodeName,
    pub capacity: Mbps,
}

impl Link {
    pub fn new(a: NodeName, b: NodeName, capacity: Mbps) -> Self {
        Self { a, b, capacity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_name_round_trips() {
        for s in ["h1", "h254", "s1", "s20"] {
            let name: NodeName = s.parse().unwrap();
            assert_eq!(name.to_string(), s);
        }
    }

    #[test]
    fn bad_node_names_fail() {
        for s in ["", "x1", "h", "s", "h0", "hx", "1h", "h-1", "H1"] {
            assert!(s.parse::<NodeName>().is_err(), "accepted {s:?}");
        }
    }

    #[test]
    fn host_addresses_derive_from_suffix() {
        let h5: NodeName = "h5".parse().unwrap();
        assert_eq!(h5.host_ip(), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(h5.host_mac().unwrap().to_string(), "00:00:00:00:00:05");

        let s3: NodeName = "s3".parse().unwrap();
        assert_eq!(s3.host_ip(), None);
        assert_eq!(s3.dpid(), Some(Dpid::new(3)));
    }
}
