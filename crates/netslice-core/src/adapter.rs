//! The controller adapter: translates tunnels into per-switch flow programs
//! and drives the agent to materialise them, with bounded retries.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::agent::{AgentError, DataPlaneAgent};
use crate::network::{Dpid, MacAddr, NodeName, PortNo};
use crate::tunnel::{InvalidTunnel, PortAssignment, Tunnel, TunnelId};
use crate::units::Mbps;

/// The rules implementing one tunnel on the switches it traverses, plus the
/// summary fields the agent RPC carries.
#[derive(Debug, Clone)]
pub struct FlowProgram {
    pub tunnel: TunnelId,
    pub path: Vec<NodeName>,
    pub tcp_port: u16,
    pub rate: Mbps,
    pub bidirectional: bool,
    pub rules: Vec<FlowRule>,
}

/// One match→action rule on one switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    pub switch: NodeName,
    pub dpid: Dpid,
    pub priority: u16,
    pub matches: RuleMatch,
    pub action: FlowAction,
}

/// What a rule matches: everything (the default-drop rule) or one direction
/// of a tunnel's traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    Any,
    Tunnel(FlowMatch),
}

/// The match fields pinning one direction of a tunnel. The TCP side is a
/// tagged variant: forward traffic is matched on its destination port,
/// reverse traffic on its source port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMatch {
    pub eth_type: u16,
    pub ip_proto: u8,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub tcp: TcpPortMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpPortMatch {
    Dst(u16),
    Src(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    Output(PortNo),
    Drop,
}

const ETH_TYPE_IPV4: u16 = 0x0800;
const IP_PROTO_TCP: u8 = 6;
const RULE_PRIORITY: u16 = 100;

/// Per-switch program lifecycle, driven by reconciler calls. Absence from
/// the state table is the `Absent` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleState {
    Pending,
    Installed,
    PendingDelete,
}

/// Translates ledger records into flow programs and pushes them through the
/// data-plane agent, tracking per-switch install state.
pub struct ControllerAdapter {
    agent: Arc<dyn DataPlaneAgent>,
    max_switches: u64,
    retry_limit: u32,
    retry_backoff: Duration,
    states: Mutex<FxHashMap<(TunnelId, Dpid), RuleState>>,
    handshaken: Mutex<FxHashSet<Dpid>>,
}

impl std::fmt::Debug for ControllerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerAdapter")
            .field("max_switches", &self.max_switches)
            .field("retry_limit", &self.retry_limit)
            .finish_non_exhaustive()
    }
}

impl ControllerAdapter {
    pub fn new(
        agent: Arc<dyn DataPlaneAgent>,
        max_switches: u64,
        retry_limit: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            agent,
            max_switches,
            retry_limit,
            retry_backoff,
            states: Mutex::new(FxHashMap::default()),
            handshaken: Mutex::new(FxHashSet::default()),
        }
    }

    /// Resolves a datapath ID to its switch name, for datapaths within the
    /// configured bound.
    pub fn dpid_to_name(&self, dpid: Dpid) -> Option<NodeName> {
        (1..=self.max_switches)
            .contains(&dpid.inner())
            .then(|| NodeName::switch(dpid.inner()))
    }

    /// The priority-0 catch-all drop rule installed once per switch at
    /// feature-handshake time.
    pub fn default_drop(switch: NodeName, dpid: Dpid) -> FlowRule {
        FlowRule {
            switch,
            dpid,
            priority: 0,
            matches: RuleMatch::Any,
            action: FlowAction::Drop,
        }
    }

    /// Builds the full flow program for a tunnel: per interior switch, a
    /// priority-100 forward rule and, when bidirectional, a reverse rule.
    pub fn program(&self, tunnel: &Tunnel) -> Result<FlowProgram, AdapterError> {
        tunnel.validate()?;
        let ports = self.agent.query_ports(&tunnel.path)?;
        self.program_with_ports(tunnel, &ports)
    }

    fn program_with_ports(
        &self,
        tunnel: &Tunnel,
        ports: &PortAssignment,
    ) -> Result<FlowProgram, AdapterError> {
        let ep = tunnel.endpoints()?;
        let mut rules = Vec::new();
        for &sw in tunnel.interior() {
            let dpid = sw.dpid().ok_or(AdapterError::MissingPort(sw))?;
            if dpid.inner() > self.max_switches {
                return Err(AdapterError::UnknownDatapath {
                    switch: sw,
                    max: self.max_switches,
                });
            }
            let port_of = |map: &FxHashMap<NodeName, PortNo>| {
                map.get(&sw).copied().ok_or(AdapterError::MissingPort(sw))
            };
            rules.push(FlowRule {
                switch: sw,
                dpid,
                priority: RULE_PRIORITY,
                matches: RuleMatch::Tunnel(FlowMatch {
                    eth_type: ETH_TYPE_IPV4,
                    ip_proto: IP_PROTO_TCP,
                    src_mac: ep.src_mac,
                    dst_mac: ep.dst_mac,
                    src_ip: ep.src_ip,
                    dst_ip: ep.dst_ip,
                    tcp: TcpPortMatch::Dst(tunnel.tcp_port),
                }),
                action: FlowAction::Output(port_of(&ports.out_ports)?),
            });
            if tunnel.bidirectional {
                rules.push(FlowRule {
                    switch: sw,
                    dpid,
                    priority: RULE_PRIORITY,
                    matches: RuleMatch::Tunnel(FlowMatch {
                        eth_type: ETH_TYPE_IPV4,
                        ip_proto: IP_PROTO_TCP,
                        src_mac: ep.dst_mac,
                        dst_mac: ep.src_mac,
                        src_ip: ep.dst_ip,
                        dst_ip: ep.src_ip,
                        tcp: TcpPortMatch::Src(tunnel.tcp_port),
                    }),
                    action: FlowAction::Output(port_of(&ports.in_ports)?),
                });
            }
        }
        Ok(FlowProgram {
            tunnel: tunnel.id,
            path: tunnel.path.clone(),
            tcp_port: tunnel.tcp_port,
            rate: tunnel.rate,
            bidirectional: tunnel.bidirectional,
            rules,
        })
    }

    /// Materialises a tunnel on the data plane: flow rules, per-link
    /// shaping, and static ARP entries on both endpoints. Idempotent; safe
    /// to call for an already-installed tunnel.
    pub fn install(&self, tunnel: &Tunnel) -> Result<(), AdapterError> {
        tunnel.validate()?;
        let ep = tunnel.endpoints()?;
        let ports = self.agent.query_ports(&tunnel.path)?;
        let program = self.program_with_ports(tunnel, &ports)?;
        for rule in &program.rules {
            self.ensure_handshake(rule.switch, rule.dpid);
        }
        self.mark(&program, RuleState::Pending);
        if let Err(err) = self.with_retry(|| self.agent.install_flow(&program)) {
            self.clear(&program);
            return Err(err.into());
        }
        self.mark(&program, RuleState::Installed);
        for &(a, b) in &ports.links {
            self.agent.set_link_bw(a, b, tunnel.rate)?;
        }
        self.agent.static_arp(ep.src, ep.dst_ip, ep.dst_mac)?;
        self.agent.static_arp(ep.dst, ep.src_ip, ep.src_mac)?;
        info!(tunnel = %tunnel.id, tcp_port = tunnel.tcp_port, "flow program installed");
        Ok(())
    }

    /// Removes a tunnel's flow program from the data plane.
    pub fn remove(&self, tunnel: &Tunnel) -> Result<(), AdapterError> {
        tunnel.validate()?;
        let ports = self.agent.query_ports(&tunnel.path)?;
        let program = self.program_with_ports(tunnel, &ports)?;
        self.mark(&program, RuleState::PendingDelete);
        let res = self.with_retry(|| self.agent.delete_flow(&program));
        self.clear(&program);
        res?;
        info!(tunnel = %tunnel.id, tcp_port = tunnel.tcp_port, "flow program removed");
        Ok(())
    }

    /// Returns the lifecycle state of a tunnel's program on one datapath;
    /// `None` means `Absent`.
    pub fn state(&self, tunnel: TunnelId, dpid: Dpid) -> Option<RuleState> {
        lock(&self.states).get(&(tunnel, dpid)).copied()
    }

    fn ensure_handshake(&self, switch: NodeName, dpid: Dpid) {
        let mut handshaken = lock(&self.handshaken);
        if handshaken.insert(dpid) {
            // One default-drop rule per datapath; the wire encoder delivers
            // it at feature handshake.
            let rule = Self::default_drop(switch, dpid);
            debug!(?rule, %switch, "default drop staged");
        }
    }

    fn with_retry(
        &self,
        mut op: impl FnMut() -> Result<(), AgentError>,
    ) -> Result<(), AgentError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retry_limit && is_transient(&err) => {
                    attempt += 1;
                    warn!(%err, attempt, "transient agent error, backing off");
                    std::thread::sleep(self.retry_backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn mark(&self, program: &FlowProgram, state: RuleState) {
        let mut states = lock(&self.states);
        for rule in &program.rules {
            states.insert((program.tunnel, rule.dpid), state);
        }
    }

    fn clear(&self, program: &FlowProgram) {
        let mut states = lock(&self.states);
        for rule in &program.rules {
            states.remove(&(program.tunnel, rule.dpid));
        }
    }
}

fn is_transient(err: &AgentError) -> bool {
    match err {
        AgentError::Unavailable(_) => true,
        AgentError::Rejected { status } => *status >= 500,
        _ => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The adapter's error type.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The agent failed the operation.
    #[error("agent operation failed")]
    Agent(#[from] AgentError),

    /// The tunnel record is structurally invalid.
    #[error(transparent)]
    InvalidTunnel(#[from] InvalidTunnel),

    /// A switch outside the datapath map.
    #[error("switch {switch} is outside the datapath map (max {max} switches)")]
    UnknownDatapath {
        /// The offending switch.
        switch: NodeName,
        /// The configured bound.
        max: u64,
    },

    /// The port assignment does not cover an interior switch.
    #[error("no port assignment for {0}")]
    MissingPort(NodeName),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Link, Topology};
    use crate::testing::{self, AgentCall, MockAgent};

    fn adapter_with(agent: Arc<MockAgent>) -> ControllerAdapter {
        ControllerAdapter::new(agent, 20, 3, Duration::from_millis(1))
    }

    #[test]
    fn program_has_one_rule_pair_per_interior_switch() -> anyhow::Result<()> {
        let agent = Arc::new(MockAgent::new(&Topology::new(&testing::triangle_config())?));
        let adapter = adapter_with(agent);
        let tunnel = testing::tunnel(1, &["h1", "s1", "s2", "h2"], 50);
        let program = adapter.program(&tunnel)?;
        assert_eq!(program.rules.len(), 4);

        let forward = &program.rules[0];
        assert_eq!(forward.priority, 100);
        let RuleMatch::Tunnel(m) = &forward.matches else {
            panic!("expected a tunnel match");
        };
        assert_eq!(m.eth_type, 0x0800);
        assert_eq!(m.ip_proto, 6);
        assert_eq!(m.tcp, TcpPortMatch::Dst(5002));
        assert_eq!(forward.action, FlowAction::Output(PortNo::new(2)));

        let reverse = &program.rules[1];
        let RuleMatch::Tunnel(m) = &reverse.matches else {
            panic!("expected a tunnel match");
        };
        assert_eq!(m.tcp, TcpPortMatch::Src(5002));
        assert_eq!(m.src_ip.to_string(), "10.0.0.2");
        assert_eq!(reverse.action, FlowAction::Output(PortNo::new(1)));
        Ok(())
    }

    #[test]
    fn unidirectional_program_has_forward_rules_only() -> anyhow::Result<()> {
        let agent = Arc::new(MockAgent::new(&Topology::new(&testing::triangle_config())?));
        let adapter = adapter_with(agent);
        let mut tunnel = testing::tunnel(1, &["h1", "s1", "s2", "h2"], 50);
        tunnel.bidirectional = false;
        let program = adapter.program(&tunnel)?;
        assert_eq!(program.rules.len(), 2);
        assert!(program.rules.iter().all(|r| matches!(
            r.matches,
            RuleMatch::Tunnel(FlowMatch {
                tcp: TcpPortMatch::Dst(..),
                ..
            })
        )));
        Ok(())
    }

    #[test]
    fn install_pushes_rules_shaping_and_arp() -> anyhow::Result<()> {
        let agent = Arc::new(MockAgent::new(&Topology::new(&testing::triangle_config())?));
        let adapter = adapter_with(agent.clone());
        let tunnel = testing::tunnel(1, &["h1", "s1", "s2", "h2"], 50);
        adapter.install(&tunnel)?;
        let calls = agent.calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, AgentCall::QueryPorts { path } if *path == tunnel.path)));
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, AgentCall::InstallFlow { tunnel: id, tcp_port: 5002 }
                    if *id == tunnel.id))
                .count(),
            1
        );
        let shaped = calls
            .iter()
            .filter_map(|c| match c {
                AgentCall::SetLinkBw { a, b, bw } => {
                    assert_eq!(*bw, tunnel.rate);
                    Some((a.to_string(), b.to_string()))
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            shaped,
            [
                ("h1".into(), "s1".into()),
                ("s1".into(), "s2".into()),
                ("s2".into(), "h2".into())
            ],
            "one shaper update per traversed link"
        );
        let arps = calls
            .iter()
            .filter_map(|c| match c {
                AgentCall::StaticArp { host, ip, mac } => {
                    Some((host.to_string(), ip.to_string(), mac.to_string()))
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            arps,
            [
                ("h1".into(), "10.0.0.2".into(), "00:00:00:00:00:02".into()),
                ("h2".into(), "10.0.0.1".into(), "00:00:00:00:00:01".into())
            ],
            "each endpoint learns its peer"
        );
        Ok(())
    }

    #[test]
    fn install_retries_transient_errors() -> anyhow::Result<()> {
        let agent = Arc::new(MockAgent::new(&Topology::new(&testing::triangle_config())?));
        agent.fail_next_installs(2);
        let adapter = adapter_with(agent.clone());
        let tunnel = testing::tunnel(1, &["h1", "s1", "s2", "h2"], 50);
        adapter.install(&tunnel)?;
        assert_eq!(agent.install_attempts(), 3);
        Ok(())
    }

    #[test]
    fn install_gives_up_after_exhausting_retries() -> anyhow::Result<()> {
        let agent = Arc::new(MockAgent::new(&Topology::new(&testing::triangle_config())?));
        agent.fail_next_installs(usize::MAX);
        let adapter = adapter_with(agent.clone());
        let tunnel = testing::tunnel(1, &["h1", "s1", "s2", "h2"], 50);
        let res = adapter.install(&tunnel);
        assert!(matches!(res, Err(AdapterError::Agent(..))));
        assert_eq!(agent.install_attempts(), 4, "initial attempt plus 3 retries");
        Ok(())
    }

    #[test]
    fn program_state_follows_the_lifecycle() -> anyhow::Result<()> {
        let agent = Arc::new(MockAgent::new(&Topology::new(&testing::triangle_config())?));
        let adapter = adapter_with(agent.clone());
        let tunnel = testing::tunnel(1, &["h1", "s1", "s2", "h2"], 50);
        let s1 = Dpid::new(1);

        assert_eq!(adapter.state(tunnel.id, s1), None);
        adapter.install(&tunnel)?;
        assert_eq!(adapter.state(tunnel.id, s1), Some(RuleState::Installed));
        adapter.remove(&tunnel)?;
        assert_eq!(adapter.state(tunnel.id, s1), None);

        // A failed install rolls the state back to absent.
        agent.fail_next_installs(usize::MAX);
        assert!(adapter.install(&tunnel).is_err());
        assert_eq!(adapter.state(tunnel.id, s1), None);
        Ok(())
    }

    #[test]
    fn oversized_dpid_is_rejected() -> anyhow::Result<()> {
        let links = [
            Link::new("h1".parse()?, "s21".parse()?, Mbps::new(100)),
            Link::new("h2".parse()?, "s21".parse()?, Mbps::new(100)),
        ];
        let agent = Arc::new(MockAgent::new(&Topology::new(&links)?));
        let adapter = adapter_with(agent);
        let tunnel = testing::tunnel(1, &["h1", "s21", "h2"], 50);
        assert!(matches!(
            adapter.program(&tunnel),
            Err(AdapterError::UnknownDatapath { .. })
        ));
        Ok(())
    }

    #[test]
    fn dpid_map_is_bounded() {
        let agent = Arc::new(MockAgent::new(
            &Topology::new(&testing::triangle_config()).unwrap(),
        ));
        let adapter = adapter_with(agent);
        assert_eq!(
            adapter.dpid_to_name(Dpid::new(3)),
            Some(NodeName::switch(3))
        );
        assert_eq!(adapter.dpid_to_name(Dpid::new(21)), None);
        assert_eq!(adapter.dpid_to_name(Dpid::new(0)), None);
    }
}
