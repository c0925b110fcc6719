//! Utilities for writing tests: canned topologies, a recording mock agent,
//! and a fully wired orchestrator harness.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::adapter::{ControllerAdapter, FlowProgram};
use crate::agent::{AgentError, DataPlaneAgent, PortIndex};
use crate::allocator::Allocator;
use crate::config::Config;
use crate::ledger::TunnelLedger;
use crate::network::{csv, Link, MacAddr, NodeName, Topology};
use crate::store::TopologyStore;
use crate::tunnel::{PortAssignment, Tunnel, TunnelId};
use crate::units::Mbps;

/// The spec's triangle: two hosts, three switches, and a 60 Mbps direct link
/// shadowed by a wide detour.
pub(crate) fn triangle_config() -> Vec<Link> {
    let link = |a: &str, b: &str, bw: u64| {
        Link::new(a.parse().unwrap(), b.parse().unwrap(), Mbps::new(bw))
    };
    vec![
        link("h1", "s1", 100),
        link("h2", "s2", 100),
        link("s1", "s2", 60),
        link("s1", "s3", 100),
        link("s3", "s2", 100),
    ]
}

/// Two host/switch islands with no link between them.
pub(crate) fn split_config() -> Vec<Link> {
    let link = |a: &str, b: &str, bw: u64| {
        Link::new(a.parse().unwrap(), b.parse().unwrap(), Mbps::new(bw))
    };
    vec![link("h1", "s1", 100), link("h2", "s2", 100)]
}

/// Builds a tunnel record with the conventional derived port
/// (`5001 + id`).
pub(crate) fn tunnel(id: u64, path: &[&str], rate: u64) -> Tunnel {
    Tunnel {
        id: TunnelId::new(id),
        path: path.iter().map(|s| s.parse().unwrap()).collect(),
        rate: Mbps::new(rate),
        tcp_port: 5001 + id as u16,
        bidirectional: true,
    }
}

/// Nudges a file's mtime forward so polling readers see an external edit
/// even on filesystems with coarse timestamps.
pub(crate) fn bump_mtime(path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new().append(true).open(path)?;
    file.set_modified(SystemTime::now() + Duration::from_secs(2))
}

/// Everything an agent was asked to do, in order.
#[derive(Debug, Clone)]
pub(crate) enum AgentCall {
    QueryPorts {
        path: Vec<NodeName>,
    },
    InstallFlow {
        tunnel: TunnelId,
        tcp_port: u16,
    },
    DeleteFlow {
        tunnel: TunnelId,
        tcp_port: u16,
    },
    SetLinkBw {
        a: NodeName,
        b: NodeName,
        bw: Mbps,
    },
    StaticArp {
        host: NodeName,
        ip: Ipv4Addr,
        mac: MacAddr,
    },
}

/// A recording agent with scriptable failures. Failures are reported as
/// HTTP 503 so they count as transient.
#[derive(Debug)]
pub(crate) struct MockAgent {
    ports: PortIndex,
    calls: Mutex<Vec<AgentCall>>,
    fail_installs: Mutex<usize>,
    fail_deletes: Mutex<usize>,
}

impl MockAgent {
    pub(crate) fn new(topology: &Topology) -> Self {
        Self {
            ports: PortIndex::new(topology),
            calls: Mutex::new(Vec::new()),
            fail_installs: Mutex::new(0),
            fail_deletes: Mutex::new(0),
        }
    }

    pub(crate) fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn install_attempts(&self) -> usize {
        self.count(|c| matches!(c, AgentCall::InstallFlow { .. }))
    }

    pub(crate) fn delete_attempts(&self) -> usize {
        self.count(|c| matches!(c, AgentCall::DeleteFlow { .. }))
    }

    pub(crate) fn fail_next_installs(&self, n: usize) {
        *self.fail_installs.lock().unwrap() = n;
    }

    pub(crate) fn fail_next_deletes(&self, n: usize) {
        *self.fail_deletes.lock().unwrap() = n;
    }

    fn count(&self, pred: impl Fn(&AgentCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: AgentCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_failure(&self, counter: &Mutex<usize>) -> Result<(), AgentError> {
        let mut n = counter.lock().unwrap();
        if *n > 0 {
            *n = n.saturating_sub(1);
            return Err(AgentError::Rejected { status: 503 });
        }
        Ok(())
    }
}

impl DataPlaneAgent for MockAgent {
    fn query_ports(&self, path: &[NodeName]) -> Result<PortAssignment, AgentError> {
        self.record(AgentCall::QueryPorts {
            path: path.to_vec(),
        });
        self.ports.assignment(path)
    }

    fn install_flow(&self, program: &FlowProgram) -> Result<(), AgentError> {
        self.record(AgentCall::InstallFlow {
            tunnel: program.tunnel,
            tcp_port: program.tcp_port,
        });
        self.take_failure(&self.fail_installs)
    }

    fn delete_flow(&self, program: &FlowProgram) -> Result<(), AgentError> {
        self.record(AgentCall::DeleteFlow {
            tunnel: program.tunnel,
            tcp_port: program.tcp_port,
        });
        self.take_failure(&self.fail_deletes)
    }

    fn set_link_bw(&self, a: NodeName, b: NodeName, bw: Mbps) -> Result<(), AgentError> {
        self.record(AgentCall::SetLinkBw { a, b, bw });
        Ok(())
    }

    fn static_arp(&self, host: NodeName, ip: Ipv4Addr, mac: MacAddr) -> Result<(), AgentError> {
        self.record(AgentCall::StaticArp { host, ip, mac });
        Ok(())
    }

    fn ping(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

/// A fully wired orchestrator over a temporary data directory and a mock
/// agent.
#[derive(Debug)]
pub(crate) struct Harness {
    pub(crate) dir: tempfile::TempDir,
    pub(crate) store: Arc<TopologyStore>,
    pub(crate) ledger: Arc<TunnelLedger>,
    pub(crate) agent: Arc<MockAgent>,
    pub(crate) adapter: Arc<ControllerAdapter>,
    pub(crate) allocator: Allocator,
}

impl Harness {
    pub(crate) fn triangle() -> anyhow::Result<Self> {
        Self::with_links(&triangle_config())
    }

    pub(crate) fn with_links(links: &[Link]) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let initial = dir.path().join("initial_topology.csv");
        std::fs::write(&initial, csv::format_links(links.iter().copied()))?;
        Self::open_existing(dir)
    }

    /// Simulates a process restart: tears everything down and reopens the
    /// orchestrator over the same data directory with a fresh agent.
    pub(crate) fn reopen(self) -> anyhow::Result<Self> {
        let Harness { dir, .. } = self;
        Self::open_existing(dir)
    }

    fn open_existing(dir: tempfile::TempDir) -> anyhow::Result<Self> {
        let initial = dir.path().join("initial_topology.csv");
        let store = Arc::new(TopologyStore::open(
            &initial,
            dir.path().join("running_network.csv"),
        )?);
        let ledger = Arc::new(TunnelLedger::open(dir.path().join("allocated_flows.csv"))?);
        let agent = Arc::new(MockAgent::new(&store.snapshot()));
        let config = Config::builder()
            .retry_backoff(Duration::from_millis(1))
            .build();
        let adapter = Arc::new(ControllerAdapter::new(
            Arc::clone(&agent) as Arc<dyn DataPlaneAgent>,
            config.max_switches,
            config.retry_limit,
            config.retry_backoff,
        ));
        let allocator = Allocator::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&adapter),
            config,
        );
        Ok(Self {
            dir,
            store,
            ledger,
            agent,
            adapter,
            allocator,
        })
    }

    pub(crate) fn ledger_path(&self) -> PathBuf {
        self.dir.path().join("allocated_flows.csv")
    }

    /// Asserts invariant 1: for every link, the initial capacity equals the
    /// current residual plus the rates of active tunnels crossing it.
    pub(crate) fn check_capacity_conservation(&self) {
        let initial = self.store.initial();
        let current = self.store.snapshot();
        let tunnels = self.ledger.list();
        for chan in initial.channels() {
            let reserved: u64 = tunnels
                .iter()
                .filter(|t| t.links().iter().any(|&(a, b)| chan.joins(a, b)))
                .map(|t| t.rate.into_u64())
                .sum();
            let residual = current
                .residual(chan.a, chan.b)
                .map(Mbps::into_u64)
                .unwrap_or_default();
            assert_eq!(
                chan.residual.into_u64(),
                residual + reserved,
                "capacity conservation violated on {}-{}",
                chan.a,
                chan.b
            );
        }
    }
}
