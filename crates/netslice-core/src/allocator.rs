//! The allocator: the transactional front door that turns requests into
//! tunnels.
//!
//! Allocation is a two-phase commit: the data plane is programmed first, and
//! only on success are capacity and the ledger committed. A final
//! `apply_delta` under the store lock re-checks capacity, so concurrent
//! allocations that raced on the same snapshot cannot oversubscribe a link;
//! the loser is rolled back on the agent side. Deallocation is
//! commit-then-notify: the ledger entry and capacity are always restored,
//! and agent-side failures surface as warnings.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::adapter::{AdapterError, ControllerAdapter};
use crate::config::Config;
use crate::ledger::{LedgerError, TunnelLedger};
use crate::network::NodeName;
use crate::routing::{self, PathError};
use crate::store::{StoreError, TopologyStore};
use crate::tunnel::{Tunnel, TunnelId};
use crate::units::Mbps;

#[derive(Debug)]
pub struct Allocator {
    store: Arc<TopologyStore>,
    ledger: Arc<TunnelLedger>,
    adapter: Arc<ControllerAdapter>,
    config: Config,
}

/// The result of a deallocation: the removed tunnel plus any agent-side
/// failures that were demoted to warnings.
#[derive(Debug)]
pub struct Deallocated {
    pub tunnel: Tunnel,
    pub warnings: Vec<AdapterError>,
}

impl Allocator {
    pub fn new(
        store: Arc<TopologyStore>,
        ledger: Arc<TunnelLedger>,
        adapter: Arc<ControllerAdapter>,
        config: Config,
    ) -> Self {
        Self {
            store,
            ledger,
            adapter,
            config,
        }
    }

    /// Allocates a guaranteed-bandwidth tunnel between two hosts, choosing
    /// among the `k` shortest paths by least segmentation.
    pub fn allocate(
        &self,
        src: NodeName,
        dst: NodeName,
        k: usize,
        rate: Mbps,
    ) -> Result<Tunnel, AllocError> {
        let snapshot = self.store.snapshot();
        for name in [src, dst] {
            if !snapshot.contains(name) {
                return Err(AllocError::UnknownNode(name));
            }
            if !name.is_host() {
                return Err(AllocError::NotAHost(name));
            }
        }
        if k == 0 {
            return Err(AllocError::NoCandidates);
        }
        if rate == Mbps::ZERO {
            return Err(AllocError::ZeroRate);
        }
        let delta = i64::try_from(rate.into_u64()).map_err(|_| AllocError::RateTooLarge(rate))?;
        if self.ledger.len() >= self.config.max_tunnels {
            return Err(AllocError::TunnelLimit(self.config.max_tunnels));
        }

        // Phase one: pick a path on the snapshot. Failures here have no side
        // effects.
        let candidates = routing::k_shortest_simple_paths(&snapshot, src, dst, k)?;
        let path = routing::least_segmentation(&snapshot, &candidates, rate)?;

        let id = self.ledger.next_id();
        let tcp_port = self.tcp_port_for(id)?;
        let tunnel = Tunnel {
            id,
            path: path.nodes,
            rate,
            tcp_port,
            bidirectional: true,
        };

        // Phase two: program the data plane, then commit. The ledger append
        // happens last, so readers only ever see fully-programmed tunnels.
        let started = Instant::now();
        if let Err(err) = self.adapter.install(&tunnel) {
            // Best-effort cleanup of whatever the agent managed to apply.
            self.roll_back(&tunnel);
            return Err(err.into());
        }
        if started.elapsed() > self.config.install_deadline {
            self.roll_back(&tunnel);
            return Err(AllocError::InstallTimeout {
                deadline: self.config.install_deadline,
            });
        }
        match self.store.apply_delta(&tunnel.links(), delta) {
            Ok(()) => {}
            Err(StoreError::InsufficientCapacity { .. }) => {
                // A concurrent allocation won the capacity we saw in the
                // snapshot.
                self.roll_back(&tunnel);
                return Err(AllocError::Path(PathError::InsufficientCapacity { rate }));
            }
            Err(err) => {
                error!(%err, tunnel = %id, "capacity commit failed after snapshot promised it");
                self.roll_back(&tunnel);
                return Err(AllocError::InvariantViolation(err));
            }
        }
        if let Err(err) = self.ledger.append(tunnel.clone()) {
            // Undo the reservation so the failed append leaves no trace.
            if let Err(err) = self.store.apply_delta(&tunnel.links(), -delta) {
                error!(%err, tunnel = %id, "failed to release capacity after ledger error");
            }
            self.roll_back(&tunnel);
            return Err(err.into());
        }
        info!(
            tunnel = %id,
            tcp_port,
            rate = %rate,
            path = %tunnel.path.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(","),
            "tunnel allocated"
        );
        Ok(tunnel)
    }

    /// Tears down a tunnel. Agent-side removal failures do not block:
    /// capacity and the ledger are restored regardless, and the failures are
    /// returned as warnings.
    pub fn deallocate(&self, id: TunnelId) -> Result<Deallocated, AllocError> {
        let tunnel = self
            .ledger
            .get(id)
            .ok_or(AllocError::Ledger(LedgerError::NotFound(id)))?;
        let mut warnings = Vec::new();
        if let Err(err) = self.adapter.remove(&tunnel) {
            warn!(%err, tunnel = %id, "agent-side removal failed; continuing");
            warnings.push(err);
        }
        let delta = i64::try_from(tunnel.rate.into_u64())
            .map_err(|_| AllocError::RateTooLarge(tunnel.rate))?;
        if let Err(err) = self.store.apply_delta(&tunnel.links(), -delta) {
            error!(%err, tunnel = %id, "failed to restore capacity");
            return Err(AllocError::InvariantViolation(err));
        }
        self.ledger.remove(id)?;
        info!(tunnel = %id, "tunnel deallocated");
        Ok(Deallocated { tunnel, warnings })
    }

    fn tcp_port_for(&self, id: TunnelId) -> Result<u16, AllocError> {
        u32::from(self.config.base_tcp_port)
            .checked_add(u32::try_from(id.inner()).map_err(|_| AllocError::PortSpaceExhausted(id))?)
            .filter(|&port| port <= u32::from(u16::MAX))
            .map(|port| port as u16)
            .ok_or(AllocError::PortSpaceExhausted(id))
    }

    fn roll_back(&self, tunnel: &Tunnel) {
        if let Err(err) = self.adapter.remove(tunnel) {
            warn!(%err, tunnel = %tunnel.id, "best-effort rollback failed");
        }
    }
}

/// The allocator's composite error type.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// A named node that does not exist in the topology.
    #[error("unknown node {0}")]
    UnknownNode(NodeName),

    /// A tunnel endpoint that is not a host.
    #[error("{0} is not a host")]
    NotAHost(NodeName),

    /// A request for zero candidate paths.
    #[error("at least one candidate path must be requested")]
    NoCandidates,

    /// A zero-rate request.
    #[error("rate must be a positive number of Mbps")]
    ZeroRate,

    /// A rate too large to reserve.
    #[error("rate {0} is too large")]
    RateTooLarge(Mbps),

    /// The concurrent-tunnel cap was reached.
    #[error("tunnel limit reached ({0} active tunnels)")]
    TunnelLimit(usize),

    /// The derived TCP port fell outside the 16-bit port space.
    #[error("tcp port space exhausted at tunnel id {0}")]
    PortSpaceExhausted(TunnelId),

    /// Path search or selection failed.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Data-plane programming failed; the allocation was rolled back.
    #[error("data-plane programming failed")]
    Adapter(#[from] AdapterError),

    /// Installation exceeded the configured deadline and was rolled back.
    #[error("installation exceeded the {deadline:?} deadline")]
    InstallTimeout {
        /// The configured deadline.
        deadline: std::time::Duration,
    },

    /// The ledger rejected the operation.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Capacity accounting failed despite the snapshot's promise. Fatal.
    #[error("capacity invariant violated")]
    InvariantViolation(#[source] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Link;
    use crate::testing::{AgentCall, Harness};
    use crate::tunnel::Fingerprint;

    #[test]
    fn triangle_allocation_prefers_the_tighter_path() -> anyhow::Result<()> {
        let h = Harness::triangle()?;
        let tunnel = h
            .allocator
            .allocate("h1".parse()?, "h2".parse()?, 2, Mbps::new(50))?;

        assert_eq!(tunnel.id, TunnelId::ONE);
        assert_eq!(tunnel.tcp_port, 5002);
        assert_eq!(
            tunnel.path.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
            ["h1", "s1", "s2", "h2"]
        );

        let snap = h.store.snapshot();
        assert_eq!(snap.residual("s1".parse()?, "s2".parse()?), Some(Mbps::new(10)));
        assert_eq!(snap.residual("h1".parse()?, "s1".parse()?), Some(Mbps::new(50)));
        assert_eq!(snap.residual("s1".parse()?, "s3".parse()?), Some(Mbps::new(100)));
        assert_eq!(h.ledger.list(), vec![tunnel]);
        h.check_capacity_conservation();
        Ok(())
    }

    #[test]
    fn refused_allocation_leaves_no_trace() -> anyhow::Result<()> {
        let h = Harness::triangle()?;
        h.allocator
            .allocate("h1".parse()?, "h2".parse()?, 2, Mbps::new(50))?;
        let calls_before = h.agent.calls().len();
        let before = h.store.snapshot();

        let res = h
            .allocator
            .allocate("h1".parse()?, "h2".parse()?, 2, Mbps::new(80));
        assert!(matches!(
            res,
            Err(AllocError::Path(PathError::InsufficientCapacity { .. }))
        ));
        assert_eq!(h.ledger.len(), 1);
        assert_eq!(h.agent.calls().len(), calls_before, "no agent traffic");
        for chan in before.channels() {
            assert_eq!(
                h.store.snapshot().residual(chan.a, chan.b),
                Some(chan.residual)
            );
        }
        Ok(())
    }

    #[test]
    fn deallocation_restores_residuals_exactly() -> anyhow::Result<()> {
        let h = Harness::triangle()?;
        let before = crate::network::csv::format_links(h.store.snapshot().links());
        let tunnel = h
            .allocator
            .allocate("h1".parse()?, "h2".parse()?, 2, Mbps::new(50))?;

        let out = h.allocator.deallocate(tunnel.id)?;
        assert!(out.warnings.is_empty());
        assert_eq!(
            crate::network::csv::format_links(h.store.snapshot().links()),
            before
        );
        assert!(h.ledger.is_empty());
        assert_eq!(h.agent.delete_attempts(), 1);
        Ok(())
    }

    #[test]
    fn unknown_and_non_host_endpoints_are_invalid_input() -> anyhow::Result<()> {
        let h = Harness::triangle()?;
        assert!(matches!(
            h.allocator
                .allocate("h9".parse()?, "h2".parse()?, 2, Mbps::new(10)),
            Err(AllocError::UnknownNode(..))
        ));
        assert!(matches!(
            h.allocator
                .allocate("s1".parse()?, "h2".parse()?, 2, Mbps::new(10)),
            Err(AllocError::NotAHost(..))
        ));
        Ok(())
    }

    #[test]
    fn agent_failure_aborts_without_commit() -> anyhow::Result<()> {
        let h = Harness::triangle()?;
        h.agent.fail_next_installs(usize::MAX);
        let res = h
            .allocator
            .allocate("h1".parse()?, "h2".parse()?, 2, Mbps::new(50));
        assert!(matches!(res, Err(AllocError::Adapter(..))));
        assert!(h.ledger.is_empty());
        assert_eq!(
            h.store.snapshot().residual("s1".parse()?, "s2".parse()?),
            Some(Mbps::new(60))
        );
        h.check_capacity_conservation();
        Ok(())
    }

    #[test]
    fn deallocation_proceeds_past_agent_failure() -> anyhow::Result<()> {
        let h = Harness::triangle()?;
        let tunnel = h
            .allocator
            .allocate("h1".parse()?, "h2".parse()?, 2, Mbps::new(50))?;
        h.agent.fail_next_deletes(usize::MAX);
        let out = h.allocator.deallocate(tunnel.id)?;
        assert_eq!(out.warnings.len(), 1);
        assert!(h.ledger.is_empty());
        assert_eq!(
            h.store.snapshot().residual("s1".parse()?, "s2".parse()?),
            Some(Mbps::new(60))
        );
        Ok(())
    }

    #[test]
    fn deallocating_unknown_id_is_not_found() -> anyhow::Result<()> {
        let h = Harness::triangle()?;
        assert!(matches!(
            h.allocator.deallocate(TunnelId::new(7)),
            Err(AllocError::Ledger(LedgerError::NotFound(..)))
        ));
        Ok(())
    }

    #[test]
    fn ports_and_ids_stay_unique_across_allocations() -> anyhow::Result<()> {
        let h = Harness::triangle()?;
        let t1 = h
            .allocator
            .allocate("h1".parse()?, "h2".parse()?, 2, Mbps::new(20))?;
        let t2 = h
            .allocator
            .allocate("h1".parse()?, "h2".parse()?, 2, Mbps::new(20))?;
        let t3 = h
            .allocator
            .allocate("h1".parse()?, "h2".parse()?, 2, Mbps::new(20))?;
        let ids: Vec<_> = [&t1, &t2, &t3].iter().map(|t| t.id.inner()).collect();
        assert_eq!(ids, [1, 2, 3]);
        let mut ports: Vec<_> = [&t1, &t2, &t3].iter().map(|t| t.tcp_port).collect();
        ports.dedup();
        assert_eq!(ports.len(), 3);
        h.check_capacity_conservation();
        Ok(())
    }

    #[test]
    fn concurrent_allocations_cannot_oversubscribe_a_bottleneck() -> anyhow::Result<()> {
        // One 50 Mbps path; two simultaneous 30 Mbps requests.
        let links = [
            Link::new("h1".parse()?, "s1".parse()?, Mbps::new(100)),
            Link::new("h2".parse()?, "s2".parse()?, Mbps::new(100)),
            Link::new("s1".parse()?, "s2".parse()?, Mbps::new(50)),
        ];
        let h = Harness::with_links(&links)?;
        let results = std::thread::scope(|scope| {
            let handles = [
                scope.spawn(|| {
                    h.allocator
                        .allocate("h1".parse().unwrap(), "h2".parse().unwrap(), 1, Mbps::new(30))
                }),
                scope.spawn(|| {
                    h.allocator
                        .allocate("h1".parse().unwrap(), "h2".parse().unwrap(), 1, Mbps::new(30))
                }),
            ];
            handles.map(|handle| handle.join().expect("allocation thread panicked"))
        });
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "exactly one allocation may win");
        assert!(results.iter().any(|r| matches!(
            r,
            Err(AllocError::Path(PathError::InsufficientCapacity { .. }))
        )));
        assert_eq!(
            h.store.snapshot().residual("s1".parse()?, "s2".parse()?),
            Some(Mbps::new(20))
        );
        // The loser's agent-side installation, if any, was rolled back.
        let calls = h.agent.calls();
        let installs = calls
            .iter()
            .filter(|c| matches!(c, AgentCall::InstallFlow { .. }))
            .count();
        let deletes = calls
            .iter()
            .filter(|c| matches!(c, AgentCall::DeleteFlow { .. }))
            .count();
        assert_eq!(installs - deletes, 1, "no residue on the agent");
        h.check_capacity_conservation();
        Ok(())
    }

    #[test]
    fn fingerprint_tracks_the_allocated_port() -> anyhow::Result<()> {
        let h = Harness::triangle()?;
        let tunnel = h
            .allocator
            .allocate("h1".parse()?, "h2".parse()?, 2, Mbps::new(50))?;
        assert_eq!(
            tunnel.fingerprint()?,
            Fingerprint {
                src_ip: "10.0.0.1".parse()?,
                dst_ip: "10.0.0.2".parse()?,
                tcp_port: 5002,
            }
        );
        Ok(())
    }
}
