//! The topology store: the shared, persisted view of the network and the
//! single place residual capacities change.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rustc_hash::FxHashSet;

use crate::network::{csv, NodeName, Topology, TopologyError};
use crate::units::Mbps;

/// Owns the live topology plus the immutable start-of-day snapshot, and
/// persists residuals to `running_network.csv` after every successful delta.
///
/// All operations are transactional: the internal lock is held for the
/// duration of one call and never across agent RPCs. Long operations (path
/// search) run against a cloned [`snapshot`](TopologyStore::snapshot).
#[derive(Debug)]
pub struct TopologyStore {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    topology: Topology,
    initial: Topology,
    running_path: PathBuf,
}

impl TopologyStore {
    /// Opens the store from the immutable initial-topology CSV and the live
    /// running CSV. A missing running file is seeded from the initial one; a
    /// present one must describe the same set of links.
    pub fn open(
        initial_path: impl AsRef<Path>,
        running_path: impl AsRef<Path>,
    ) -> Result<Self, StoreError> {
        let running_path = running_path.as_ref().to_path_buf();
        let initial_links = csv::parse_links(&std::fs::read_to_string(initial_path.as_ref())?)?;
        let initial = Topology::new(&initial_links)?;
        let topology = if running_path.exists() {
            let links = csv::parse_links(&std::fs::read_to_string(&running_path)?)?;
            let topology = Topology::new(&links)?;
            check_same_shape(&initial, &topology)?;
            topology
        } else {
            std::fs::write(&running_path, csv::format_links(initial.links()))?;
            initial.clone()
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                topology,
                initial,
                running_path,
            }),
        })
    }

    /// Returns an immutable snapshot of the live topology.
    pub fn snapshot(&self) -> Topology {
        self.lock().topology.clone()
    }

    /// Returns the start-of-day topology, for diffing against the live one.
    pub fn initial(&self) -> Topology {
        self.lock().initial.clone()
    }

    /// Atomically subtracts `delta` Mbps from every listed undirected link
    /// (adds, if `delta` is negative). Applies to all listed links or to
    /// none, and persists the updated residuals before returning.
    pub fn apply_delta(
        &self,
        links: &[(NodeName, NodeName)],
        delta: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let mut updated = inner.topology.clone();
        for &(a, b) in links {
            let residual = updated
                .residual(a, b)
                .ok_or(StoreError::UnknownLink { n1: a, n2: b })?;
            let next = if delta >= 0 {
                residual
                    .checked_sub(Mbps::new(delta as u64))
                    .ok_or(StoreError::InsufficientCapacity {
                        n1: a,
                        n2: b,
                        residual,
                        requested: Mbps::new(delta as u64),
                    })?
            } else {
                residual + Mbps::new(delta.unsigned_abs())
            };
            updated
                .set_residual(a, b, next)
                .map_err(|_| StoreError::UnknownLink { n1: a, n2: b })?;
        }
        // Persist first; the in-memory commit happens only if the write
        // lands, so a disk failure leaves the store unchanged.
        std::fs::write(&inner.running_path, csv::format_links(updated.links()))?;
        inner.topology = updated;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn check_same_shape(initial: &Topology, running: &Topology) -> Result<(), StoreError> {
    let key = |a: NodeName, b: NodeName| if a <= b { (a, b) } else { (b, a) };
    let pairs = |topo: &Topology| {
        topo.channels()
            .map(|chan| key(chan.a, chan.b))
            .collect::<FxHashSet<_>>()
    };
    if pairs(initial) != pairs(running) {
        return Err(StoreError::RunningMismatch);
    }
    Ok(())
}

/// The store's error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A delta would drive a link's residual below zero.
    #[error("link {n1}-{n2} has {residual} left, cannot reserve {requested}")]
    InsufficientCapacity {
        /// The first node.
        n1: NodeName,
        /// The second node.
        n2: NodeName,
        /// The link's current residual.
        residual: Mbps,
        /// The amount the delta asked for.
        requested: Mbps,
    },

    /// A listed link does not exist.
    #[error("no link between {n1} and {n2}")]
    UnknownLink {
        /// The first node.
        n1: NodeName,
        /// The second node.
        n2: NodeName,
    },

    /// The running CSV does not describe the initial topology's links.
    #[error("running topology does not match the initial topology")]
    RunningMismatch,

    /// The topology CSV failed to load.
    #[error("invalid topology")]
    Topology(#[from] TopologyError),

    /// Filesystem failure.
    #[error("topology store I/O error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn store_in(dir: &tempfile::TempDir) -> anyhow::Result<TopologyStore> {
        let initial = dir.path().join("initial_topology.csv");
        std::fs::write(&initial, csv::format_links(testing::triangle_config()))?;
        Ok(TopologyStore::open(
            initial,
            dir.path().join("running_network.csv"),
        )?)
    }

    fn residual(store: &TopologyStore, a: &str, b: &str) -> Mbps {
        let snap = store.snapshot();
        snap.residual(a.parse().unwrap(), b.parse().unwrap())
            .unwrap()
    }

    #[test]
    fn open_seeds_running_from_initial() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir)?;
        assert!(dir.path().join("running_network.csv").exists());
        assert_eq!(residual(&store, "s1", "s2"), Mbps::new(60));
        Ok(())
    }

    #[test]
    fn delta_round_trip_restores_residuals() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir)?;
        let links = [
            ("h1".parse()?, "s1".parse()?),
            ("s1".parse()?, "s2".parse()?),
            ("s2".parse()?, "h2".parse()?),
        ];
        let before = csv::format_links(store.snapshot().links());
        store.apply_delta(&links, 50)?;
        assert_eq!(residual(&store, "s1", "s2"), Mbps::new(10));
        store.apply_delta(&links, -50)?;
        assert_eq!(csv::format_links(store.snapshot().links()), before);
        Ok(())
    }

    #[test]
    fn failed_delta_leaves_no_side_effects() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir)?;
        let links = [
            ("h1".parse()?, "s1".parse()?),
            ("s1".parse()?, "s2".parse()?), // only 60 available
        ];
        let res = store.apply_delta(&links, 80);
        assert!(matches!(res, Err(StoreError::InsufficientCapacity { .. })));
        assert_eq!(residual(&store, "h1", "s1"), Mbps::new(100));
        assert_eq!(residual(&store, "s1", "s2"), Mbps::new(60));
        Ok(())
    }

    #[test]
    fn unknown_link_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir)?;
        let links = [("s1".parse()?, "s9".parse()?)];
        assert!(matches!(
            store.apply_delta(&links, 10),
            Err(StoreError::UnknownLink { .. })
        ));
        Ok(())
    }

    #[test]
    fn residuals_survive_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let initial = dir.path().join("initial_topology.csv");
        let running = dir.path().join("running_network.csv");
        std::fs::write(&initial, csv::format_links(testing::triangle_config()))?;
        {
            let store = TopologyStore::open(&initial, &running)?;
            store.apply_delta(&[("s1".parse()?, "s2".parse()?)], 50)?;
        }
        let store = TopologyStore::open(&initial, &running)?;
        assert_eq!(residual(&store, "s1", "s2"), Mbps::new(10));
        // The initial snapshot still carries start-of-day values.
        assert_eq!(
            store.initial().residual("s1".parse()?, "s2".parse()?),
            Some(Mbps::new(60))
        );
        Ok(())
    }
}
