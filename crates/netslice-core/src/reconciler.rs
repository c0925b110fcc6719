//! The reconciler: a supervised worker that keeps the data plane converged
//! on the ledger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::adapter::ControllerAdapter;
use crate::ledger::TunnelLedger;
use crate::tunnel::{Fingerprint, Tunnel};

/// A handle to the reconciliation loop. [`stop`](Reconciler::stop) signals
/// cancellation and waits for the worker to exit cleanly; dropping the
/// handle does the same.
#[derive(Debug)]
pub struct Reconciler {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reconciler {
    /// Spawns the loop with the given poll period.
    pub fn spawn(
        ledger: Arc<TunnelLedger>,
        adapter: Arc<ControllerAdapter>,
        period: Duration,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::spawn(move || {
            let mut installed = FxHashMap::default();
            while flag.load(Ordering::SeqCst) {
                tick(&ledger, &adapter, &mut installed);
                sleep_while(&flag, period);
            }
        });
        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Signals the loop to stop and waits for clean exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One reconciliation pass: refresh the ledger, diff it against the
/// installed set, and drive the adapter. Removals run before additions so
/// ports and queue IDs are freed first; entries only enter `installed` on
/// success, so failures retry on the next tick.
pub fn tick(
    ledger: &TunnelLedger,
    adapter: &ControllerAdapter,
    installed: &mut FxHashMap<Fingerprint, Tunnel>,
) {
    if let Err(err) = ledger.refresh() {
        warn!(%err, "ledger refresh failed; reconciling against the last good view");
    }
    let desired = ledger
        .list()
        .into_iter()
        .filter_map(|tunnel| match tunnel.fingerprint() {
            Ok(fp) => Some((fp, tunnel)),
            Err(err) => {
                warn!(%err, "skipping tunnel without a valid fingerprint");
                None
            }
        })
        .collect::<FxHashMap<_, _>>();

    let stale = installed
        .iter()
        .filter(|(fp, _)| !desired.contains_key(fp))
        .map(|(fp, tunnel)| (*fp, tunnel.clone()))
        .collect::<Vec<_>>();
    for (fp, tunnel) in stale {
        match adapter.remove(&tunnel) {
            Ok(()) => {
                installed.remove(&fp);
            }
            Err(err) => warn!(%err, tunnel = %tunnel.id, "removal failed; will retry"),
        }
    }

    for (fp, tunnel) in &desired {
        if installed.contains_key(fp) {
            continue;
        }
        match adapter.install(tunnel) {
            Ok(()) => {
                installed.insert(*fp, tunnel.clone());
            }
            Err(err) => warn!(%err, tunnel = %tunnel.id, "installation failed; will retry"),
        }
    }
    debug!(installed = installed.len(), "reconciliation pass complete");
}

// Sleeps in short slices so a stop request is honored promptly.
fn sleep_while(running: &AtomicBool, period: Duration) {
    let slice = Duration::from_millis(25).min(period);
    let mut remaining = period;
    while running.load(Ordering::SeqCst) && !remaining.is_zero() {
        let nap = slice.min(remaining);
        thread::sleep(nap);
        remaining -= nap;
    }
}
