//! The interactive operator front end: loads the topology and ledger, starts
//! the reconciler, and serves a small allocate/deallocate menu.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use netslice_core::agent::DataPlaneAgent;
use netslice_core::allocator::{AllocError, Allocator};
use netslice_core::ledger::LedgerError;
use netslice_core::routing::PathError;
use netslice_core::{
    AgentError, Config, ControllerAdapter, HttpAgent, Mbps, NodeName, Reconciler, TopologyStore,
    TunnelId, TunnelLedger,
};

#[derive(Parser, Debug)]
#[command(about = "Bandwidth-aware network slicing control plane")]
struct Args {
    /// Immutable initial-topology CSV.
    #[arg(long, default_value = "data/initial_topology.csv")]
    topology: PathBuf,

    /// Directory holding the running topology and the tunnel ledger.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Base URL of the data-plane agent.
    #[arg(long, default_value = "http://localhost:5000")]
    agent_url: String,

    /// Reconciler poll period, in seconds.
    #[arg(long, default_value_t = 2)]
    poll_secs: u64,
}

const EXIT_INVALID_INPUT: u8 = 1;
const EXIT_AGENT_UNREACHABLE: u8 = 2;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(EXIT_INVALID_INPUT)
        }
    }
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = Config::builder()
        .agent_url(args.agent_url)
        .poll_interval(Duration::from_secs(args.poll_secs))
        .build();

    std::fs::create_dir_all(&args.data_dir)?;
    let store = Arc::new(TopologyStore::open(
        &args.topology,
        args.data_dir.join("running_network.csv"),
    )?);
    let snapshot = store.snapshot();
    if snapshot.nr_switches() as u64 > config.max_switches {
        error!(
            switches = snapshot.nr_switches(),
            max = config.max_switches,
            "topology exceeds the datapath map"
        );
        return Ok(ExitCode::from(EXIT_INVALID_INPUT));
    }
    let ledger = Arc::new(TunnelLedger::open(args.data_dir.join("allocated_flows.csv"))?);

    let agent = HttpAgent::new(&config.agent_url, &snapshot, config.agent_timeout)?;
    if let Err(err) = agent.ping() {
        error!(%err, url = %config.agent_url, "data-plane agent unreachable");
        return Ok(ExitCode::from(EXIT_AGENT_UNREACHABLE));
    }
    let agent: Arc<dyn DataPlaneAgent> = Arc::new(agent);
    let adapter = Arc::new(ControllerAdapter::new(
        agent,
        config.max_switches,
        config.retry_limit,
        config.retry_backoff,
    ));
    let allocator = Allocator::new(
        Arc::clone(&store),
        Arc::clone(&ledger),
        Arc::clone(&adapter),
        config.clone(),
    );
    let reconciler = Reconciler::spawn(
        Arc::clone(&ledger),
        Arc::clone(&adapter),
        config.poll_interval,
    );

    let code = menu_loop(&allocator, &ledger)?;

    reconciler.stop();
    cleanup_agent_side(&ledger, &adapter);
    Ok(code)
}

fn menu_loop(allocator: &Allocator, ledger: &TunnelLedger) -> anyhow::Result<ExitCode> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        println!();
        println!("1) allocate a tunnel");
        println!("2) deallocate a tunnel");
        println!("3) exit");
        let Some(choice) = prompt(&mut lines, "> ")? else {
            return Ok(ExitCode::SUCCESS);
        };
        match choice.as_str() {
            "1" => {
                if let Err(code) = allocate(allocator, &mut lines)? {
                    return Ok(code);
                }
            }
            "2" => deallocate(allocator, ledger, &mut lines)?,
            "3" => return Ok(ExitCode::SUCCESS),
            "" => {}
            other => println!("unrecognized choice `{other}`"),
        }
    }
}

/// Runs one allocation dialogue. The inner `Result` carries a process exit
/// code when the error is fatal (invariant violation); everything else is
/// reported and the loop continues.
fn allocate(
    allocator: &Allocator,
    lines: &mut impl Iterator<Item = io::Result<String>>,
) -> anyhow::Result<Result<(), ExitCode>> {
    let Some(src) = prompt(lines, "source host: ")? else {
        return Ok(Ok(()));
    };
    let Some(dst) = prompt(lines, "destination host: ")? else {
        return Ok(Ok(()));
    };
    let Some(k) = prompt(lines, "candidate paths (k): ")? else {
        return Ok(Ok(()));
    };
    let Some(rate) = prompt(lines, "rate (Mbps): ")? else {
        return Ok(Ok(()));
    };

    let parsed = (|| {
        let src: NodeName = src.parse().map_err(|_| format!("bad node name `{src}`"))?;
        let dst: NodeName = dst.parse().map_err(|_| format!("bad node name `{dst}`"))?;
        let k: usize = k.parse().map_err(|_| format!("bad path count `{k}`"))?;
        let rate: u64 = rate.parse().map_err(|_| format!("bad rate `{rate}`"))?;
        Ok::<_, String>((src, dst, k, Mbps::new(rate)))
    })();
    let (src, dst, k, rate) = match parsed {
        Ok(parsed) => parsed,
        Err(reason) => {
            println!("[invalid-input] {reason}");
            return Ok(Ok(()));
        }
    };

    match allocator.allocate(src, dst, k, rate) {
        Ok(tunnel) => {
            let hops = tunnel
                .path
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(",");
            println!(
                "tunnel {} allocated: {hops} @ {} on tcp port {}",
                tunnel.id, tunnel.rate, tunnel.tcp_port
            );
            Ok(Ok(()))
        }
        Err(err @ AllocError::InvariantViolation(..)) => {
            error!(%err, "fatal: aborting");
            Ok(Err(ExitCode::from(EXIT_INVALID_INPUT)))
        }
        Err(err) => {
            println!("[{}] {err}", error_tag(&err));
            Ok(Ok(()))
        }
    }
}

fn deallocate(
    allocator: &Allocator,
    ledger: &TunnelLedger,
    lines: &mut impl Iterator<Item = io::Result<String>>,
) -> anyhow::Result<()> {
    let tunnels = ledger.list();
    if tunnels.is_empty() {
        println!("no active tunnels");
        return Ok(());
    }
    for tunnel in &tunnels {
        let hops = tunnel
            .path
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "  tunnel {}: {hops} @ {} on tcp port {}",
            tunnel.id, tunnel.rate, tunnel.tcp_port
        );
    }
    let Some(id) = prompt(lines, "tunnel id: ")? else {
        return Ok(());
    };
    let id: u64 = match id.parse() {
        Ok(id) => id,
        Err(_) => {
            println!("[invalid-input] bad tunnel id `{id}`");
            return Ok(());
        }
    };
    match allocator.deallocate(TunnelId::new(id)) {
        Ok(out) => {
            println!("tunnel {} deallocated", out.tunnel.id);
            for warning in out.warnings {
                println!("[warning] {warning}");
            }
        }
        Err(err) => println!("[{}] {err}", error_tag(&err)),
    }
    Ok(())
}

// Best-effort teardown of agent-side state for every active tunnel; the
// ledger itself is preserved for the next start.
fn cleanup_agent_side(ledger: &TunnelLedger, adapter: &ControllerAdapter) {
    for tunnel in ledger.list() {
        if let Err(err) = adapter.remove(&tunnel) {
            warn!(%err, tunnel = %tunnel.id, "exit cleanup failed for tunnel");
        }
    }
}

fn prompt(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    message: &str,
) -> io::Result<Option<String>> {
    print!("{message}");
    io::stdout().flush()?;
    match lines.next() {
        Some(line) => Ok(Some(line?.trim().to_owned())),
        None => Ok(None),
    }
}

fn error_tag(err: &AllocError) -> &'static str {
    match err {
        AllocError::UnknownNode(..)
        | AllocError::NotAHost(..)
        | AllocError::NoCandidates
        | AllocError::ZeroRate
        | AllocError::RateTooLarge(..) => "invalid-input",
        AllocError::TunnelLimit(..) | AllocError::PortSpaceExhausted(..) => "resource-limit",
        AllocError::Path(PathError::NoPath { .. }) => "no-path",
        AllocError::Path(PathError::InsufficientCapacity { .. }) => "insufficient-capacity",
        AllocError::Adapter(err) => match err {
            netslice_core::adapter::AdapterError::Agent(AgentError::Unavailable(..)) => {
                "agent-unavailable"
            }
            netslice_core::adapter::AdapterError::Agent(AgentError::Rejected { .. }) => {
                "agent-rejected"
            }
            _ => "adapter",
        },
        AllocError::InstallTimeout { .. } => "timeout",
        AllocError::Ledger(LedgerError::NotFound(..)) => "not-found",
        AllocError::Ledger(..) => "ledger",
        AllocError::InvariantViolation(..) => "invariant-violation",
    }
}
