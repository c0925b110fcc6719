//! Control-plane configuration.

use std::time::Duration;

/// Tunables for the orchestrator. Defaults match the reference deployment:
/// TCP ports allocated from 5001, 2 s polling and agent timeouts, a 10 s
/// installation deadline, and room for 20 switches.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct Config {
    /// TCP ports are allocated as `base_tcp_port + tunnel_id`.
    #[builder(default = 5001)]
    pub base_tcp_port: u16,

    /// Reconciler poll period.
    #[builder(default = Duration::from_secs(2))]
    pub poll_interval: Duration,

    /// Base URL of the data-plane agent.
    #[builder(default = String::from("http://localhost:5000"))]
    pub agent_url: String,

    /// Per-request agent timeout.
    #[builder(default = Duration::from_secs(2))]
    pub agent_timeout: Duration,

    /// Overall deadline for installing one tunnel; allocations past it are
    /// rolled back.
    #[builder(default = Duration::from_secs(10))]
    pub install_deadline: Duration,

    /// Size of the datapath-ID → switch-name map.
    #[builder(default = 20)]
    pub max_switches: u64,

    /// Maximum concurrent tunnels. The default is what the TCP port space
    /// above `base_tcp_port` allows.
    #[builder(default = (u16::MAX as usize) + 1 - 5001)]
    pub max_tunnels: usize,

    /// Retries for a pending flow program before reporting failure.
    #[builder(default = 3)]
    pub retry_limit: u32,

    /// Backoff between those retries.
    #[builder(default = Duration::from_millis(500))]
    pub retry_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_deployment() {
        let config = Config::default();
        assert_eq!(config.base_tcp_port, 5001);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_switches, 20);
        assert_eq!(config.max_tunnels, 60535);
    }
}
