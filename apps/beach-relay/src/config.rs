use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered probes before a channel is evicted.
    pub max_missed_pongs: u32,
    /// Hint handed to clients when the relay drains.
    pub retry_after: Duration,
    /// How long a POST waits for the destination channel to take the push.
    pub route_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
            heartbeat_interval: Duration::from_secs(30),
            max_missed_pongs: 2,
            retry_after: Duration::from_secs(5),
            route_timeout: Duration::from_millis(5000),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl RelayConfig {
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs()
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-relay",
    author,
    version,
    about = "Beach signaling relay (socket and event-stream endpoints)"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "BEACH_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Seconds between liveness probes on every channel.
    #[arg(long, env = "BEACH_RELAY_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Unanswered probes tolerated before a channel is closed.
    #[arg(long, env = "BEACH_RELAY_MAX_MISSED_PONGS", default_value_t = 2)]
    pub max_missed_pongs: u32,

    /// Retry hint, in seconds, sent to clients while draining.
    #[arg(long, env = "BEACH_RELAY_RETRY_AFTER_SECS", default_value_t = 5)]
    pub retry_after_secs: u64,

    /// Upper bound on waiting for a stream push before answering a POST.
    #[arg(long, env = "BEACH_RELAY_ROUTE_TIMEOUT_MS", default_value_t = 5000)]
    pub route_timeout_ms: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.heartbeat_secs == 0 {
            bail!("heartbeat interval must be at least one second");
        }
        if cli.max_missed_pongs == 0 {
            bail!("max missed pongs must be at least one");
        }
        Ok(RelayConfig {
            listen_addr,
            heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
            max_missed_pongs: cli.max_missed_pongs,
            retry_after: Duration::from_secs(cli.retry_after_secs),
            route_timeout: Duration::from_millis(cli.route_timeout_ms),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "beach-relay",
            "--listen-addr",
            "0.0.0.0:9000",
            "--heartbeat-secs",
            "3",
            "--route-timeout-ms",
            "250",
        ])
        .unwrap();
        let config = RelayConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.route_timeout, Duration::from_millis(250));
    }

    #[test]
    fn rejects_bad_values() {
        let cli = Cli::try_parse_from(["beach-relay", "--listen-addr", "nowhere"]).unwrap();
        let err = RelayConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));

        let cli = Cli::try_parse_from(["beach-relay", "--heartbeat-secs", "0"]).unwrap();
        assert!(RelayConfig::try_from(cli).is_err());
    }
}
