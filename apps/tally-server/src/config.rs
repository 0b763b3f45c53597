use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;

use crate::registry::RegistryConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub registry: RegistryConfig,
    /// `None` disables the background sweeper; reads still purge.
    pub sweep_interval: Option<Duration>,
    pub log_filter: String,
}

#[derive(Debug, Parser)]
#[command(
    name = "tally-server",
    author,
    version,
    about = "Tally survey API: response intake and active-session registry"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "TALLY_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Redis URI for durable response storage. Responses stay in memory when unset.
    #[arg(long, env = "TALLY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Sessions older than this (measured from registration) disappear from reads.
    #[arg(long, env = "TALLY_SESSION_TTL_SECS", default_value_t = 30 * 60)]
    pub session_ttl_secs: u64,

    /// A session quiet for this long reads as idle rather than active.
    #[arg(long, env = "TALLY_IDLE_THRESHOLD_SECS", default_value_t = 60)]
    pub idle_threshold_secs: u64,

    /// Background purge period for expired sessions; 0 disables the sweeper.
    #[arg(long, env = "TALLY_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// tracing filter directive, e.g. `info,tally_server=debug`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        anyhow::ensure!(cli.session_ttl_secs > 0, "session ttl must be positive");

        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url.filter(|url| !url.trim().is_empty()),
            registry: RegistryConfig {
                session_ttl: Duration::from_secs(cli.session_ttl_secs),
                idle_threshold: Duration::from_secs(cli.idle_threshold_secs),
            },
            sweep_interval: (cli.sweep_interval_secs > 0)
                .then(|| Duration::from_secs(cli.sweep_interval_secs)),
            log_filter: cli.log_filter,
        })
    }
}
