use std::{
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use tally_sync::LinkProbe;
use tracing::trace;

/// Link signal for hosts without one: the link counts as up when a TCP connect to the server's
/// host and port succeeds within `timeout`. Blocking; run it off the async executor.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn for_server(server_url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(server_url)
            .with_context(|| format!("invalid server url: {server_url}"))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("server url has no host: {server_url}"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("server url has no port: {server_url}"))?;
        Ok(Self {
            host,
            port,
            timeout,
        })
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl LinkProbe for TcpProbe {
    fn link_up(&self) -> bool {
        let Ok(addrs) = (self.host.as_str(), self.port).to_socket_addrs() else {
            return false;
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, self.timeout).is_ok() {
                trace!(%addr, "link probe connected");
                return true;
            }
        }
        false
    }
}
