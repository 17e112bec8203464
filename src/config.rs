//! Configuration file
//!
//! The daemon reads a single TOML file naming the external interface, the
//! addresses to serve NAT-PMP on, the firewall backend and logging options.
//!
//! ```toml
//! interface = "em0"
//! listen = ["192.168.1.1", "10.0.0.1:5351"]
//!
//! [firewall]
//! backend = "nft"
//! table = "natpmpd"
//!
//! [log]
//! level = "info"
//! format = "pretty"
//! ```

use crate::protocol::SERVER_PORT;
use crate::telemetry::LogConfig;
use crate::{Error, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/natpmpd.toml";

/// Default nftables table
pub const DEFAULT_TABLE: &str = "natpmpd";

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// External interface whose address is handed out
    pub interface: String,
    /// Addresses to listen on, with an optional port
    pub listen: Vec<String>,
    /// Firewall settings
    #[serde(default)]
    pub firewall: FirewallConfig,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Which firewall backend to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// nftables through the `nft` command
    #[default]
    Nft,
    /// Rules are only kept in memory and logged
    Memory,
}

/// Firewall settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallConfig {
    /// Backend to use
    #[serde(default)]
    pub backend: BackendKind,
    /// Table owned by the daemon
    #[serde(default = "default_table")]
    pub table: String,
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            table: default_table(),
        }
    }
}

impl Config {
    /// Read, parse and validate a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            return Err(Error::Config("interface must not be empty".to_string()));
        }
        if self.listen.is_empty() {
            return Err(Error::Config("at least one listen address is required".to_string()));
        }
        self.listen_addrs()?;

        let table = &self.firewall.table;
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::Config(format!("invalid table name '{}'", table)));
        }
        Ok(())
    }

    /// Listen addresses as sockets, port 0 or no port meaning the NAT-PMP port
    pub fn listen_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listen.iter().map(|s| parse_listen_addr(s)).collect()
    }
}

/// Parse `addr` or `addr:port`, IPv6 addresses with a port in brackets
fn parse_listen_addr(s: &str) -> Result<SocketAddr> {
    let s = s.trim();
    let mut addr = match s.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(_) => s
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, 0))
            .map_err(|_| Error::Config(format!("invalid listen address '{}'", s)))?,
    };
    if addr.port() == 0 {
        addr.set_port(SERVER_PORT);
    }
    Ok(addr)
}
