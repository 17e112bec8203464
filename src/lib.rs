//! natpmpd - NAT-PMP port mapping daemon
//!
//! Runs on a gateway and lets hosts on the private side ask for inbound
//! port redirections. Mappings live in memory and are mirrored into the
//! packet filter as a complete rule set on every change; the external
//! address is followed through routing events and multicast to clients
//! whenever it changes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod announce;
pub mod config;
pub mod daemon;
pub mod firewall;
pub mod gateway;
pub mod mapping;
pub mod monitor;
pub mod protocol;
pub mod server;
pub mod telemetry;
pub mod timer;

/// Result type alias for natpmpd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for natpmpd operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Firewall rule set could not be updated
    #[error("Firewall error: {0}")]
    Firewall(#[from] firewall::SyncError),

    /// External interface could not be queried
    #[error("Interface error: {0}")]
    Interface(String),

    /// Malformed datagram
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
}
