//! Process-wide gateway state

use std::net::Ipv4Addr;
use std::time::Instant;

/// State shared by request handling and the announcer
#[derive(Debug, Clone)]
pub struct GatewayState {
    external_address: Ipv4Addr,
    start_time: Instant,
}

impl GatewayState {
    /// Fresh state with no known external address
    pub fn new(start_time: Instant) -> Self {
        Self {
            external_address: Ipv4Addr::UNSPECIFIED,
            start_time,
        }
    }

    /// Current external address, unspecified while none is known
    pub fn external_address(&self) -> Ipv4Addr {
        self.external_address
    }

    /// Whether an external address is known
    pub fn has_external_address(&self) -> bool {
        !self.external_address.is_unspecified()
    }

    /// Record a new external address, returning the previous one
    pub fn set_external_address(&mut self, address: Ipv4Addr) -> Ipv4Addr {
        std::mem::replace(&mut self.external_address, address)
    }

    /// Seconds since start of epoch, the uptime reported to clients
    pub fn sssoe(&self, now: Instant) -> u32 {
        let secs = now.saturating_duration_since(self.start_time).as_secs();
        u32::try_from(secs).unwrap_or(u32::MAX)
    }
}
