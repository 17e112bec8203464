//! Active port mappings
//!
//! The store is the single owner of every mapping. Each mapping holds the
//! [`TimerId`] of its expiry timer and every removal path cancels it, so a
//! timer can never fire for a mapping that is already gone.
//!
//! At most one mapping exists per (protocol, internal endpoint) pair. A
//! repeated request refreshes the lifetime of the existing entry and always
//! gets its external port back, whatever port the client asked for.

use crate::timer::{TimerEvent, TimerId, Timers};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::debug;

/// First port of the dynamic/private range (RFC 6335)
pub const DYNAMIC_PORT_FIRST: u16 = 49152;

/// Last port of the dynamic/private range
pub const DYNAMIC_PORT_LAST: u16 = 65535;

/// Transport protocol of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    /// TCP protocol
    Tcp = 6,
    /// UDP protocol
    Udp = 17,
}

impl Protocol {
    /// Lower case name as used in firewall rules
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

/// Identifier of a mapping, carried by its expiry timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId(u64);

/// One active port redirection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    id: MappingId,
    /// Transport protocol
    pub protocol: Protocol,
    /// Public endpoint matched on arriving packets
    pub external: SocketAddrV4,
    /// Private endpoint traffic is redirected to
    pub internal: SocketAddrV4,
    timer: TimerId,
}

impl Mapping {
    /// Identifier used by the expiry timer
    pub fn id(&self) -> MappingId {
        self.id
    }

    /// Expiry timer handle
    pub fn timer(&self) -> TimerId {
        self.timer
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.external, self.internal)
    }
}

/// Outcome of [`MappingStore::create_or_refresh`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    /// External port the mapping uses
    pub external_port: u16,
    /// `true` for a new mapping, `false` for a refresh
    pub created: bool,
}

/// In-memory collection of active mappings
pub struct MappingStore {
    mappings: Vec<Mapping>,
    next_id: u64,
    rng: StdRng,
}

impl MappingStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create an empty store drawing external ports from `rng`
    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            mappings: Vec::new(),
            next_id: 0,
            rng,
        }
    }

    /// Create a mapping or refresh the existing one for the same internal endpoint
    ///
    /// An existing (protocol, internal) mapping keeps its external port and only
    /// has its timer rearmed. A new mapping reuses the external port of a
    /// mapping for the same internal endpoint under the other protocol, and
    /// otherwise gets a random port from the dynamic range. The port in
    /// `external` is never honoured directly.
    pub fn create_or_refresh(
        &mut self,
        timers: &mut Timers<TimerEvent>,
        now: Instant,
        protocol: Protocol,
        internal: SocketAddrV4,
        external: SocketAddrV4,
        lifetime: Duration,
    ) -> Assignment {
        let mut related = None;
        let mut existing = None;
        for (index, mapping) in self.mappings.iter().enumerate() {
            if mapping.internal != internal {
                continue;
            }
            if mapping.protocol == protocol {
                existing = Some(index);
                break;
            }
            related = Some(mapping.external.port());
        }

        if let Some(index) = existing {
            let mapping = &mut self.mappings[index];
            if mapping.external != external {
                debug!(
                    "Existing mapping {} overrides requested {}",
                    mapping, external
                );
            }

            timers.cancel(mapping.timer);
            mapping.timer = timers.arm(now, lifetime, TimerEvent::Expire(mapping.id));

            return Assignment {
                external_port: mapping.external.port(),
                created: false,
            };
        }

        // TODO: draw again when the random port is already mapped for this protocol
        let external_port = match related {
            Some(port) => port,
            None => self.rng.gen_range(DYNAMIC_PORT_FIRST..=DYNAMIC_PORT_LAST),
        };

        let id = MappingId(self.next_id);
        self.next_id += 1;

        let timer = timers.arm(now, lifetime, TimerEvent::Expire(id));
        self.mappings.push(Mapping {
            id,
            protocol,
            external: SocketAddrV4::new(*external.ip(), external_port),
            internal,
            timer,
        });

        Assignment {
            external_port,
            created: true,
        }
    }

    /// Remove mappings of `protocol` pointing at `address`
    ///
    /// A `port` of 0 removes every such mapping, otherwise only the one for
    /// that internal port. Returns the number removed.
    pub fn remove(
        &mut self,
        timers: &mut Timers<TimerEvent>,
        protocol: Protocol,
        address: Ipv4Addr,
        port: u16,
    ) -> usize {
        let before = self.mappings.len();
        self.mappings.retain(|m| {
            let matches = m.protocol == protocol
                && *m.internal.ip() == address
                && (port == 0 || m.internal.port() == port);
            if matches {
                timers.cancel(m.timer);
            }
            !matches
        });
        before - self.mappings.len()
    }

    /// Drop a mapping whose expiry timer has fired
    pub fn expire(&mut self, id: MappingId) -> Option<Mapping> {
        let index = self.mappings.iter().position(|m| m.id == id)?;
        Some(self.mappings.remove(index))
    }

    /// Remove every mapping, cancelling their timers
    pub fn clear(&mut self, timers: &mut Timers<TimerEvent>) -> usize {
        for mapping in &self.mappings {
            timers.cancel(mapping.timer);
        }
        let count = self.mappings.len();
        self.mappings.clear();
        count
    }

    /// Look up the mapping for a (protocol, internal endpoint) pair
    pub fn get(&self, protocol: Protocol, internal: SocketAddrV4) -> Option<&Mapping> {
        self.mappings
            .iter()
            .find(|m| m.protocol == protocol && m.internal == internal)
    }

    /// Iterate over all mappings
    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter()
    }

    /// Number of mappings
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl Default for MappingStore {
    fn default() -> Self {
        Self::new()
    }
}
