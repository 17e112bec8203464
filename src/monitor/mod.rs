//! External interface monitoring
//!
//! The daemon follows the address of one interface. An event feed reports
//! address additions, address removals and interface departures; each event
//! naming the monitored interface makes the daemon query the interface again
//! and compare its first IPv4 address with the cached external address.

#[cfg(target_os = "linux")]
pub mod netlink;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Change reported by the routing socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceEvent {
    /// An address was added to the interface
    AddressAdded(String),
    /// An address was removed from the interface
    AddressRemoved(String),
    /// The interface went away (PPPoE session closed, etc.)
    InterfaceDeparted(String),
}

impl InterfaceEvent {
    /// Name of the interface the event is about
    pub fn interface(&self) -> &str {
        match self {
            Self::AddressAdded(name) | Self::AddressRemoved(name) | Self::InterfaceDeparted(name) => {
                name
            }
        }
    }
}

/// Query for the addresses currently configured on an interface
pub trait AddressSource {
    /// Every address of `interface`, in system order
    fn addresses_of(&self, interface: &str) -> io::Result<Vec<IpAddr>>;
}

/// Addresses as reported by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAddresses;

impl AddressSource for SystemAddresses {
    fn addresses_of(&self, interface: &str) -> io::Result<Vec<IpAddr>> {
        Ok(if_addrs::get_if_addrs()?
            .into_iter()
            .filter(|iface| iface.name == interface)
            .map(|iface| iface.ip())
            .collect())
    }
}

/// Fixed address table that can be changed at runtime
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct StaticAddresses {
    table: Arc<Mutex<HashMap<String, Vec<IpAddr>>>>,
}

impl StaticAddresses {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the addresses of an interface
    pub fn set(&self, interface: &str, addresses: Vec<IpAddr>) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.insert(interface.to_string(), addresses);
    }

    /// Remove an interface
    pub fn remove(&self, interface: &str) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.remove(interface);
    }
}

impl AddressSource for StaticAddresses {
    fn addresses_of(&self, interface: &str) -> io::Result<Vec<IpAddr>> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        Ok(table.get(interface).cloned().unwrap_or_default())
    }
}

/// Follows the address of the external interface
pub struct InterfaceMonitor<S> {
    interface: String,
    source: S,
}

impl<S: AddressSource> InterfaceMonitor<S> {
    /// Monitor `interface` using `source` for address queries
    pub fn new(interface: impl Into<String>, source: S) -> Self {
        Self {
            interface: interface.into(),
            source,
        }
    }

    /// Name of the monitored interface
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Whether an event is about the monitored interface
    pub fn concerns(&self, event: &InterfaceEvent) -> bool {
        event.interface() == self.interface
    }

    /// First IPv4 address of the interface, unspecified if it has none
    pub fn current_address(&self) -> io::Result<Ipv4Addr> {
        let address = self
            .source
            .addresses_of(&self.interface)?
            .into_iter()
            .find_map(|addr| match addr {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        Ok(address)
    }
}

/// First pause after a failed routing socket read
#[cfg(target_os = "linux")]
const FEED_RETRY_MIN: Duration = Duration::from_millis(100);

/// Longest pause between failed reads
#[cfg(target_os = "linux")]
const FEED_RETRY_MAX: Duration = Duration::from_secs(30);

/// Pause between failed reads, doubling up to a ceiling
#[cfg(target_os = "linux")]
#[derive(Debug)]
struct FeedBackoff {
    next: Duration,
}

#[cfg(target_os = "linux")]
impl FeedBackoff {
    fn new() -> Self {
        Self {
            next: FEED_RETRY_MIN,
        }
    }

    /// Delay before the next read, growing the one after
    fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(FEED_RETRY_MAX);
        delay
    }

    fn succeeded(&mut self) {
        self.next = FEED_RETRY_MIN;
    }
}

/// Start the change feed for `interface`, delivering events on `events`
///
/// On Linux this listens on an rtnetlink socket. Elsewhere the interface is
/// polled and a synthetic [`InterfaceEvent::AddressAdded`] is delivered on
/// every tick; unchanged addresses are ignored by the receiver.
pub fn spawn_event_feed(
    interface: String,
    events: mpsc::Sender<InterfaceEvent>,
) -> io::Result<JoinHandle<()>> {
    #[cfg(target_os = "linux")]
    let task = {
        let mut feed = netlink::NetlinkFeed::open()?;
        tokio::spawn(async move {
            let mut backoff = FeedBackoff::new();
            loop {
                let batch = match feed.next_events().await {
                    Ok(batch) => {
                        backoff.succeeded();
                        batch
                    }
                    Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                        // Events were lost, assume the interface changed
                        warn!("Routing socket overrun, rechecking {}", interface);
                        vec![InterfaceEvent::AddressAdded(interface.clone())]
                    }
                    Err(e) => {
                        let delay = backoff.failed();
                        warn!("Routing socket error: {}, retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                };
                for event in batch {
                    debug!("Routing event: {:?}", event);
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        })
    };

    #[cfg(not(target_os = "linux"))]
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            debug!("Polling addresses of {}", interface);
            if events
                .send(InterfaceEvent::AddressAdded(interface.clone()))
                .await
                .is_err()
            {
                return;
            }
        }
    });

    Ok(task)
}
