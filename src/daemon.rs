//! Reactor
//!
//! One task multiplexes everything the daemon waits on: datagrams from the
//! listen endpoints, routing events, the earliest pending timer and the
//! termination signals. Each socket gets a small receive task feeding a
//! channel; all state changes happen on the reactor task through [`Server`].

use crate::config::{BackendKind, Config};
use crate::firewall::memory::MemoryBackend;
use crate::firewall::nft::NftBackend;
use crate::firewall::{FirewallBackend, RuleSynchronizer};
use crate::monitor::{self, AddressSource, InterfaceEvent, InterfaceMonitor, SystemAddresses};
use crate::protocol::{ALL_HOSTS_GROUP, CLIENT_PORT, MAX_PACKET_SIZE};
use crate::server::Server;
use crate::{Error, Result};
use bytes::Bytes;
use socket2::{Domain, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the datagram and routing event channels
const CHANNEL_CAPACITY: usize = 64;

/// A bound UDP socket serving NAT-PMP
#[derive(Debug, Clone)]
pub struct ListenEndpoint {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl ListenEndpoint {
    /// Bind a socket on `addr`
    ///
    /// IPv4 sockets send their multicast announcements out of the interface
    /// holding `addr` and do not loop them back.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(socket2::Protocol::UDP))?;

        match addr {
            SocketAddr::V4(v4) => {
                if let Err(e) = socket.set_multicast_if_v4(v4.ip()) {
                    warn!("Unable to set multicast interface for {}: {}", addr, e);
                }
                if let Err(e) = socket.set_multicast_loop_v4(false) {
                    warn!("Unable to disable multicast loop for {}: {}", addr, e);
                }
            }
            SocketAddr::V6(_) => {
                socket.set_only_v6(true)?;
                if let Err(e) = socket.set_multicast_loop_v6(false) {
                    warn!("Unable to disable multicast loop for {}: {}", addr, e);
                }
            }
        }

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local,
        })
    }

    /// Bind every address, skipping those that fail
    ///
    /// Fails only when no endpoint could be bound.
    pub fn bind_all(addrs: &[SocketAddr]) -> Result<Vec<Self>> {
        let mut endpoints = Vec::new();
        for &addr in addrs {
            match Self::bind(addr) {
                Ok(endpoint) => {
                    info!("listening on {}", endpoint.local_addr());
                    endpoints.push(endpoint);
                }
                Err(e) => warn!("bind on {} failed, skipping: {}", addr, e),
            }
        }

        if endpoints.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no listen address could be bound",
            )));
        }
        Ok(endpoints)
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Whether this endpoint sends announcements
    pub fn is_ipv4(&self) -> bool {
        self.local.is_ipv4()
    }
}

/// A datagram read by one of the receive tasks
struct Datagram {
    endpoint: usize,
    payload: Bytes,
    peer: SocketAddr,
}

/// Read datagrams from one endpoint until the reactor goes away
fn spawn_receiver(index: usize, endpoint: &ListenEndpoint, tx: mpsc::Sender<Datagram>) -> JoinHandle<()> {
    let socket = Arc::clone(&endpoint.socket);
    tokio::spawn(async move {
        // One byte more than the largest request, so oversized datagrams are seen as such
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    let datagram = Datagram {
                        endpoint: index,
                        payload: Bytes::copy_from_slice(&buf[..len]),
                        peer,
                    };
                    if tx.send(datagram).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("recvfrom: {}", e),
            }
        }
    })
}

/// The running daemon
pub struct Daemon<B, S> {
    server: Server<B, S>,
    endpoints: Vec<ListenEndpoint>,
    events: mpsc::Receiver<InterfaceEvent>,
}

impl<B: FirewallBackend, S: AddressSource> Daemon<B, S> {
    /// Assemble a daemon from a started server, its endpoints and a routing event feed
    pub fn new(server: Server<B, S>, endpoints: Vec<ListenEndpoint>, events: mpsc::Receiver<InterfaceEvent>) -> Self {
        Self {
            server,
            endpoints,
            events,
        }
    }

    /// Serve until `shutdown` completes, then flush all mappings
    ///
    /// Returns the server after the final rule rebuild. A failed interface
    /// query is fatal and also flushes the mappings before returning.
    pub async fn run<F>(mut self, shutdown: F) -> Result<Server<B, S>>
    where
        F: Future<Output = ()>,
    {
        let (tx, mut datagrams) = mpsc::channel(CHANNEL_CAPACITY);
        let receivers: Vec<JoinHandle<()>> = self
            .endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| spawn_receiver(index, endpoint, tx.clone()))
            .collect();
        drop(tx);

        tokio::pin!(shutdown);

        let outcome = loop {
            let deadline = self.server.next_deadline();
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                Some(datagram) = datagrams.recv() => {
                    self.handle_datagram(datagram).await;
                }
                Some(event) = self.events.recv() => {
                    if let Err(e) = self.server.handle_interface_event(&event, Instant::now()) {
                        error!("{}", e);
                        break Err(e);
                    }
                }
                _ = timer => {
                    self.fire_timers().await;
                }
            }
        };

        for receiver in receivers {
            receiver.abort();
        }

        if let Err(e) = self.server.shutdown() {
            warn!("unable to rebuild ruleset: {}", e);
        }

        outcome.map(|()| self.server)
    }

    async fn handle_datagram(&mut self, datagram: Datagram) {
        let Some(reply) = self
            .server
            .handle_datagram(&datagram.payload, datagram.peer, Instant::now())
        else {
            return;
        };

        let socket = &self.endpoints[datagram.endpoint].socket;
        if let Err(e) = socket.send_to(&reply, datagram.peer).await {
            warn!("sendto {}: {}", datagram.peer, e);
        }
    }

    async fn fire_timers(&mut self) {
        let announcements = self.server.fire_timers(Instant::now());
        let group = SocketAddrV4::new(ALL_HOSTS_GROUP, CLIENT_PORT);

        for packet in announcements {
            for endpoint in self.endpoints.iter().filter(|e| e.is_ipv4()) {
                debug!("Announcing from {}", endpoint.local_addr());
                if let Err(e) = endpoint.socket.send_to(&packet, group).await {
                    warn!("sendto {}: {}", group, e);
                }
            }
        }
    }
}

/// Resolve on SIGINT, SIGTERM or SIGHUP
pub fn termination_signal() -> io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
        };
        info!("exiting on signal {}", name);
    })
}

/// Start the daemon described by `config` and run it until a termination signal
pub async fn run(config: Config) -> Result<()> {
    let backend: Box<dyn FirewallBackend> = match config.firewall.backend {
        BackendKind::Nft => Box::new(NftBackend::new(config.firewall.table.clone())),
        BackendKind::Memory => Box::new(MemoryBackend::new()),
    };

    let monitor = InterfaceMonitor::new(config.interface.clone(), SystemAddresses);
    let mut server = Server::new(RuleSynchronizer::new(backend), monitor, Instant::now());
    server.start()?;

    let endpoints = ListenEndpoint::bind_all(&config.listen_addrs()?)?;

    let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let feed = monitor::spawn_event_feed(config.interface.clone(), events_tx)?;
    let shutdown = termination_signal()?;

    info!("startup");
    server.check_interface(Instant::now())?;

    let outcome = Daemon::new(server, endpoints, events_rx).run(shutdown).await;
    feed.abort();
    outcome.map(|_| ())
}
