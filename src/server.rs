//! Protocol dispatcher and daemon state
//!
//! [`Server`] owns every piece of mutable state: the mapping store, the
//! gateway state, the timer queue, the announcer, the rule synchronizer and
//! the interface monitor. It performs no I/O of its own. The reactor feeds it
//! datagrams, interface events and the current time, and sends whatever it
//! returns. Each handler leaves the store and the firewall rules consistent
//! before returning.

use crate::announce::Announcer;
use crate::firewall::{FirewallBackend, RuleSynchronizer};
use crate::gateway::GatewayState;
use crate::mapping::MappingStore;
use crate::monitor::{AddressSource, InterfaceEvent, InterfaceMonitor};
use crate::protocol::natpmp::{
    self, MappingRequest, MappingResponse, NATPMP_VERSION, NatPmpResultCode, Request,
};
use crate::protocol::pcp::{self, PCP_VERSION, PcpRequestHeader};
use crate::protocol::CommonHeader;
use crate::timer::{TimerEvent, Timers};
use crate::{Error, Result};
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of re-reading the external interface address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressChange {
    /// The address is the one already cached
    Unchanged,
    /// The cached address was replaced
    Changed {
        /// Address before the change
        previous: Ipv4Addr,
        /// Address now in use, unspecified if the interface has none
        current: Ipv4Addr,
    },
}

/// Single-threaded owner of the daemon state
pub struct Server<B, S> {
    store: MappingStore,
    gateway: GatewayState,
    timers: Timers<TimerEvent>,
    announcer: Announcer,
    rules: RuleSynchronizer<B>,
    monitor: InterfaceMonitor<S>,
}

impl<B: FirewallBackend, S: AddressSource> Server<B, S> {
    /// Create a server started at `start_time`
    pub fn new(rules: RuleSynchronizer<B>, monitor: InterfaceMonitor<S>, start_time: Instant) -> Self {
        Self {
            store: MappingStore::new(),
            gateway: GatewayState::new(start_time),
            timers: Timers::new(),
            announcer: Announcer::new(),
            rules,
            monitor,
        }
    }

    /// Replace the (empty) mapping store, e.g. with one using a seeded RNG
    pub fn with_mapping_store(mut self, store: MappingStore) -> Self {
        self.store = store;
        self
    }

    /// Clear rules left by a previous run and install the empty rule set
    pub fn start(&mut self) -> Result<()> {
        self.rules.reset()?;
        self.rules.rebuild(self.store.iter())?;
        Ok(())
    }

    /// Handle one received datagram, returning the reply to send to `peer`
    pub fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr, now: Instant) -> Option<Bytes> {
        let header = match CommonHeader::parse(datagram) {
            Ok(header) => header,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", peer, e);
                return None;
            }
        };

        match header.version {
            NATPMP_VERSION => self.handle_natpmp(datagram, peer, now),
            PCP_VERSION => self.handle_pcp(datagram, peer, now),
            version => {
                warn!("bad version {} request from {}", version, peer);
                Some(natpmp::build_unsupported_version(self.gateway.sssoe(now)))
            }
        }
    }

    /// Hand a version 2 request to the PCP extension point
    ///
    /// Anything it does not serve, malformed headers included, gets the
    /// unsupported-version response.
    fn handle_pcp(&mut self, datagram: &[u8], peer: SocketAddr, now: Instant) -> Option<Bytes> {
        let served = match PcpRequestHeader::parse(datagram) {
            Ok(header) => pcp::handle_request(&header).map_err(|e| e.to_string()),
            Err(e) => Err(format!("malformed PCP request: {}", e)),
        };

        match served {
            Ok(reply) => Some(reply),
            Err(reason) => {
                info!(
                    "{} from {}, replying {}",
                    reason,
                    peer,
                    NatPmpResultCode::UnsupportedVersion.to_error_message()
                );
                Some(natpmp::build_unsupported_version(self.gateway.sssoe(now)))
            }
        }
    }

    fn handle_natpmp(&mut self, datagram: &[u8], peer: SocketAddr, now: Instant) -> Option<Bytes> {
        let SocketAddr::V4(peer) = peer else {
            debug!("Ignoring NAT-PMP request over IPv6 from {}", peer);
            return None;
        };

        let request = match Request::decode(datagram) {
            Ok(request) => request,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };

        let sssoe = self.gateway.sssoe(now);
        let result = if self.gateway.has_external_address() {
            NatPmpResultCode::Success
        } else {
            NatPmpResultCode::NetworkFailure
        };

        let reply = match request {
            Request::ExternalAddress => {
                natpmp::build_announce_response(result, sssoe, self.gateway.external_address())
            }
            Request::Mapping(mapping) => {
                let response = self.handle_mapping(&mapping, *peer.ip(), result, sssoe, now);
                natpmp::build_map_response(&response)
            }
            Request::Unsupported { opcode, raw } => {
                debug!("Unsupported opcode {} from {}", opcode, peer);
                natpmp::build_unsupported_opcode(&raw)
            }
        };
        Some(reply)
    }

    /// Apply a mapping request from `client`
    fn handle_mapping(
        &mut self,
        request: &MappingRequest,
        client: Ipv4Addr,
        result: NatPmpResultCode,
        sssoe: u32,
        now: Instant,
    ) -> MappingResponse {
        let external = self.gateway.external_address();
        info!(
            "{} request, {}:{} -> {}:{}, expires in {} seconds",
            request.protocol, external, request.external_port, client, request.internal_port, request.lifetime
        );

        let mut response = MappingResponse {
            protocol: request.protocol,
            result,
            sssoe,
            internal_port: request.internal_port,
            external_port: 0,
            lifetime: 0,
        };

        // Deletions go ahead without an external address; only creation is refused
        let changed = if request.internal_port == 0 {
            let count = self.store.remove(&mut self.timers, request.protocol, client, 0);
            info!("{} mappings removed", count);
            count > 0
        } else if request.lifetime == 0 {
            let count = self
                .store
                .remove(&mut self.timers, request.protocol, client, request.internal_port);
            info!("mapping removed");
            count > 0
        } else if result != NatPmpResultCode::Success {
            warn!(
                "refusing {} mapping for {}: {}",
                request.protocol,
                client,
                result.to_error_message()
            );
            false
        } else {
            let assignment = self.store.create_or_refresh(
                &mut self.timers,
                now,
                request.protocol,
                SocketAddrV4::new(client, request.internal_port),
                SocketAddrV4::new(external, request.external_port),
                Duration::from_secs(u64::from(request.lifetime)),
            );
            response.external_port = assignment.external_port;
            response.lifetime = request.lifetime;
            assignment.created
        };

        if changed {
            self.rebuild_rules();
        }
        response
    }

    /// Rebuild the firewall rules, logging a failure
    ///
    /// The mapping store stays authoritative when the backend refuses.
    fn rebuild_rules(&mut self) {
        if let Err(e) = self.rules.rebuild(self.store.iter()) {
            warn!("unable to rebuild ruleset: {}", e);
        }
    }

    /// React to a routing event
    pub fn handle_interface_event(&mut self, event: &InterfaceEvent, now: Instant) -> Result<AddressChange> {
        if !self.monitor.concerns(event) {
            return Ok(AddressChange::Unchanged);
        }
        debug!("Interface event {:?}", event);
        self.check_interface(now)
    }

    /// Re-read the external address and start announcing it if it changed
    pub fn check_interface(&mut self, now: Instant) -> Result<AddressChange> {
        let current = self.monitor.current_address().map_err(|e| {
            Error::Interface(format!("unable to query {}: {}", self.monitor.interface(), e))
        })?;

        let previous = self.gateway.external_address();
        if current == previous {
            return Ok(AddressChange::Unchanged);
        }

        self.gateway.set_external_address(current);
        self.announcer.cancel(&mut self.timers);

        if current.is_unspecified() {
            info!("{} has no IPv4 address", self.monitor.interface());
        } else {
            info!("external address of {} is {}", self.monitor.interface(), current);
            self.announcer.restart(&mut self.timers, now);
        }

        Ok(AddressChange::Changed { previous, current })
    }

    /// Earliest instant at which [`Server::fire_timers`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Run every timer due at `now`
    ///
    /// Returns the address announcements to multicast.
    pub fn fire_timers(&mut self, now: Instant) -> Vec<Bytes> {
        let mut announcements = Vec::new();

        while let Some((_, event)) = self.timers.pop_due(now) {
            match event {
                TimerEvent::Expire(id) => {
                    if let Some(mapping) = self.store.expire(id) {
                        info!("expiring mapping {}", mapping);
                        self.rebuild_rules();
                    }
                }
                TimerEvent::Announce => {
                    announcements.push(natpmp::build_announce_response(
                        NatPmpResultCode::Success,
                        self.gateway.sssoe(now),
                        self.gateway.external_address(),
                    ));
                    self.announcer.on_sent(&mut self.timers, now);
                }
            }
        }

        announcements
    }

    /// Drop every mapping and timer, then flush the firewall rules
    pub fn shutdown(&mut self) -> Result<()> {
        let count = self.store.clear(&mut self.timers);
        self.announcer.cancel(&mut self.timers);
        self.timers.clear();
        debug!("Discarded {} mappings", count);

        self.rules.rebuild(self.store.iter())?;
        Ok(())
    }

    /// The mapping store
    pub fn store(&self) -> &MappingStore {
        &self.store
    }

    /// The gateway state
    pub fn gateway(&self) -> &GatewayState {
        &self.gateway
    }

    /// The pending timers
    pub fn timers(&self) -> &Timers<TimerEvent> {
        &self.timers
    }

    /// The rule synchronizer and its backend
    pub fn rules(&self) -> &RuleSynchronizer<B> {
        &self.rules
    }

    /// The rule synchronizer, mutably
    pub fn rules_mut(&mut self) -> &mut RuleSynchronizer<B> {
        &mut self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announce::ANNOUNCE_DELAYS;
    use crate::firewall::{BackendError, RedirectRule};
    use crate::firewall::memory::MemoryBackend;
    use crate::mapping::{DYNAMIC_PORT_FIRST, DYNAMIC_PORT_LAST, Protocol};
    use crate::monitor::StaticAddresses;
    use crate::protocol::natpmp::{AnnounceResponse, build_map_request};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::net::{IpAddr, Ipv6Addr};

    const GATEWAY: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);
    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    type TestServer = Server<MemoryBackend, StaticAddresses>;

    fn server_with(addresses: &[Ipv4Addr]) -> (TestServer, StaticAddresses, Instant) {
        let source = StaticAddresses::new();
        source.set("em0", addresses.iter().map(|a| IpAddr::V4(*a)).collect());

        let now = Instant::now();
        let rules = RuleSynchronizer::new(MemoryBackend::new()).with_retry_delay(Duration::ZERO);
        let mut server = Server::new(rules, InterfaceMonitor::new("em0", source.clone()), now)
            .with_mapping_store(MappingStore::with_rng(StdRng::seed_from_u64(3)));
        server.start().unwrap();
        server.check_interface(now).unwrap();
        (server, source, now)
    }

    fn server() -> (TestServer, StaticAddresses, Instant) {
        server_with(&[GATEWAY])
    }

    fn peer() -> SocketAddr {
        SocketAddr::from((CLIENT, 40000))
    }

    fn map_request(protocol: Protocol, internal_port: u16, external_port: u16, lifetime: u32) -> Bytes {
        build_map_request(&MappingRequest {
            protocol,
            internal_port,
            external_port,
            lifetime,
        })
    }

    fn send_map(
        server: &mut TestServer,
        now: Instant,
        protocol: Protocol,
        internal_port: u16,
        lifetime: u32,
    ) -> MappingResponse {
        let reply = server
            .handle_datagram(&map_request(protocol, internal_port, 0, lifetime), peer(), now)
            .unwrap();
        MappingResponse::parse(&reply).unwrap()
    }

    /// Fire timers until no announcement is pending, returning their send times
    fn drain_announcements(server: &mut TestServer) -> Vec<(Instant, Bytes)> {
        let mut sent = Vec::new();
        while let Some(deadline) = server.next_deadline() {
            for packet in server.fire_timers(deadline) {
                sent.push((deadline, packet));
            }
        }
        sent
    }

    #[test]
    fn test_map_udp_scenario() {
        let (mut server, _, now) = server();
        let commits = server.rules().backend().commit_attempts();

        let response = send_map(&mut server, now, Protocol::Udp, 45000, 3600);

        assert_eq!(response.result, NatPmpResultCode::Success);
        assert_eq!(response.protocol, Protocol::Udp);
        assert_eq!(response.internal_port, 45000);
        assert_eq!(response.lifetime, 3600);
        assert!((DYNAMIC_PORT_FIRST..=DYNAMIC_PORT_LAST).contains(&response.external_port));

        assert_eq!(server.store().len(), 1);
        let mapping = server.store().iter().next().unwrap();
        assert_eq!(mapping.external, SocketAddrV4::new(GATEWAY, response.external_port));
        assert_eq!(mapping.internal, SocketAddrV4::new(CLIENT, 45000));

        assert_eq!(server.rules().backend().commit_attempts(), commits + 1);
        assert_eq!(server.rules().backend().rules().len(), 1);
    }

    #[test]
    fn test_zero_lifetime_deletes_mapping() {
        let (mut server, _, now) = server();
        send_map(&mut server, now, Protocol::Udp, 45000, 3600);
        let commits = server.rules().backend().commit_attempts();

        let response = send_map(&mut server, now, Protocol::Udp, 45000, 0);

        assert_eq!(response.result, NatPmpResultCode::Success);
        assert_eq!(response.internal_port, 45000);
        assert_eq!(response.external_port, 0);
        assert_eq!(response.lifetime, 0);
        assert!(server.store().is_empty());
        assert_eq!(server.rules().backend().commit_attempts(), commits + 1);
        assert!(server.rules().backend().rules().is_empty());
    }

    #[test]
    fn test_refresh_keeps_port_without_rebuild() {
        let (mut server, _, now) = server();
        let first = send_map(&mut server, now, Protocol::Tcp, 8080, 60);
        let commits = server.rules().backend().commit_attempts();

        let second = send_map(&mut server, now + Duration::from_secs(30), Protocol::Tcp, 8080, 120);

        assert_eq!(second.external_port, first.external_port);
        assert_eq!(second.lifetime, 120);
        assert_eq!(server.store().len(), 1);
        assert_eq!(server.rules().backend().commit_attempts(), commits);
    }

    #[test]
    fn test_related_protocol_shares_port() {
        let (mut server, _, now) = server();
        let udp = send_map(&mut server, now, Protocol::Udp, 5000, 60);
        let tcp = send_map(&mut server, now, Protocol::Tcp, 5000, 60);

        assert_eq!(tcp.external_port, udp.external_port);
        assert_eq!(server.rules().backend().rules().len(), 2);
    }

    #[test]
    fn test_wildcard_delete_removes_all_for_client() {
        let (mut server, _, now) = server();
        for port in [1000, 2000, 3000] {
            send_map(&mut server, now, Protocol::Udp, port, 60);
        }
        send_map(&mut server, now, Protocol::Tcp, 1000, 60);

        let response = send_map(&mut server, now, Protocol::Udp, 0, 0);
        assert_eq!((response.internal_port, response.external_port, response.lifetime), (0, 0, 0));
        assert_eq!(server.store().len(), 1);
        assert_eq!(server.rules().backend().rules().len(), 1);

        // Nothing left to delete: no error and no rebuild
        let commits = server.rules().backend().commit_attempts();
        let response = send_map(&mut server, now, Protocol::Udp, 0, 0);
        assert_eq!(response.result, NatPmpResultCode::Success);
        assert_eq!(server.rules().backend().commit_attempts(), commits);
    }

    #[test]
    fn test_no_external_address_is_network_failure() {
        let (mut server, _, now) = server_with(&[]);

        let response = send_map(&mut server, now, Protocol::Udp, 45000, 3600);
        assert_eq!(response.result, NatPmpResultCode::NetworkFailure);
        assert_eq!(response.external_port, 0);
        assert!(server.store().is_empty());

        let reply = server.handle_datagram(&[0, 0], peer(), now).unwrap();
        let announce = AnnounceResponse::parse(&reply).unwrap();
        assert_eq!(announce.result, NatPmpResultCode::NetworkFailure);
        assert_eq!(announce.address, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_deletes_work_without_external_address() {
        let (mut server, source, now) = server();
        send_map(&mut server, now, Protocol::Udp, 45000, 3600);
        send_map(&mut server, now, Protocol::Udp, 45001, 3600);
        send_map(&mut server, now, Protocol::Tcp, 22, 3600);
        assert_eq!(server.rules().backend().rules().len(), 3);

        // PPPoE session drops
        source.remove("em0");
        server
            .handle_interface_event(&InterfaceEvent::InterfaceDeparted("em0".into()), now)
            .unwrap();

        let response = send_map(&mut server, now, Protocol::Udp, 45000, 0);
        assert_eq!(response.result, NatPmpResultCode::NetworkFailure);
        assert_eq!(server.store().len(), 2);
        assert_eq!(server.rules().backend().rules().len(), 2);

        let response = send_map(&mut server, now, Protocol::Udp, 0, 0);
        assert_eq!(response.result, NatPmpResultCode::NetworkFailure);
        assert_eq!(server.store().len(), 1);
        assert_eq!(server.rules().backend().rules().len(), 1);

        // Creation stays refused
        let response = send_map(&mut server, now, Protocol::Udp, 45000, 3600);
        assert_eq!(response.result, NatPmpResultCode::NetworkFailure);
        assert_eq!((response.external_port, response.lifetime), (0, 0));
        assert_eq!(server.store().len(), 1);
    }

    #[test]
    fn test_start_clears_stale_rules() {
        // Left behind by a previous run
        let stale = RedirectRule {
            protocol: Protocol::Tcp,
            external: SocketAddrV4::new(GATEWAY, 50022),
            internal: SocketAddrV4::new(CLIENT, 22),
        };
        let mut backend = MemoryBackend::new();
        backend.begin_transaction().unwrap();
        backend.add_redirect(&stale).unwrap();
        backend.commit().unwrap();
        assert_eq!(backend.rules().len(), 1);

        let now = Instant::now();
        let rules = RuleSynchronizer::new(backend).with_retry_delay(Duration::ZERO);
        let mut server = Server::new(rules, InterfaceMonitor::new("em0", StaticAddresses::new()), now);
        server.start().unwrap();

        assert!(server.rules().backend().rules().is_empty());
        assert!(!server.rules().backend().in_transaction());
    }

    #[test]
    fn test_rebuild_failure_still_answers_success() {
        let (mut server, _, now) = server();
        server
            .rules_mut()
            .backend_mut()
            .fail_next_commit(BackendError::Failed("ruleset locked".to_string()));

        let response = send_map(&mut server, now, Protocol::Udp, 45000, 3600);
        assert_eq!(response.result, NatPmpResultCode::Success);
        assert_eq!(server.store().len(), 1);
        assert!(server.rules().backend().rules().is_empty());
    }

    #[test]
    fn test_address_request() {
        let (mut server, _, now) = server();
        let later = now + Duration::from_secs(42);

        let reply = server.handle_datagram(&[0, 0], peer(), later).unwrap();
        let response = AnnounceResponse::parse(&reply).unwrap();
        assert_eq!(response.result, NatPmpResultCode::Success);
        assert_eq!(response.sssoe, 42);
        assert_eq!(response.address, GATEWAY);
    }

    #[test]
    fn test_malformed_requests_are_dropped() {
        let (mut server, _, now) = server();

        assert!(server.handle_datagram(&[0], peer(), now).is_none());
        assert!(server.handle_datagram(&[0, 0, 0], peer(), now).is_none());
        assert!(server.handle_datagram(&[0, 1, 0, 0, 0, 1], peer(), now).is_none());
        assert!(server.handle_datagram(&[0, 0x81], peer(), now).is_none());
        assert!(server.handle_datagram(&[0; 1101], peer(), now).is_none());
        assert!(server.store().is_empty());
    }

    #[test]
    fn test_unsupported_version() {
        let (mut server, _, now) = server();

        let reply = server.handle_datagram(&[1, 0], peer(), now).unwrap();
        assert_eq!(&reply[..], &[0, 0x80, 0, 1, 0, 0, 0, 0]);

        // PCP requests reach the extension point and get the same answer
        let mut pcp = vec![2, 1, 0, 0];
        pcp.extend_from_slice(&3600u32.to_be_bytes());
        pcp.extend_from_slice(&Ipv4Addr::new(10, 0, 0, 5).to_ipv6_mapped().octets());
        let reply = server.handle_datagram(&pcp, peer(), now).unwrap();
        assert_eq!(reply.len(), 8);
        assert_eq!(reply[3], NatPmpResultCode::UnsupportedVersion as u8);

        // So do version 2 datagrams too short for a PCP header
        for request in [&[2u8, 0][..], &[2, 1, 0, 0, 0, 0, 0, 0][..], &[2, 1, 0, 0, 0][..]] {
            let reply = server.handle_datagram(request, peer(), now).unwrap();
            assert_eq!(&reply[..4], &[0, 0x80, 0, 1]);
        }
    }

    #[test]
    fn test_unsupported_opcode_echoed() {
        let (mut server, _, now) = server();
        let request = [0, 7, 0, 0, 0xde, 0xad];

        let reply = server.handle_datagram(&request, peer(), now).unwrap();
        assert_eq!(&reply[..], &[0, 0x87, 0, 5, 0xde, 0xad]);
    }

    #[test]
    fn test_natpmp_over_ipv6_ignored() {
        let (mut server, _, now) = server();
        let peer = SocketAddr::from((Ipv6Addr::LOCALHOST, 40000));

        let request = map_request(Protocol::Udp, 45000, 0, 3600);
        assert!(server.handle_datagram(&request, peer, now).is_none());
        assert!(server.store().is_empty());
    }

    #[test]
    fn test_mapping_expires() {
        let (mut server, _, now) = server();
        drain_announcements(&mut server);
        send_map(&mut server, now, Protocol::Udp, 45000, 60);

        assert!(server.fire_timers(now + Duration::from_secs(59)).is_empty());
        assert_eq!(server.store().len(), 1);

        server.fire_timers(now + Duration::from_secs(60));
        assert!(server.store().is_empty());
        assert!(server.rules().backend().rules().is_empty());
        assert!(server.timers().is_empty());
    }

    #[test]
    fn test_deleted_mapping_timer_never_fires() {
        let (mut server, _, now) = server();
        drain_announcements(&mut server);
        send_map(&mut server, now, Protocol::Udp, 45000, 60);
        send_map(&mut server, now, Protocol::Udp, 45000, 0);

        assert!(server.timers().is_empty());
        assert_eq!(server.next_deadline(), None);
    }

    #[test]
    fn test_startup_announces_ten_times() {
        let (mut server, _, now) = server();
        let sent = drain_announcements(&mut server);

        assert_eq!(sent.len(), ANNOUNCE_DELAYS.len());
        assert_eq!(sent[0].0, now);
        for (_, packet) in &sent {
            let announce = AnnounceResponse::parse(packet).unwrap();
            assert_eq!(announce.address, GATEWAY);
            assert_eq!(announce.result, NatPmpResultCode::Success);
        }
        // The last one carries the uptime at send time
        let last = AnnounceResponse::parse(&sent[9].1).unwrap();
        assert_eq!(last.sssoe, 127);
    }

    #[test]
    fn test_quick_address_changes_give_one_burst() {
        let (mut server, source, now) = server();
        let final_address = Ipv4Addr::new(203, 0, 113, 50);

        for (i, address) in [
            Ipv4Addr::new(203, 0, 113, 10),
            Ipv4Addr::new(203, 0, 113, 20),
            final_address,
        ]
        .into_iter()
        .enumerate()
        {
            let at = now + Duration::from_millis(i as u64);
            source.set("em0", vec![IpAddr::V4(address)]);
            let change = server
                .handle_interface_event(&InterfaceEvent::AddressAdded("em0".into()), at)
                .unwrap();
            assert!(matches!(change, AddressChange::Changed { current, .. } if current == address));
            assert_eq!(server.timers().len(), 1);
        }

        let sent = drain_announcements(&mut server);
        assert_eq!(sent.len(), 10);
        for (_, packet) in &sent {
            assert_eq!(AnnounceResponse::parse(packet).unwrap().address, final_address);
        }
        assert!(server.timers().is_empty());
    }

    #[test]
    fn test_address_loss_stops_announcing() {
        let (mut server, source, now) = server();
        source.remove("em0");

        let change = server
            .handle_interface_event(&InterfaceEvent::InterfaceDeparted("em0".into()), now)
            .unwrap();
        assert_eq!(
            change,
            AddressChange::Changed {
                previous: GATEWAY,
                current: Ipv4Addr::UNSPECIFIED
            }
        );
        assert!(!server.gateway().has_external_address());
        assert!(server.timers().is_empty());
    }

    #[test]
    fn test_unchanged_or_foreign_events_are_noops() {
        let (mut server, _, now) = server();
        drain_announcements(&mut server);

        let change = server
            .handle_interface_event(&InterfaceEvent::AddressAdded("em0".into()), now)
            .unwrap();
        assert_eq!(change, AddressChange::Unchanged);

        let change = server
            .handle_interface_event(&InterfaceEvent::AddressRemoved("em1".into()), now)
            .unwrap();
        assert_eq!(change, AddressChange::Unchanged);
        assert!(server.timers().is_empty());
    }

    #[test]
    fn test_shutdown_flushes_everything() {
        let (mut server, _, now) = server();
        send_map(&mut server, now, Protocol::Udp, 45000, 3600);
        send_map(&mut server, now, Protocol::Tcp, 22, 3600);

        server.shutdown().unwrap();

        assert!(server.store().is_empty());
        assert!(server.timers().is_empty());
        assert!(server.rules().backend().rules().is_empty());
    }
}
