//! End-to-end tests driving the reactor over loopback UDP

use natpmpd::daemon::{Daemon, ListenEndpoint};
use natpmpd::firewall::RuleSynchronizer;
use natpmpd::firewall::memory::MemoryBackend;
use natpmpd::mapping::{DYNAMIC_PORT_FIRST, Protocol};
use natpmpd::monitor::{InterfaceEvent, InterfaceMonitor, StaticAddresses};
use natpmpd::protocol::natpmp::{
    AnnounceResponse, MappingRequest, MappingResponse, NatPmpResultCode, build_map_request,
};
use natpmpd::server::Server;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const INTERFACE: &str = "wan0";
const FIRST_ADDRESS: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);
const SECOND_ADDRESS: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

type TestServer = Server<MemoryBackend, StaticAddresses>;

fn started_server(source: &StaticAddresses) -> TestServer {
    let now = Instant::now();
    let rules = RuleSynchronizer::new(MemoryBackend::new()).with_retry_delay(Duration::ZERO);
    let mut server = Server::new(rules, InterfaceMonitor::new(INTERFACE, source.clone()), now);
    server.start().unwrap();
    server.check_interface(now).unwrap();
    server
}

async fn exchange(client: &UdpSocket, server: SocketAddr, request: &[u8]) -> Vec<u8> {
    client.send_to(request, server).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no reply from daemon")
        .unwrap();
    assert_eq!(from, server);
    buf[..len].to_vec()
}

async fn external_address(client: &UdpSocket, server: SocketAddr) -> Ipv4Addr {
    let reply = exchange(client, server, &[0, 0]).await;
    AnnounceResponse::parse(&reply).unwrap().address
}

#[tokio::test]
async fn test_mapping_lifecycle_over_loopback() {
    let source = StaticAddresses::new();
    source.set(INTERFACE, vec![IpAddr::V4(FIRST_ADDRESS)]);
    let server = started_server(&source);

    let endpoints = ListenEndpoint::bind_all(&[SocketAddr::from((Ipv4Addr::LOCALHOST, 0))]).unwrap();
    let server_addr = endpoints[0].local_addr();
    let (events_tx, events_rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let daemon = Daemon::new(server, endpoints, events_rx);
    let shutdown = async {
        let _ = stop_rx.await;
    };

    let client = async {
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        assert_eq!(external_address(&client, server_addr).await, FIRST_ADDRESS);

        let request = build_map_request(&MappingRequest {
            protocol: Protocol::Udp,
            internal_port: 45000,
            external_port: 0,
            lifetime: 3600,
        });
        let reply = exchange(&client, server_addr, &request).await;
        let mapped = MappingResponse::parse(&reply).unwrap();
        assert_eq!(mapped.result, NatPmpResultCode::Success);
        assert_eq!(mapped.internal_port, 45000);
        assert!(mapped.external_port >= DYNAMIC_PORT_FIRST);
        assert_eq!(mapped.lifetime, 3600);

        // Refresh gets the same port back
        let reply = exchange(&client, server_addr, &request).await;
        assert_eq!(
            MappingResponse::parse(&reply).unwrap().external_port,
            mapped.external_port
        );

        // Unknown versions get the short error response
        let reply = exchange(&client, server_addr, &[1, 0]).await;
        assert_eq!(reply.len(), 8);
        assert_eq!(&reply[..4], &[0, 0x80, 0, 1]);

        // Follow an address change on the monitored interface
        source.set(INTERFACE, vec![IpAddr::V4(SECOND_ADDRESS)]);
        events_tx
            .send(InterfaceEvent::AddressAdded(INTERFACE.to_string()))
            .await
            .unwrap();

        let mut seen = FIRST_ADDRESS;
        for _ in 0..50 {
            seen = external_address(&client, server_addr).await;
            if seen == SECOND_ADDRESS {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen, SECOND_ADDRESS);

        let _ = stop_tx.send(());
    };

    let (server, ()) = tokio::join!(daemon.run(shutdown), client);
    let server = server.unwrap();

    // Shutdown discarded the mapping and flushed the rules
    assert!(server.store().is_empty());
    assert!(server.timers().is_empty());
    assert!(server.rules().backend().rules().is_empty());
}

#[tokio::test]
async fn test_delete_over_loopback() {
    let source = StaticAddresses::new();
    source.set(INTERFACE, vec![IpAddr::V4(FIRST_ADDRESS)]);
    let server = started_server(&source);

    let endpoints = ListenEndpoint::bind_all(&[SocketAddr::from((Ipv4Addr::LOCALHOST, 0))]).unwrap();
    let server_addr = endpoints[0].local_addr();
    let (_events_tx, events_rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let daemon = Daemon::new(server, endpoints, events_rx);
    let shutdown = async {
        let _ = stop_rx.await;
    };

    let client = async {
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let map = |internal_port, lifetime| {
            build_map_request(&MappingRequest {
                protocol: Protocol::Tcp,
                internal_port,
                external_port: 0,
                lifetime,
            })
        };

        for port in [22, 80] {
            let reply = exchange(&client, server_addr, &map(port, 60)).await;
            assert_eq!(MappingResponse::parse(&reply).unwrap().result, NatPmpResultCode::Success);
        }

        let reply = exchange(&client, server_addr, &map(0, 0)).await;
        let deleted = MappingResponse::parse(&reply).unwrap();
        assert_eq!(
            (deleted.internal_port, deleted.external_port, deleted.lifetime),
            (0, 0, 0)
        );

        let _ = stop_tx.send(());
    };

    let (server, ()) = tokio::join!(daemon.run(shutdown), client);
    let server = server.unwrap();
    // Initial rebuild, two creations, one wildcard delete, shutdown
    assert_eq!(server.rules().backend().commit_attempts(), 5);
}
