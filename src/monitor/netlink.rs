//! rtnetlink change feed
//!
//! Subscribes to the IPv4 address and link multicast groups of a
//! `NETLINK_ROUTE` socket and turns the kernel messages into
//! [`InterfaceEvent`]s.

use super::InterfaceEvent;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::nlas::address::Nla as AddressNla;
use netlink_packet_route::nlas::link::Nla as LinkNla;
use netlink_packet_route::{AddressMessage, LinkMessage, RtnlMessage};
use netlink_sys::protocols::NETLINK_ROUTE;
use netlink_sys::{Socket, SocketAddr};
use std::io;
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// Multicast groups the feed listens to
const GROUPS: u32 = (libc::RTMGRP_IPV4_IFADDR | libc::RTMGRP_LINK) as u32;

/// Receive buffer size; one read may carry several messages
const RECV_BUFFER_SIZE: usize = 8192;

/// Interface name from an address label; aliases look like "eth0:1"
fn label_interface(label: &str) -> Option<String> {
    let name = label.split(':').next().unwrap_or(label);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn address_interface(message: &AddressMessage) -> Option<String> {
    message.nlas.iter().find_map(|nla| match nla {
        AddressNla::Label(label) => label_interface(label),
        _ => None,
    })
}

fn link_interface(message: &LinkMessage) -> Option<String> {
    message.nlas.iter().find_map(|nla| match nla {
        LinkNla::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

fn interface_event(message: &RtnlMessage) -> Option<InterfaceEvent> {
    match message {
        RtnlMessage::NewAddress(address) => address_interface(address).map(InterfaceEvent::AddressAdded),
        RtnlMessage::DelAddress(address) => address_interface(address).map(InterfaceEvent::AddressRemoved),
        RtnlMessage::DelLink(link) => link_interface(link).map(InterfaceEvent::InterfaceDeparted),
        _ => None,
    }
}

/// Decode every interface event in a netlink datagram
///
/// Messages that are not about addresses or departing links are skipped;
/// a message that fails to decode ends parsing.
pub fn parse_messages(buf: &[u8]) -> Vec<InterfaceEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let packet = match NetlinkMessage::<RtnlMessage>::deserialize(&buf[offset..]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Undecodable routing message: {}", e);
                break;
            }
        };

        let length = packet.header.length as usize;
        if length == 0 {
            break;
        }
        offset += length;

        if let NetlinkPayload::InnerMessage(message) = &packet.payload {
            events.extend(interface_event(message));
        }
    }

    events
}

/// Routing socket subscribed to address and link changes
pub struct NetlinkFeed {
    async_fd: AsyncFd<Socket>,
    buf: Vec<u8>,
}

impl NetlinkFeed {
    /// Open and bind the routing socket
    pub fn open() -> io::Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind(&SocketAddr::new(0, GROUPS))?;
        socket.set_non_blocking(true)?;

        Ok(Self {
            async_fd: AsyncFd::new(socket)?,
            buf: Vec::with_capacity(RECV_BUFFER_SIZE),
        })
    }

    /// Wait for the next datagram and decode it
    ///
    /// An `ENOBUFS` error means the kernel dropped messages.
    pub async fn next_events(&mut self) -> io::Result<Vec<InterfaceEvent>> {
        loop {
            let mut guard = self.async_fd.readable().await?;
            let buf = &mut self.buf;
            buf.clear();
            match guard.try_io(|inner| inner.get_ref().recv(buf, 0)) {
                Ok(Ok(_)) => return Ok(parse_messages(&self.buf)),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}
