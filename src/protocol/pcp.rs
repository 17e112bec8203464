//! PCP (Port Control Protocol) - RFC 6887
//!
//! Only the common request header is decoded. No opcode is served yet:
//! [`handle_request`] reports [`PcpError::NotImplemented`] and the dispatcher
//! answers with the NAT-PMP unsupported-version response, which tells a PCP
//! client to fall back to NAT-PMP.

use super::ProtocolError;
use bytes::{Buf, Bytes};
use std::net::{IpAddr, Ipv6Addr};
use thiserror::Error;

/// PCP protocol version
pub const PCP_VERSION: u8 = 2;

/// Size of the common request header
pub const PCP_HEADER_LEN: usize = 24;

/// PCP opcode values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PcpOpcode {
    /// Announce
    Announce = 0,
    /// Create or refresh a mapping
    Map = 1,
    /// Create or refresh a peer mapping
    Peer = 2,
}

impl PcpOpcode {
    /// Convert a raw opcode
    pub fn from_u8(opcode: u8) -> Option<Self> {
        match opcode {
            0 => Some(Self::Announce),
            1 => Some(Self::Map),
            2 => Some(Self::Peer),
            _ => None,
        }
    }
}

/// Errors from the PCP handler
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PcpError {
    /// Request was well formed but this opcode is not served
    #[error("PCP opcode {opcode} not implemented")]
    NotImplemented {
        /// Opcode received
        opcode: u8,
    },
}

/// The fixed 24 byte header of every PCP request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcpRequestHeader {
    /// Protocol version
    pub version: u8,
    /// Opcode without the R bit
    pub opcode: u8,
    /// Requested lifetime in seconds
    pub lifetime: u32,
    /// Address the client believes it has
    pub client_address: IpAddr,
}

impl PcpRequestHeader {
    /// Decode the common header of a PCP request
    pub fn parse(datagram: &[u8]) -> Result<Self, ProtocolError> {
        // Requests are at least a header long and a multiple of 4 bytes
        if datagram.len() < PCP_HEADER_LEN || datagram.len() % 4 != 0 {
            return Err(ProtocolError::Length {
                what: "PCP request",
                expected: PCP_HEADER_LEN,
                got: datagram.len(),
            });
        }

        let version = datagram[0];
        let opcode = datagram[1] & 0x7f;
        let mut buf = &datagram[4..];
        let lifetime = buf.get_u32();
        let client_address = parse_pcp_ip_address(&buf[..16])?;

        Ok(Self {
            version,
            opcode,
            lifetime,
            client_address,
        })
    }
}

/// Parse an address field, unwrapping IPv4-mapped IPv6 addresses
pub fn parse_pcp_ip_address(bytes: &[u8]) -> Result<IpAddr, ProtocolError> {
    let octets: [u8; 16] = bytes.try_into().map_err(|_| ProtocolError::Length {
        what: "PCP address",
        expected: 16,
        got: bytes.len(),
    })?;

    let addr = Ipv6Addr::from(octets);
    Ok(match addr.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(addr),
    })
}

/// Serve a PCP request
pub fn handle_request(header: &PcpRequestHeader) -> Result<Bytes, PcpError> {
    Err(PcpError::NotImplemented {
        opcode: header.opcode,
    })
}
