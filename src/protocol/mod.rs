//! Wire protocols spoken by the daemon
//!
//! Every datagram starts with the same two bytes, a version and an opcode.
//! The version selects the protocol:
//! - version 0 - NAT-PMP (RFC 6886), fully handled
//! - version 2 - PCP (RFC 6887), recognised but not implemented
//!
//! All multi-byte fields are in network byte order.

pub mod natpmp;
pub mod pcp;

use std::net::Ipv4Addr;
use thiserror::Error;

/// Port the daemon listens on (IANA assigned to NAT-PMP and PCP)
pub const SERVER_PORT: u16 = 5351;

/// Port clients listen on for address announcements
pub const CLIENT_PORT: u16 = 5350;

/// Multicast group announcements are sent to (all-hosts)
pub const ALL_HOSTS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// Largest datagram accepted from a client
pub const MAX_PACKET_SIZE: usize = 1100;

/// Bit set in the opcode of every response
pub const RESPONSE_BIT: u8 = 0x80;

/// Errors raised while decoding a datagram
///
/// None of these produce a response to the client; the datagram is dropped
/// after logging.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Datagram shorter than the common header
    #[error("datagram too short: {0} bytes")]
    Undersized(usize),

    /// Datagram longer than any supported request
    #[error("datagram too long: {0} bytes")]
    Oversized(usize),

    /// Request opcode with the response bit set
    #[error("opcode {0:#04x} has the response bit set")]
    ResponseOpcode(u8),

    /// Opcode that does not fit the packet being parsed
    #[error("unexpected opcode {0:#04x}")]
    UnexpectedOpcode(u8),

    /// Result code outside the NAT-PMP range
    #[error("unknown result code {0}")]
    UnknownResult(u16),

    /// Recognised opcode with the wrong length
    #[error("{what}, expected {expected} bytes, got {got}")]
    Length {
        /// Kind of request
        what: &'static str,
        /// Required length
        expected: usize,
        /// Received length
        got: usize,
    },
}

/// The two bytes shared by NAT-PMP and PCP requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    /// Protocol version
    pub version: u8,
    /// Request opcode
    pub opcode: u8,
}

impl CommonHeader {
    /// Decode the common header of a received datagram
    ///
    /// Rejects datagrams that cannot be a request at all: shorter than two
    /// bytes, longer than [`MAX_PACKET_SIZE`], or with the response bit set.
    pub fn parse(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() < 2 {
            return Err(ProtocolError::Undersized(datagram.len()));
        }
        if datagram.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::Oversized(datagram.len()));
        }

        let header = Self {
            version: datagram[0],
            opcode: datagram[1],
        };

        // No opcode in a request is greater than 127
        if header.opcode & RESPONSE_BIT != 0 {
            return Err(ProtocolError::ResponseOpcode(header.opcode));
        }

        Ok(header)
    }
}
