//! NAT-PMP (NAT Port Mapping Protocol) wire format - RFC 6886
//!
//! Requests the daemon understands:
//!
//! ```text
//! address request   | version | opcode=0 |
//! mapping request   | version | opcode=1/2 | reserved:16 | internal:16 | external:16 | lifetime:32 |
//! ```
//!
//! Every response repeats the version, sets the high bit of the opcode and
//! adds a result code and the seconds since start of epoch (SSSOE):
//!
//! ```text
//! address response  | 0 | 128 | result:16 | sssoe:32 | address:32 |                   (12 bytes)
//! mapping response  | 0 | 129/130 | result:16 | sssoe:32 | internal:16 | external:16 | lifetime:32 | (16 bytes)
//! ```

use super::{ProtocolError, RESPONSE_BIT};
use crate::mapping::Protocol;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// NAT-PMP protocol version, also the highest version this daemon speaks
pub const NATPMP_VERSION: u8 = 0;

/// Length of an address request
pub const ANNOUNCE_REQUEST_LEN: usize = 2;

/// Length of an address response
pub const ANNOUNCE_RESPONSE_LEN: usize = 12;

/// Length of a mapping request
pub const MAPPING_REQUEST_LEN: usize = 12;

/// Length of a mapping response
pub const MAPPING_RESPONSE_LEN: usize = 16;

/// Length of an unsupported-version response
pub const UNSUPPORTED_VERSION_LEN: usize = 8;

/// NAT-PMP opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NatPmpOpcode {
    /// External address request
    ExternalAddress = 0,
    /// UDP port mapping
    MapUdp = 1,
    /// TCP port mapping
    MapTcp = 2,
}

impl NatPmpOpcode {
    /// Convert a raw opcode, `None` for opcodes this daemon does not know
    pub fn from_u8(opcode: u8) -> Option<Self> {
        match opcode {
            0 => Some(Self::ExternalAddress),
            1 => Some(Self::MapUdp),
            2 => Some(Self::MapTcp),
            _ => None,
        }
    }

    /// Mapping opcode for a transport protocol
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Udp => Self::MapUdp,
            Protocol::Tcp => Self::MapTcp,
        }
    }
}

/// NAT-PMP result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NatPmpResultCode {
    /// Request honoured
    Success = 0,
    /// Version not supported
    UnsupportedVersion = 1,
    /// Refused by policy
    NotAuthorized = 2,
    /// Gateway has no usable external address
    NetworkFailure = 3,
    /// Gateway cannot create more mappings
    OutOfResources = 4,
    /// Opcode not supported
    UnsupportedOpcode = 5,
}

impl NatPmpResultCode {
    /// Convert a raw result code
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::UnsupportedVersion),
            2 => Some(Self::NotAuthorized),
            3 => Some(Self::NetworkFailure),
            4 => Some(Self::OutOfResources),
            5 => Some(Self::UnsupportedOpcode),
            _ => None,
        }
    }

    /// Human readable description
    pub fn to_error_message(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::UnsupportedVersion => "Unsupported NAT-PMP version",
            Self::NotAuthorized => "Not authorized/refused",
            Self::NetworkFailure => "Network failure",
            Self::OutOfResources => "Out of resources",
            Self::UnsupportedOpcode => "Unsupported opcode",
        }
    }
}

/// A mapping request as sent by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRequest {
    /// Transport protocol selected by the opcode
    pub protocol: Protocol,
    /// Port on the client the traffic should reach
    pub internal_port: u16,
    /// Port the client would like on the gateway
    pub external_port: u16,
    /// Requested lifetime in seconds, 0 to delete
    pub lifetime: u32,
}

/// Decoded NAT-PMP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// External address request
    ExternalAddress,
    /// UDP or TCP mapping request
    Mapping(MappingRequest),
    /// Any other opcode; the raw datagram is kept so it can be echoed back
    Unsupported {
        /// Opcode received
        opcode: u8,
        /// The whole request
        raw: Bytes,
    },
}

impl Request {
    /// Decode a NAT-PMP request
    ///
    /// The common header should already have been validated. A recognised
    /// opcode with the wrong length is an error and gets no response.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let Some(&opcode) = datagram.get(1) else {
            return Err(ProtocolError::Undersized(datagram.len()));
        };

        match NatPmpOpcode::from_u8(opcode) {
            Some(NatPmpOpcode::ExternalAddress) => {
                if datagram.len() != ANNOUNCE_REQUEST_LEN {
                    return Err(ProtocolError::Length {
                        what: "address request",
                        expected: ANNOUNCE_REQUEST_LEN,
                        got: datagram.len(),
                    });
                }
                Ok(Self::ExternalAddress)
            }
            Some(op @ (NatPmpOpcode::MapUdp | NatPmpOpcode::MapTcp)) => {
                if datagram.len() != MAPPING_REQUEST_LEN {
                    return Err(ProtocolError::Length {
                        what: "mapping request",
                        expected: MAPPING_REQUEST_LEN,
                        got: datagram.len(),
                    });
                }

                let protocol = if op == NatPmpOpcode::MapUdp {
                    Protocol::Udp
                } else {
                    Protocol::Tcp
                };

                // Skip version, opcode and the reserved field
                let mut buf = &datagram[4..];
                Ok(Self::Mapping(MappingRequest {
                    protocol,
                    internal_port: buf.get_u16(),
                    external_port: buf.get_u16(),
                    lifetime: buf.get_u32(),
                }))
            }
            None => Ok(Self::Unsupported {
                opcode,
                raw: Bytes::copy_from_slice(datagram),
            }),
        }
    }
}

/// Build a mapping request packet
pub fn build_map_request(request: &MappingRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(MAPPING_REQUEST_LEN);
    buf.put_u8(NATPMP_VERSION);
    buf.put_u8(NatPmpOpcode::for_protocol(request.protocol) as u8);
    buf.put_u16(0);
    buf.put_u16(request.internal_port);
    buf.put_u16(request.external_port);
    buf.put_u32(request.lifetime);
    buf.freeze()
}

/// Build an address response, also used for unsolicited announcements
pub fn build_announce_response(result: NatPmpResultCode, sssoe: u32, address: Ipv4Addr) -> Bytes {
    let mut buf = BytesMut::with_capacity(ANNOUNCE_RESPONSE_LEN);
    buf.put_u8(NATPMP_VERSION);
    buf.put_u8(NatPmpOpcode::ExternalAddress as u8 | RESPONSE_BIT);
    buf.put_u16(result as u16);
    buf.put_u32(sssoe);
    buf.put_slice(&address.octets());
    buf.freeze()
}

/// Build a mapping response
pub fn build_map_response(response: &MappingResponse) -> Bytes {
    let mut buf = BytesMut::with_capacity(MAPPING_RESPONSE_LEN);
    buf.put_u8(NATPMP_VERSION);
    buf.put_u8(NatPmpOpcode::for_protocol(response.protocol) as u8 | RESPONSE_BIT);
    buf.put_u16(response.result as u16);
    buf.put_u32(response.sssoe);
    buf.put_u16(response.internal_port);
    buf.put_u16(response.external_port);
    buf.put_u32(response.lifetime);
    buf.freeze()
}

/// Build the 8 byte response sent for any version above [`NATPMP_VERSION`]
pub fn build_unsupported_version(sssoe: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(UNSUPPORTED_VERSION_LEN);
    buf.put_u8(NATPMP_VERSION);
    buf.put_u8(RESPONSE_BIT);
    buf.put_u16(NatPmpResultCode::UnsupportedVersion as u16);
    buf.put_u32(sssoe);
    buf.freeze()
}

/// Echo an unsupported request back with the result code filled in
///
/// The request is returned verbatim apart from the version, the response bit
/// and the result field. Requests too short to hold a result are padded.
pub fn build_unsupported_opcode(request: &[u8]) -> Bytes {
    let mut buf = BytesMut::from(request);
    if buf.len() < 4 {
        buf.resize(4, 0);
    }
    buf[0] = NATPMP_VERSION;
    buf[1] |= RESPONSE_BIT;
    buf[2..4].copy_from_slice(&(NatPmpResultCode::UnsupportedOpcode as u16).to_be_bytes());
    buf.freeze()
}

/// Decoded mapping response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingResponse {
    /// Transport protocol from the opcode
    pub protocol: Protocol,
    /// Result code
    pub result: NatPmpResultCode,
    /// Seconds since start of epoch
    pub sssoe: u32,
    /// Internal port echoed from the request
    pub internal_port: u16,
    /// External port granted
    pub external_port: u16,
    /// Lifetime granted in seconds
    pub lifetime: u32,
}

impl MappingResponse {
    /// Parse a mapping response packet
    pub fn parse(response: &[u8]) -> Result<Self, ProtocolError> {
        if response.len() != MAPPING_RESPONSE_LEN {
            return Err(ProtocolError::Length {
                what: "mapping response",
                expected: MAPPING_RESPONSE_LEN,
                got: response.len(),
            });
        }

        let protocol = match NatPmpOpcode::from_u8(response[1] & !RESPONSE_BIT) {
            Some(NatPmpOpcode::MapUdp) => Protocol::Udp,
            Some(NatPmpOpcode::MapTcp) => Protocol::Tcp,
            _ => return Err(ProtocolError::UnexpectedOpcode(response[1])),
        };

        let mut buf = &response[2..];
        let code = buf.get_u16();
        let result = NatPmpResultCode::from_u16(code).ok_or(ProtocolError::UnknownResult(code))?;

        Ok(Self {
            protocol,
            result,
            sssoe: buf.get_u32(),
            internal_port: buf.get_u16(),
            external_port: buf.get_u16(),
            lifetime: buf.get_u32(),
        })
    }
}

/// Decoded address response or announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Result code
    pub result: NatPmpResultCode,
    /// Seconds since start of epoch
    pub sssoe: u32,
    /// External address of the gateway
    pub address: Ipv4Addr,
}

impl AnnounceResponse {
    /// Parse an address response packet
    pub fn parse(response: &[u8]) -> Result<Self, ProtocolError> {
        if response.len() != ANNOUNCE_RESPONSE_LEN {
            return Err(ProtocolError::Length {
                what: "address response",
                expected: ANNOUNCE_RESPONSE_LEN,
                got: response.len(),
            });
        }
        if response[1] != NatPmpOpcode::ExternalAddress as u8 | RESPONSE_BIT {
            return Err(ProtocolError::UnexpectedOpcode(response[1]));
        }

        let mut buf = &response[2..];
        let code = buf.get_u16();
        let result = NatPmpResultCode::from_u16(code).ok_or(ProtocolError::UnknownResult(code))?;
        let sssoe = buf.get_u32();
        let address = Ipv4Addr::from(buf.get_u32());

        Ok(Self {
            result,
            sssoe,
            address,
        })
    }
}
