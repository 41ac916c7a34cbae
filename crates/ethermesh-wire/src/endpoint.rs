//! Endpoint Descriptors
//!
//! An endpoint names some way a node can be reached: an overlay address, a
//! DNS name, a URL, a raw IPv4/IPv6 socket address, or a LAN-local Ethernet
//! address. Endpoints travel inside signed identity documents, so their
//! marshal encoding is fixed byte-for-byte:
//!
//! ```text
//! 0      type tag
//! 1..7   three signed big-endian 16-bit location coordinates (zero if unknown)
//! 7..    payload, by type
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{BufMut, BytesMut};
use ethermesh_crypto::constants::{ADDRESS_SIZE, IDENTITY_HASH_SIZE};
use ethermesh_crypto::{Address, IdentityHash};

use crate::error::{WireError, WireResult};
use crate::mac::Mac;

/// Longest DNS name or URL an endpoint may carry
pub const ENDPOINT_MAX_NAME_SIZE: usize = 255;

/// Worst-case marshal size: type byte, location, then the largest payload
/// (port plus NUL-terminated name)
pub const ENDPOINT_MARSHAL_SIZE_MAX: usize = 1 + 6 + 2 + ENDPOINT_MAX_NAME_SIZE + 1;

const TAG_NIL: u8 = 0;
const TAG_OVERLAY: u8 = 1;
const TAG_DNS: u8 = 2;
const TAG_URL: u8 = 3;
const TAG_INETADDR_V4: u8 = 4;
const TAG_ETHERNET: u8 = 5;
const TAG_INETADDR_V6: u8 = 6;

/// The reachable-by variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    /// Nothing; the empty endpoint
    Nil,
    /// Reachable through the overlay itself (relaying)
    Overlay {
        address: Address,
        identity_hash: IdentityHash,
    },
    /// DNS name and port resolving to a socket address
    Dns { name: String, port: u16 },
    /// URL for HTTP or WebSocket transport
    Url(String),
    /// Raw IPv4 socket address
    V4(SocketAddrV4),
    /// LAN-local Ethernet address
    Ethernet(Mac),
    /// Raw IPv6 socket address
    V6(SocketAddrV6),
}

/// An endpoint plus its optional location metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: EndpointKind,
    /// X, Y, Z in kilometers from the nearest gravitational center of mass;
    /// all zero when unknown
    pub location: [i16; 3],
}

impl Endpoint {
    /// The empty endpoint
    pub fn nil() -> Self {
        Self {
            kind: EndpointKind::Nil,
            location: [0; 3],
        }
    }

    pub fn overlay(address: Address, identity_hash: IdentityHash) -> Self {
        Self {
            kind: EndpointKind::Overlay {
                address,
                identity_hash,
            },
            location: [0; 3],
        }
    }

    pub fn dns(name: impl Into<String>, port: u16) -> Self {
        Self {
            kind: EndpointKind::Dns {
                name: name.into(),
                port,
            },
            location: [0; 3],
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Url(url.into()),
            location: [0; 3],
        }
    }

    pub fn ethernet(mac: Mac) -> Self {
        Self {
            kind: EndpointKind::Ethernet(mac),
            location: [0; 3],
        }
    }

    /// True unless this is the empty endpoint
    pub fn is_some(&self) -> bool {
        self.kind != EndpointKind::Nil
    }

    /// The socket address, for the V4/V6 kinds
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.kind {
            EndpointKind::V4(sa) => Some(SocketAddr::V4(sa)),
            EndpointKind::V6(sa) => Some(SocketAddr::V6(sa)),
            _ => None,
        }
    }

    /// Append the fixed wire encoding; returns the number of bytes written
    pub fn marshal(&self, out: &mut BytesMut) -> WireResult<usize> {
        let start = out.len();
        out.put_u8(self.tag());
        for c in self.location {
            out.put_i16(c);
        }
        match &self.kind {
            EndpointKind::Nil => {}
            EndpointKind::Overlay {
                address,
                identity_hash,
            } => {
                out.put_slice(&address.to_bytes());
                out.put_slice(identity_hash.as_bytes());
            }
            EndpointKind::Dns { name, port } => {
                if name.len() > ENDPOINT_MAX_NAME_SIZE {
                    return Err(WireError::NameTooLong(name.len()));
                }
                out.put_u16(*port);
                out.put_slice(name.as_bytes());
                out.put_u8(0);
            }
            EndpointKind::Url(url) => {
                if url.len() > ENDPOINT_MAX_NAME_SIZE {
                    return Err(WireError::NameTooLong(url.len()));
                }
                out.put_slice(url.as_bytes());
                out.put_u8(0);
            }
            EndpointKind::V4(sa) => {
                out.put_slice(&sa.ip().octets());
                out.put_u16(sa.port());
            }
            EndpointKind::Ethernet(mac) => {
                out.put_slice(mac.as_bytes());
            }
            EndpointKind::V6(sa) => {
                out.put_slice(&sa.ip().octets());
                out.put_u16(sa.port());
            }
        }
        Ok(out.len() - start)
    }

    /// Decode one endpoint from the front of `data`; returns it together
    /// with the number of bytes consumed. Any unknown tag or buffer overrun
    /// is an error, which callers at the packet boundary treat as a drop.
    pub fn unmarshal(data: &[u8]) -> WireResult<(Endpoint, usize)> {
        let need = |needed: usize| -> WireResult<()> {
            if data.len() < needed {
                Err(WireError::Truncated {
                    needed,
                    actual: data.len(),
                })
            } else {
                Ok(())
            }
        };

        need(7)?;
        let tag = data[0];
        let mut location = [0i16; 3];
        for (i, l) in location.iter_mut().enumerate() {
            *l = i16::from_be_bytes([data[1 + i * 2], data[2 + i * 2]]);
        }
        let body = &data[7..];

        let (kind, body_len) = match tag {
            TAG_NIL => (EndpointKind::Nil, 0),
            TAG_OVERLAY => {
                need(7 + ADDRESS_SIZE + IDENTITY_HASH_SIZE)?;
                let address =
                    Address::from_bytes(&body[..ADDRESS_SIZE]).map_err(|_| WireError::BadAddress)?;
                let identity_hash = IdentityHash::try_from_slice(
                    &body[ADDRESS_SIZE..ADDRESS_SIZE + IDENTITY_HASH_SIZE],
                )
                .map_err(|_| WireError::BadAddress)?;
                (
                    EndpointKind::Overlay {
                        address,
                        identity_hash,
                    },
                    ADDRESS_SIZE + IDENTITY_HASH_SIZE,
                )
            }
            TAG_DNS => {
                need(7 + 2 + 1)?;
                let port = u16::from_be_bytes([body[0], body[1]]);
                let (name, name_len) = read_c_string(&body[2..])?;
                (EndpointKind::Dns { name, port }, 2 + name_len)
            }
            TAG_URL => {
                need(7 + 1)?;
                let (url, url_len) = read_c_string(body)?;
                (EndpointKind::Url(url), url_len)
            }
            TAG_INETADDR_V4 => {
                need(7 + 4 + 2)?;
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                (EndpointKind::V4(SocketAddrV4::new(ip, port)), 6)
            }
            TAG_ETHERNET => {
                need(7 + 6)?;
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&body[..6]);
                (EndpointKind::Ethernet(Mac::from_bytes(mac)), 6)
            }
            TAG_INETADDR_V6 => {
                need(7 + 16 + 2)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                (
                    EndpointKind::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)),
                    18,
                )
            }
            other => return Err(WireError::UnknownEndpointType(other)),
        };

        Ok((Endpoint { kind, location }, 7 + body_len))
    }

    fn tag(&self) -> u8 {
        match self.kind {
            EndpointKind::Nil => TAG_NIL,
            EndpointKind::Overlay { .. } => TAG_OVERLAY,
            EndpointKind::Dns { .. } => TAG_DNS,
            EndpointKind::Url(_) => TAG_URL,
            EndpointKind::V4(_) => TAG_INETADDR_V4,
            EndpointKind::Ethernet(_) => TAG_ETHERNET,
            EndpointKind::V6(_) => TAG_INETADDR_V6,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(sa: SocketAddr) -> Self {
        let kind = match sa {
            SocketAddr::V4(v4) => EndpointKind::V4(v4),
            SocketAddr::V6(v6) => EndpointKind::V6(v6),
        };
        Endpoint {
            kind,
            location: [0; 3],
        }
    }
}

/// Read a NUL-terminated UTF-8 string bounded by the endpoint name limit;
/// returns the string and the number of bytes consumed (terminator included).
fn read_c_string(data: &[u8]) -> WireResult<(String, usize)> {
    let limit = data.len().min(ENDPOINT_MAX_NAME_SIZE + 1);
    match data[..limit].iter().position(|&b| b == 0) {
        Some(nul) => {
            let s = String::from_utf8_lossy(&data[..nul]).into_owned();
            Ok((s, nul + 1))
        }
        None => {
            if data.len() > ENDPOINT_MAX_NAME_SIZE {
                Err(WireError::NameTooLong(data.len()))
            } else {
                Err(WireError::UnterminatedName)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethermesh_crypto::constants::IDENTITY_HASH_SIZE;

    fn roundtrip(e: Endpoint) {
        let mut buf = BytesMut::new();
        let written = e.marshal(&mut buf).unwrap();
        assert_eq!(written, buf.len());
        let (back, consumed) = Endpoint::unmarshal(&buf).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(back, e);
    }

    #[test]
    fn test_marshal_roundtrip_all_kinds() {
        roundtrip(Endpoint::nil());
        roundtrip(Endpoint::overlay(
            Address::from_u64(0x0102030405),
            IdentityHash::from_bytes([0xab; IDENTITY_HASH_SIZE]),
        ));
        roundtrip(Endpoint::dns("root-a.example.net", 9993));
        roundtrip(Endpoint::url("wss://root-a.example.net/wire"));
        roundtrip(Endpoint::from("203.0.113.9:9993".parse::<SocketAddr>().unwrap()));
        roundtrip(Endpoint::from("[2001:db8::1]:9993".parse::<SocketAddr>().unwrap()));
        roundtrip(Endpoint::ethernet(Mac::from_bytes([0x3c, 0, 1, 2, 3, 4])));

        let mut located = Endpoint::dns("root-b.example.net", 9993);
        located.location = [-120, 45, 3];
        roundtrip(located);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = BytesMut::new();
        Endpoint::nil().marshal(&mut buf).unwrap();
        let mut bytes = buf.to_vec();
        bytes[0] = 9;
        assert!(matches!(
            Endpoint::unmarshal(&bytes),
            Err(WireError::UnknownEndpointType(9))
        ));
    }

    #[test]
    fn test_truncation_rejected() {
        let mut buf = BytesMut::new();
        Endpoint::from("203.0.113.9:9993".parse::<SocketAddr>().unwrap())
            .marshal(&mut buf)
            .unwrap();
        for cut in 0..buf.len() {
            assert!(Endpoint::unmarshal(&buf[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_unterminated_name_rejected() {
        let mut buf = BytesMut::new();
        Endpoint::url("http://example.net").marshal(&mut buf).unwrap();
        let truncated = &buf[..buf.len() - 1]; // drop the NUL
        assert!(Endpoint::unmarshal(truncated).is_err());
    }

    #[test]
    fn test_name_length_limit() {
        let long = "x".repeat(ENDPOINT_MAX_NAME_SIZE + 1);
        let mut buf = BytesMut::new();
        assert!(Endpoint::url(long).marshal(&mut buf).is_err());

        let max = "x".repeat(ENDPOINT_MAX_NAME_SIZE);
        roundtrip(Endpoint::url(max));
    }
}
