//! Physical Paths
//!
//! A path is one (local socket, remote address) pair. Path objects are
//! immutable and canonical: the topology guarantees that all callers asking
//! for the same pair share one handle. Liveness stamps live on the peer,
//! which knows which paths have recently carried its traffic.

use std::fmt;
use std::net::SocketAddr;

/// A canonical (local socket, remote address) pair
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Path {
    local_socket: i64,
    address: SocketAddr,
}

impl Path {
    pub fn new(local_socket: i64, address: SocketAddr) -> Self {
        Self {
            local_socket,
            address,
        }
    }

    /// Identifier of the bound socket this path uses
    pub fn local_socket(&self) -> i64 {
        self.local_socket
    }

    /// Remote physical address
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.local_socket)
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({})", self)
    }
}
