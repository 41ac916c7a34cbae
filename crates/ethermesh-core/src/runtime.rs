//! Collaborator Interfaces
//!
//! The switch core talks to the rest of the node through these traits: the
//! UDP sockets, the protocol decoder, the multicast propagation engine,
//! per-network membership state, and the persistent peer cache.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ethermesh_crypto::{Address, IdentityPublic};
use ethermesh_wire::constants::MULTICAST_BLOOM_SIZE;
use ethermesh_wire::{Endpoint, Mac, MulticastGroup, Packet};

use crate::path::Path;
use crate::peer::Peer;
use crate::topology::Topology;

/// Outbound datagram writer over the node's bound sockets.
///
/// Implementations may block briefly in the OS send path but must not
/// perform protocol work; the switch never calls this while holding a lock.
#[async_trait]
pub trait WireSender: Send + Sync {
    /// Write one datagram from the given local socket. Returns false when
    /// the socket is unknown or the OS refused the write.
    async fn send_udp(&self, local_socket: i64, remote: SocketAddr, data: &[u8]) -> bool;
}

/// What the protocol decoder made of a packet addressed to this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Fully handled (or discarded by policy)
    Done,
    /// Decoding needs a peer the table does not hold yet; the switch will
    /// issue the WHOIS and park the packet for retry
    NeedPeer(Address),
}

/// Protocol decoder for packets that terminate at this node
#[async_trait]
pub trait InboundPacketHandler: Send + Sync {
    async fn handle(&self, source: &Arc<Path>, packet: &Packet, now: i64) -> DecodeOutcome;
}

/// Propagation bloom filter carried inside MULTICAST_FRAME packets.
///
/// The filter mathematics live in the multicast engine; the switch only
/// allocates a fresh filter per local frame and copies it onto the wire.
#[derive(Clone)]
pub struct MulticastBloom([u8; MULTICAST_BLOOM_SIZE]);

impl MulticastBloom {
    pub fn new() -> Self {
        Self([0u8; MULTICAST_BLOOM_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; MULTICAST_BLOOM_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; MULTICAST_BLOOM_SIZE] {
        &mut self.0
    }
}

impl Default for MulticastBloom {
    fn default() -> Self {
        Self::new()
    }
}

/// Chooses next hops for multicast propagation
pub trait Multicaster: Send + Sync {
    /// Pick up to `breadth` peers to receive a multicast frame, updating
    /// the bloom filter with whatever the propagation algorithm records.
    fn pick_propagation_peers(
        &self,
        topology: &Topology,
        network_id: u64,
        group: &MulticastGroup,
        origin: Address,
        bloom: &mut MulticastBloom,
        breadth: usize,
    ) -> Vec<Arc<Peer>>;
}

/// One logical overlay network as seen from the local tap
pub trait Network: Send + Sync {
    /// 64-bit network id
    fn id(&self) -> u64;

    /// MAC of the local virtual interface
    fn tap_mac(&self) -> Mac;

    /// Open networks admit any node
    fn is_open(&self) -> bool;

    /// Membership check for closed networks
    fn is_member(&self, addr: Address) -> bool;

    /// Whether this node may exchange frames with `addr` on this network
    fn is_allowed(&self, addr: Address) -> bool;

    /// Write a frame back into the local tap (self-addressed frames are
    /// reflected rather than sent)
    fn tap_inject(&self, from: Mac, to: Mac, ether_type: u16, data: &[u8]);
}

/// A peer as it survives between runs: its identity plus the endpoint it
/// was last reachable at (Nil when none was known)
#[derive(Clone)]
pub struct CachedPeer {
    pub identity: IdentityPublic,
    pub endpoint: Endpoint,
}

/// Persistent peer cache consulted on table misses and written on shutdown
pub trait PeerStore: Send + Sync {
    /// Look up a cached peer by address
    fn load_peer(&self, addr: Address) -> Option<CachedPeer>;

    /// Persist one peer
    fn save_peer(&self, addr: Address, peer: &CachedPeer);
}
