//! Multicast Propagation
//!
//! A deliberately simple propagation engine: fan out to directly-connected
//! peers that the bloom filter has not seen yet. Nodes that want smarter
//! group-aware propagation can swap in their own `Multicaster`.

use std::sync::Arc;

use ethermesh_core::{MulticastBloom, Multicaster, Peer, Topology};
use ethermesh_crypto::Address;
use ethermesh_wire::constants::MULTICAST_BLOOM_SIZE;
use ethermesh_wire::MulticastGroup;

pub struct DirectMulticaster;

fn bloom_bit(addr: Address) -> (usize, u8) {
    let bit = (addr.to_u64() % (MULTICAST_BLOOM_SIZE as u64 * 8)) as usize;
    (bit / 8, 1u8 << (bit % 8))
}

fn bloom_contains(bloom: &MulticastBloom, addr: Address) -> bool {
    let (byte, mask) = bloom_bit(addr);
    bloom.as_bytes()[byte] & mask != 0
}

fn bloom_insert(bloom: &mut MulticastBloom, addr: Address) {
    let (byte, mask) = bloom_bit(addr);
    bloom.as_bytes_mut()[byte] |= mask;
}

impl Multicaster for DirectMulticaster {
    fn pick_propagation_peers(
        &self,
        topology: &Topology,
        _network_id: u64,
        _group: &MulticastGroup,
        origin: Address,
        bloom: &mut MulticastBloom,
        breadth: usize,
    ) -> Vec<Arc<Peer>> {
        bloom_insert(bloom, origin);

        let mut candidates = topology.peers();
        // Stable fan-out order: freshest peers first
        candidates.sort_by_key(|p| std::cmp::Reverse(p.last_receive()));

        let mut picked = Vec::with_capacity(breadth);
        for peer in candidates {
            if picked.len() >= breadth {
                break;
            }
            if peer.address() == origin || peer.last_receive() == 0 {
                continue;
            }
            if bloom_contains(bloom, peer.address()) {
                continue;
            }
            bloom_insert(bloom, peer.address());
            picked.push(peer);
        }
        picked
    }
}
