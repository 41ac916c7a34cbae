//! Peers
//!
//! A peer record binds a verified remote identity to its session keys and
//! to the set of physical paths that have carried its traffic. Peer records
//! are shared (`Arc`) between the topology tables, the queues, and in-flight
//! sends; mutable state sits behind an internal mutex that is never held
//! across socket I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use ethermesh_crypto::{Address, Identity, IdentityHash, IdentityPublic, SymmetricKey};
use ethermesh_wire::Verb;
use tracing::trace;

use crate::path::Path;
use crate::runtime::WireSender;
use std::sync::Arc;

struct PathState {
    path: Arc<Path>,
    last_send: i64,
    last_receive: i64,
}

/// A verified remote node
pub struct Peer {
    identity: IdentityPublic,
    address: Address,
    identity_hash: IdentityHash,
    probe: u64,
    crypt_key: SymmetricKey,
    mac_key: SymmetricKey,

    paths: Mutex<Vec<PathState>>,

    /// Smoothed round-trip latency in ms; 0 until the first sample
    latency_ms: AtomicU32,

    last_send: AtomicI64,
    last_receive: AtomicI64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

impl Peer {
    /// Build a peer record from a remote identity. The address is derived
    /// from the identity keys, so the address/identity binding holds by
    /// construction; callers that received a *claimed* address must have
    /// verified it against the identity first.
    pub fn new(local: &Identity, identity: IdentityPublic) -> Self {
        let hash = identity.identity_hash();
        let keys = local.agree(&identity);
        Self {
            identity,
            address: hash.address(),
            identity_hash: hash,
            probe: hash.probe(),
            crypt_key: keys.crypt,
            mac_key: keys.mac,
            paths: Mutex::new(Vec::new()),
            latency_ms: AtomicU32::new(0),
            last_send: AtomicI64::new(0),
            last_receive: AtomicI64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn identity(&self) -> &IdentityPublic {
        &self.identity
    }

    pub fn identity_hash(&self) -> &IdentityHash {
        &self.identity_hash
    }

    /// Clear-text token this peer sends to identify itself on first contact
    pub fn probe(&self) -> u64 {
        self.probe
    }

    /// Keystream key for traffic to/from this peer
    pub fn crypt_key(&self) -> &SymmetricKey {
        &self.crypt_key
    }

    /// Authenticator key for traffic to/from this peer
    pub fn mac_key(&self) -> &SymmetricKey {
        &self.mac_key
    }

    /// Record traffic received from this peer over `path`, learning the
    /// path if it is new
    pub fn learn_path(&self, path: Arc<Path>, now: i64) {
        self.last_receive.store(now, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        let mut paths = self.paths.lock().unwrap();
        if let Some(ps) = paths.iter_mut().find(|ps| *ps.path == *path) {
            ps.last_receive = now;
        } else {
            paths.push(PathState {
                path,
                last_send: 0,
                last_receive: now,
            });
        }
    }

    /// Latest smoothed latency sample in ms (0 = no sample yet)
    pub fn latency(&self) -> u32 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    /// Feed one round-trip sample into the latency estimate
    pub fn record_latency(&self, sample_ms: u32) {
        let prev = self.latency_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample_ms
        } else {
            (prev * 3 + sample_ms) / 4
        };
        self.latency_ms.store(next.max(1), Ordering::Relaxed);
    }

    pub fn last_receive(&self) -> i64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    pub fn last_send(&self) -> i64 {
        self.last_send.load(Ordering::Relaxed)
    }

    /// True when some path has recently carried traffic *from* this peer,
    /// meaning we can skip root relaying and send straight to it
    pub fn has_active_direct_path(&self, now: i64, activity_timeout: i64) -> bool {
        let paths = self.paths.lock().unwrap();
        paths
            .iter()
            .any(|ps| now.saturating_sub(ps.last_receive) < activity_timeout)
    }

    /// The freshest path, preferring receive evidence over send attempts
    pub fn best_path(&self) -> Option<Arc<Path>> {
        let paths = self.paths.lock().unwrap();
        paths
            .iter()
            .max_by_key(|ps| (ps.last_receive, ps.last_send))
            .map(|ps| ps.path.clone())
    }

    /// Addresses of paths that count as active, freshest first
    fn active_addresses(&self, now: i64, activity_timeout: i64) -> Vec<SocketAddr> {
        let mut states: Vec<(i64, SocketAddr)> = self
            .paths
            .lock()
            .unwrap()
            .iter()
            .filter(|ps| now.saturating_sub(ps.last_receive) < activity_timeout)
            .map(|ps| (ps.last_receive, ps.path.address()))
            .collect();
        states.sort_by_key(|(t, _)| std::cmp::Reverse(*t));
        states.into_iter().map(|(_, a)| a).collect()
    }

    /// Write bytes to this peer over its freshest path. Returns false when
    /// no path is known or the socket write failed.
    pub async fn send(
        &self,
        sender: &dyn WireSender,
        data: &[u8],
        is_relay: bool,
        verb: Verb,
        now: i64,
    ) -> bool {
        let Some(path) = self.best_path() else {
            trace!(peer = %self.address, "no path to peer");
            return false;
        };
        if !sender.send_udp(path.local_socket(), path.address(), data).await {
            return false;
        }
        trace!(
            peer = %self.address, via = %path, relay = is_relay, ?verb,
            len = data.len(), "sent"
        );
        self.last_send.store(now, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        let mut paths = self.paths.lock().unwrap();
        if let Some(ps) = paths.iter_mut().find(|ps| *ps.path == *path) {
            ps.last_send = now;
        }
        true
    }

    /// Find physical addresses two peers could use to reach each other
    /// directly: the first returned address reaches `p2` (told to `p1`),
    /// the second reaches `p1` (told to `p2`). Requires an address-family
    /// match between active paths on both sides.
    pub fn find_common_ground(
        p1: &Peer,
        p2: &Peer,
        now: i64,
        activity_timeout: i64,
    ) -> Option<(SocketAddr, SocketAddr)> {
        let p2_addrs = p2.active_addresses(now, activity_timeout);
        let p1_addrs = p1.active_addresses(now, activity_timeout);
        for a2 in &p2_addrs {
            for a1 in &p1_addrs {
                if a2.is_ipv4() == a1.is_ipv4() {
                    return Some((*a2, *a1));
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer({})", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_pair() -> (Identity, Peer) {
        let me = Identity::generate();
        let them = Identity::generate();
        let peer = Peer::new(&me, *them.public());
        (me, peer)
    }

    #[test]
    fn test_address_binding_by_construction() {
        let me = Identity::generate();
        let them = Identity::generate();
        let peer = Peer::new(&me, *them.public());
        assert_eq!(peer.address(), them.address());
        assert_eq!(peer.probe(), them.identity_hash().probe());
    }

    #[test]
    fn test_session_keys_agree() {
        let me = Identity::generate();
        let them = Identity::generate();
        let mine = Peer::new(&me, *them.public());
        let theirs = Peer::new(&them, *me.public());
        assert_eq!(mine.crypt_key().as_bytes(), theirs.crypt_key().as_bytes());
        assert_eq!(mine.mac_key().as_bytes(), theirs.mac_key().as_bytes());
    }

    #[test]
    fn test_path_activity_window() {
        let (_, peer) = peer_pair();
        let path = Arc::new(Path::new(1, "203.0.113.5:9993".parse().unwrap()));
        assert!(!peer.has_active_direct_path(1_000, 45_000));

        peer.learn_path(path, 1_000);
        assert!(peer.has_active_direct_path(1_500, 45_000));
        assert!(!peer.has_active_direct_path(50_000, 45_000));
    }

    #[test]
    fn test_best_path_prefers_freshest() {
        let (_, peer) = peer_pair();
        let old = Arc::new(Path::new(1, "203.0.113.5:9993".parse().unwrap()));
        let fresh = Arc::new(Path::new(1, "198.51.100.7:9993".parse().unwrap()));
        peer.learn_path(old, 1_000);
        peer.learn_path(fresh.clone(), 2_000);
        assert_eq!(peer.best_path().unwrap().address(), fresh.address());
    }

    #[test]
    fn test_latency_smoothing() {
        let (_, peer) = peer_pair();
        assert_eq!(peer.latency(), 0);
        peer.record_latency(100);
        assert_eq!(peer.latency(), 100);
        peer.record_latency(20);
        assert_eq!(peer.latency(), 80);
    }

    #[test]
    fn test_find_common_ground_family_match() {
        let me = Identity::generate();
        let a = Peer::new(&me, *Identity::generate().public());
        let b = Peer::new(&me, *Identity::generate().public());

        let a_v4: SocketAddr = "203.0.113.5:1000".parse().unwrap();
        let b_v6: SocketAddr = "[2001:db8::2]:2000".parse().unwrap();
        a.learn_path(Arc::new(Path::new(1, a_v4)), 1_000);
        b.learn_path(Arc::new(Path::new(1, b_v6)), 1_000);
        // v4-only on one side, v6-only on the other: nothing in common
        assert!(Peer::find_common_ground(&a, &b, 1_500, 45_000).is_none());

        let b_v4: SocketAddr = "198.51.100.7:2000".parse().unwrap();
        b.learn_path(Arc::new(Path::new(1, b_v4)), 1_100);
        let (to_b, to_a) = Peer::find_common_ground(&a, &b, 1_500, 45_000).unwrap();
        assert_eq!(to_b, b_v4);
        assert_eq!(to_a, a_v4);
    }
}
