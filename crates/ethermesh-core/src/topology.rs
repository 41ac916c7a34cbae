//! Network Topology
//!
//! The database of everything this node knows about the overlay: the peer
//! table with its secondary indices, the canonical path table, the ranked
//! root set, and the physical path configuration.
//!
//! Both tables follow the same race discipline: a read-locked fast path,
//! then on miss a construction outside any lock, then a write-locked
//! double-checked insert so two racing callers always end up sharing one
//! canonical handle.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};

use ethermesh_crypto::{Address, Identity, IdentityHash, IdentityPublic};
use ethermesh_wire::constants::UDP_DEFAULT_PAYLOAD_MTU;
use rand::RngCore;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::path::Path;
use crate::peer::Peer;
use crate::runtime::{CachedPeer, PeerStore};
use ethermesh_wire::Endpoint;

/// Upper bound on configured physical path entries
pub const MAX_CONFIGURED_PATHS: usize = 32;

/// An IP network prefix used to scope physical path configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InetPrefix {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl InetPrefix {
    pub fn new(address: IpAddr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    /// Check if an IP falls inside this prefix
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(net), IpAddr::V4(target)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = !0u32 << (32 - self.prefix_len.min(32));
                (u32::from(net) & mask) == (u32::from(target) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(target)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = !0u128 << (128 - self.prefix_len.min(128));
                (u128::from(net) & mask) == (u128::from(target) & mask)
            }
            _ => false,
        }
    }
}

/// Per-prefix transport settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPathConfig {
    /// Payload MTU to assume toward this prefix
    pub mtu: usize,
    /// Non-zero opts the prefix into trusted-path handling under this id
    pub trusted_path_id: u64,
}

impl Default for PhysicalPathConfig {
    fn default() -> Self {
        Self {
            mtu: UDP_DEFAULT_PAYLOAD_MTU,
            trusted_path_id: 0,
        }
    }
}

struct PeerMaps {
    by_address: HashMap<Address, Arc<Peer>>,
    by_identity_hash: HashMap<IdentityHash, Arc<Peer>>,
    by_probe: HashMap<u64, Arc<Peer>>,
    /// Root identities by address; root_peers holds the latency ranking
    roots: HashMap<Address, IdentityPublic>,
    root_peers: Vec<Arc<Peer>>,
}

/// Database of peers, paths, and roots
pub struct Topology {
    my_identity: Arc<Identity>,
    store: Option<Arc<dyn PeerStore>>,

    peers: RwLock<PeerMaps>,
    paths: RwLock<HashMap<u64, Arc<Path>>>,

    /// Salts the path hash keys so peers cannot predict table placement
    path_hash_salt: u64,

    physical_paths: Mutex<Vec<(InetPrefix, PhysicalPathConfig)>>,
}

impl Topology {
    pub fn new(my_identity: Arc<Identity>, store: Option<Arc<dyn PeerStore>>) -> Self {
        Self {
            my_identity,
            store,
            peers: RwLock::new(PeerMaps {
                by_address: HashMap::new(),
                by_identity_hash: HashMap::new(),
                by_probe: HashMap::new(),
                roots: HashMap::new(),
                root_peers: Vec::new(),
            }),
            paths: RwLock::new(HashMap::new()),
            path_hash_salt: rand::rngs::OsRng.next_u64(),
            physical_paths: Mutex::new(Vec::new()),
        }
    }

    /// This node's own identity
    pub fn my_identity(&self) -> &Arc<Identity> {
        &self.my_identity
    }

    /// Add a peer. Never replaces: if a peer with the same address already
    /// exists the existing record is returned and should be used instead.
    pub fn add(&self, peer: Arc<Peer>) -> Arc<Peer> {
        let mut maps = self.peers.write().unwrap();
        match maps.by_address.entry(peer.address()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                e.insert(peer.clone());
                maps.by_identity_hash
                    .insert(*peer.identity_hash(), peer.clone());
                maps.by_probe.insert(peer.probe(), peer.clone());
                peer
            }
        }
    }

    /// Get a peer by address. On a table miss, `load_cached` consults the
    /// persistent store and inserts the reconstructed record race-safely.
    pub fn peer(&self, addr: Address, load_cached: bool) -> Option<Arc<Peer>> {
        {
            let maps = self.peers.read().unwrap();
            if let Some(p) = maps.by_address.get(&addr) {
                return Some(p.clone());
            }
        }
        if !load_cached {
            return None;
        }
        let store = self.store.as_ref()?;
        let cached = store.load_peer(addr)?;
        if cached.identity.address() != addr {
            debug!(%addr, "cached peer identity does not bind to its address, ignoring");
            return None;
        }
        let peer = self.add(Arc::new(Peer::new(&self.my_identity, cached.identity)));
        // A cached endpoint gives the peer somewhere to be tried at before
        // any fresh traffic arrives (stamped stale, so it never counts as
        // an active direct path)
        if let Some(remote) = cached.endpoint.socket_addr() {
            peer.learn_path(self.path(0, remote), 0);
        }
        Some(peer)
    }

    /// Get a peer by the hash of its identity keys (in-memory only)
    pub fn peer_by_hash(&self, hash: &IdentityHash) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().by_identity_hash.get(hash).cloned()
    }

    /// Get a peer by its clear-text probe token (in-memory only)
    pub fn peer_by_probe(&self, probe: u64) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().by_probe.get(&probe).cloned()
    }

    /// Get the canonical Path for a (local socket, remote address) pair,
    /// creating it if needed. Two concurrent calls for the same pair are
    /// guaranteed to return the same handle.
    pub fn path(&self, local_socket: i64, remote: SocketAddr) -> Arc<Path> {
        let key = self.path_key(local_socket, &remote);
        {
            let paths = self.paths.read().unwrap();
            if let Some(p) = paths.get(&key) {
                return p.clone();
            }
        }
        let candidate = Arc::new(Path::new(local_socket, remote));
        let mut paths = self.paths.write().unwrap();
        paths.entry(key).or_insert(candidate).clone()
    }

    fn path_key(&self, local_socket: i64, remote: &SocketAddr) -> u64 {
        let mut h = DefaultHasher::new();
        self.path_hash_salt.hash(&mut h);
        local_socket.hash(&mut h);
        remote.hash(&mut h);
        h.finish()
    }

    /// Register a root identity. When a bootstrap endpoint is given the
    /// root peer learns it immediately so it is reachable before any
    /// inbound traffic arrives.
    pub fn add_root(&self, identity: IdentityPublic, bootstrap: Option<(i64, SocketAddr)>) {
        let peer = self
            .peer(identity.address(), false)
            .unwrap_or_else(|| self.add(Arc::new(Peer::new(&self.my_identity, identity))));
        if let Some((local_socket, remote)) = bootstrap {
            let path = self.path(local_socket, remote);
            peer.learn_path(path, 0);
        }
        let mut maps = self.peers.write().unwrap();
        maps.roots.insert(identity.address(), identity);
        if !maps.root_peers.iter().any(|p| p.address() == peer.address()) {
            maps.root_peers.push(peer);
        }
    }

    /// Remove a root. Returns whether it was present. The peer record
    /// itself stays in the table.
    pub fn remove_root(&self, identity: &IdentityPublic) -> bool {
        let mut maps = self.peers.write().unwrap();
        let addr = identity.address();
        let removed = maps.roots.remove(&addr).is_some();
        maps.root_peers.retain(|p| p.address() != addr);
        removed
    }

    /// True if this identity belongs to a registered root
    pub fn is_root(&self, identity: &IdentityPublic) -> bool {
        self.is_root_address(identity.address())
    }

    /// True if this address belongs to a registered root
    pub fn is_root_address(&self, addr: Address) -> bool {
        self.peers.read().unwrap().roots.contains_key(&addr)
    }

    /// The current best (lowest-latency) root
    pub fn root(&self) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().root_peers.first().cloned()
    }

    /// The best root whose address is not in `excluded`; falls back to the
    /// best root overall when every root is excluded.
    pub fn best_root(&self, excluded: &[Address]) -> Option<Arc<Peer>> {
        let maps = self.peers.read().unwrap();
        maps.root_peers
            .iter()
            .find(|p| !excluded.contains(&p.address()))
            .or_else(|| maps.root_peers.first())
            .cloned()
    }

    /// Re-sort roots in ascending order of apparent latency. Roots without
    /// a sample yet sort last.
    pub fn rank_roots(&self, _now: i64) {
        let mut maps = self.peers.write().unwrap();
        maps.root_peers.sort_by_key(|p| {
            let l = p.latency();
            if l == 0 {
                u32::MAX
            } else {
                l
            }
        });
    }

    /// Snapshot of every peer. Taken under the read lock and released
    /// before the caller iterates, so callbacks may re-enter the table.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().unwrap().by_address.values().cloned().collect()
    }

    /// Snapshot of every peer with a flag marking roots
    pub fn peers_with_root_flag(&self) -> Vec<(Arc<Peer>, bool)> {
        let maps = self.peers.read().unwrap();
        maps.by_address
            .values()
            .map(|p| (p.clone(), maps.roots.contains_key(&p.address())))
            .collect()
    }

    /// Snapshot of every path
    pub fn paths(&self) -> Vec<Arc<Path>> {
        self.paths.read().unwrap().values().cloned().collect()
    }

    /// Number of peers currently in memory
    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().by_address.len()
    }

    /// Set or clear the configuration entry for a physical prefix
    pub fn set_physical_path_config(
        &self,
        prefix: InetPrefix,
        config: Option<PhysicalPathConfig>,
    ) -> CoreResult<()> {
        let mut table = self.physical_paths.lock().unwrap();
        table.retain(|(p, _)| *p != prefix);
        if let Some(config) = config {
            if table.len() >= MAX_CONFIGURED_PATHS {
                return Err(CoreError::PathConfigFull(MAX_CONFIGURED_PATHS));
            }
            table.push((prefix, config));
        }
        Ok(())
    }

    /// MTU and trusted path id to use toward a physical address
    pub fn outbound_path_info(&self, remote: SocketAddr) -> PhysicalPathConfig {
        let table = self.physical_paths.lock().unwrap();
        table
            .iter()
            .find(|(p, _)| p.contains(remote.ip()))
            .map(|(_, c)| *c)
            .unwrap_or_default()
    }

    /// Whether an inbound packet claiming this trusted path id from this
    /// physical address should be believed (0 is never a valid id)
    pub fn should_inbound_path_be_trusted(&self, remote: SocketAddr, trusted_path_id: u64) -> bool {
        if trusted_path_id == 0 {
            return false;
        }
        let table = self.physical_paths.lock().unwrap();
        table
            .iter()
            .any(|(p, c)| c.trusted_path_id == trusted_path_id && p.contains(remote.ip()))
    }

    /// Periodic housekeeping: refresh the root ranking
    pub fn do_periodic_tasks(&self, now: i64) {
        self.rank_roots(now);
    }

    /// Persist every known peer to the store, endpoint included
    pub fn save_all(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        for peer in self.peers() {
            let endpoint = peer
                .best_path()
                .map(|p| Endpoint::from(p.address()))
                .unwrap_or_else(Endpoint::nil);
            store.save_peer(
                peer.address(),
                &CachedPeer {
                    identity: *peer.identity(),
                    endpoint,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> (Arc<Identity>, Topology) {
        let id = Arc::new(Identity::generate());
        let topo = Topology::new(id.clone(), None);
        (id, topo)
    }

    fn make_peer(local: &Identity) -> Arc<Peer> {
        Arc::new(Peer::new(local, *Identity::generate().public()))
    }

    #[test]
    fn test_add_is_idempotent() {
        let (id, topo) = topology();
        let remote = Identity::generate();
        let first = topo.add(Arc::new(Peer::new(&id, *remote.public())));
        let second = topo.add(Arc::new(Peer::new(&id, *remote.public())));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(topo.peer_count(), 1);
    }

    #[test]
    fn test_secondary_indices() {
        let (id, topo) = topology();
        let peer = topo.add(make_peer(&id));
        assert!(Arc::ptr_eq(
            &topo.peer(peer.address(), false).unwrap(),
            &peer
        ));
        assert!(Arc::ptr_eq(
            &topo.peer_by_hash(peer.identity_hash()).unwrap(),
            &peer
        ));
        assert!(Arc::ptr_eq(&topo.peer_by_probe(peer.probe()).unwrap(), &peer));
    }

    #[test]
    fn test_path_canonicalization() {
        let (_, topo) = topology();
        let remote: SocketAddr = "203.0.113.5:9993".parse().unwrap();
        let a = topo.path(1, remote);
        let b = topo.path(1, remote);
        assert!(Arc::ptr_eq(&a, &b));
        let c = topo.path(2, remote);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_path_canonicalization_concurrent() {
        let (_, topo) = topology();
        let topo = Arc::new(topo);
        let remote: SocketAddr = "203.0.113.5:9993".parse().unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let topo = topo.clone();
            handles.push(std::thread::spawn(move || topo.path(7, remote)));
        }
        let paths: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for p in &paths[1..] {
            assert!(Arc::ptr_eq(&paths[0], p));
        }
    }

    #[test]
    fn test_root_ranking_and_exclusion() {
        let (_, topo) = topology();
        let r1 = Identity::generate();
        let r2 = Identity::generate();
        let r3 = Identity::generate();
        topo.add_root(*r1.public(), None);
        topo.add_root(*r2.public(), None);
        topo.add_root(*r3.public(), None);

        topo.peer(r1.address(), false).unwrap().record_latency(90);
        topo.peer(r2.address(), false).unwrap().record_latency(10);
        topo.peer(r3.address(), false).unwrap().record_latency(50);
        topo.rank_roots(0);

        assert_eq!(topo.root().unwrap().address(), r2.address());
        assert_eq!(
            topo.best_root(&[r2.address()]).unwrap().address(),
            r3.address()
        );
        // All excluded: fall back to the best overall
        let all = [r1.address(), r2.address(), r3.address()];
        assert_eq!(topo.best_root(&all).unwrap().address(), r2.address());
    }

    #[test]
    fn test_remove_root_keeps_peer() {
        let (_, topo) = topology();
        let r = Identity::generate();
        topo.add_root(*r.public(), None);
        assert!(topo.is_root_address(r.address()));
        assert!(topo.remove_root(r.public()));
        assert!(!topo.remove_root(r.public()));
        assert!(!topo.is_root_address(r.address()));
        assert!(topo.peer(r.address(), false).is_some());
    }

    #[test]
    fn test_cached_peer_loading() {
        struct OnePeerStore(CachedPeer);
        impl PeerStore for OnePeerStore {
            fn load_peer(&self, addr: Address) -> Option<CachedPeer> {
                (self.0.identity.address() == addr).then(|| self.0.clone())
            }
            fn save_peer(&self, _addr: Address, _peer: &CachedPeer) {}
        }

        let id = Arc::new(Identity::generate());
        let cached = Identity::generate();
        let last_seen: SocketAddr = "203.0.113.40:9993".parse().unwrap();
        let store = OnePeerStore(CachedPeer {
            identity: *cached.public(),
            endpoint: Endpoint::from(last_seen),
        });
        let topo = Topology::new(id, Some(Arc::new(store)));

        assert!(topo.peer(cached.address(), false).is_none());
        let loaded = topo.peer(cached.address(), true).unwrap();
        assert_eq!(loaded.address(), cached.address());
        // The cached endpoint is remembered as a path to try, but is far
        // too stale to count as actively direct
        assert_eq!(loaded.best_path().unwrap().address(), last_seen);
        assert!(!loaded.has_active_direct_path(1_000_000, 45_000));
        // Second lookup hits the in-memory table and returns the same record
        assert!(Arc::ptr_eq(&topo.peer(cached.address(), true).unwrap(), &loaded));
    }

    #[test]
    fn test_physical_path_config() {
        let (_, topo) = topology();
        let lan = InetPrefix::new("10.0.0.0".parse().unwrap(), 8);
        topo.set_physical_path_config(
            lan,
            Some(PhysicalPathConfig {
                mtu: 9000,
                trusted_path_id: 42,
            }),
        )
        .unwrap();

        let inside: SocketAddr = "10.1.2.3:9993".parse().unwrap();
        let outside: SocketAddr = "203.0.113.5:9993".parse().unwrap();
        assert_eq!(topo.outbound_path_info(inside).mtu, 9000);
        assert_eq!(topo.outbound_path_info(outside).mtu, UDP_DEFAULT_PAYLOAD_MTU);

        assert!(topo.should_inbound_path_be_trusted(inside, 42));
        assert!(!topo.should_inbound_path_be_trusted(inside, 7));
        assert!(!topo.should_inbound_path_be_trusted(outside, 42));
        assert!(!topo.should_inbound_path_be_trusted(inside, 0));

        topo.set_physical_path_config(lan, None).unwrap();
        assert_eq!(topo.outbound_path_info(inside).mtu, UDP_DEFAULT_PAYLOAD_MTU);
    }

    #[test]
    fn test_physical_path_config_bounded() {
        let (_, topo) = topology();
        for i in 0..MAX_CONFIGURED_PATHS {
            let prefix = InetPrefix::new(IpAddr::V4(std::net::Ipv4Addr::new(10, i as u8, 0, 0)), 16);
            topo.set_physical_path_config(prefix, Some(PhysicalPathConfig::default()))
                .unwrap();
        }
        let extra = InetPrefix::new("192.168.0.0".parse().unwrap(), 16);
        assert!(topo
            .set_physical_path_config(extra, Some(PhysicalPathConfig::default()))
            .is_err());
    }
}
