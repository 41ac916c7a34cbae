//! Persistent Peer Cache
//!
//! Known peers survive restarts as a JSON map of address to their
//! hex-encoded marshaled identity and last-known endpoint. The topology
//! consults this store on table misses and writes every peer back on
//! shutdown, so a restarted node can try old endpoints before leaning on
//! the roots.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::BytesMut;
use ethermesh_core::{CachedPeer, PeerStore};
use ethermesh_crypto::{Address, IdentityPublic};
use ethermesh_wire::Endpoint;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Clone, Serialize, Deserialize)]
struct StoredPeer {
    identity: String,
    endpoint: String,
}

pub struct JsonPeerStore {
    path: PathBuf,
    peers: Mutex<HashMap<String, StoredPeer>>,
}

impl JsonPeerStore {
    /// Open the cache, loading whatever the file already holds
    pub fn open(path: PathBuf) -> Self {
        let peers = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<HashMap<String, StoredPeer>>(&text) {
                Ok(map) => {
                    debug!(count = map.len(), file = %path.display(), "loaded peer cache");
                    map
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "peer cache unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            peers: Mutex::new(peers),
        }
    }

    fn flush(&self, peers: &HashMap<String, StoredPeer>) {
        match serde_json::to_string_pretty(peers) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!(file = %self.path.display(), error = %e, "failed to write peer cache");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize peer cache"),
        }
    }
}

impl PeerStore for JsonPeerStore {
    fn load_peer(&self, addr: Address) -> Option<CachedPeer> {
        let peers = self.peers.lock().unwrap();
        let stored = peers.get(&addr.to_string())?;

        let identity_bytes = decode_hex(&stored.identity)?;
        let identity = match IdentityPublic::unmarshal(&identity_bytes) {
            Ok(identity) if identity.address() == addr => identity,
            _ => {
                warn!(%addr, "discarding corrupt peer cache entry");
                return None;
            }
        };
        let endpoint = decode_hex(&stored.endpoint)
            .and_then(|bytes| Endpoint::unmarshal(&bytes).ok())
            .map(|(e, _)| e)
            .unwrap_or_else(Endpoint::nil);

        Some(CachedPeer { identity, endpoint })
    }

    fn save_peer(&self, addr: Address, peer: &CachedPeer) {
        let mut endpoint_wire = BytesMut::new();
        if peer.endpoint.marshal(&mut endpoint_wire).is_err() {
            endpoint_wire.clear();
            let _ = Endpoint::nil().marshal(&mut endpoint_wire);
        }
        let stored = StoredPeer {
            identity: encode_hex(&peer.identity.marshal()),
            endpoint: encode_hex(&endpoint_wire),
        };
        let mut peers = self.peers.lock().unwrap();
        peers.insert(addr.to_string(), stored);
        self.flush(&peers);
    }
}

pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethermesh_crypto::Identity;
    use std::net::SocketAddr;

    #[test]
    fn test_hex_roundtrip() {
        let bytes = [0x00, 0xde, 0xad, 0xbe, 0xef];
        assert_eq!(decode_hex(&encode_hex(&bytes)).unwrap(), bytes);
        assert!(decode_hex("abc").is_none());
        assert!(decode_hex("zz").is_none());
    }

    #[test]
    fn test_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("ethermesh-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("peers.json");

        let identity = Identity::generate();
        let endpoint: SocketAddr = "203.0.113.5:9993".parse().unwrap();
        {
            let store = JsonPeerStore::open(path.clone());
            store.save_peer(
                identity.address(),
                &CachedPeer {
                    identity: *identity.public(),
                    endpoint: Endpoint::from(endpoint),
                },
            );
        }
        let reopened = JsonPeerStore::open(path.clone());
        let loaded = reopened.load_peer(identity.address()).unwrap();
        assert_eq!(loaded.identity.address(), identity.address());
        assert_eq!(loaded.endpoint.socket_addr(), Some(endpoint));
        assert!(reopened.load_peer(Address::from_u64(0x0102030405)).is_none());

        std::fs::remove_file(path).ok();
    }
}
