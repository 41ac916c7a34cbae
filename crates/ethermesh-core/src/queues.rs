//! Pending Packet Queues
//!
//! Two holding areas for packets blocked on peer resolution: outbound
//! packets whose destination has no usable peer yet, and inbound packets
//! whose decode reported a missing peer. Both are bounded by age, swept
//! from the periodic tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ethermesh_crypto::Address;
use ethermesh_wire::Packet;

use crate::path::Path;

/// An outbound packet waiting for its destination to become sendable
pub struct TxEntry {
    pub creation_time: i64,
    pub packet: Packet,
    pub encrypt: bool,
}

/// Outbound packets keyed by destination; several packets may wait on the
/// same address
pub struct TxQueue {
    entries: Mutex<HashMap<Address, Vec<TxEntry>>>,
}

impl TxQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn push(&self, dest: Address, entry: TxEntry) {
        self.entries.lock().unwrap().entry(dest).or_default().push(entry);
    }

    /// Remove and return everything waiting on one destination
    pub fn take(&self, dest: Address) -> Vec<TxEntry> {
        self.entries.lock().unwrap().remove(&dest).unwrap_or_default()
    }

    /// Remove and return the whole queue (retry pass)
    pub fn drain_all(&self) -> Vec<(Address, TxEntry)> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .drain()
            .flat_map(|(dest, v)| v.into_iter().map(move |e| (dest, e)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TxQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// An inbound packet whose decode is blocked on a missing peer
pub struct RxEntry {
    pub received_time: i64,
    pub packet: Packet,
    pub source: Arc<Path>,
}

/// Inbound packets parked until the peer they need arrives
pub struct RxQueue {
    entries: Mutex<Vec<RxEntry>>,
}

impl RxQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, entry: RxEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    /// Remove and return every parked packet (retry pass)
    pub fn drain(&self) -> Vec<RxEntry> {
        std::mem::take(&mut *self.entries.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RxQueue {
    fn default() -> Self {
        Self::new()
    }
}
