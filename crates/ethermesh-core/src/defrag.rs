//! Fragment Reassembly
//!
//! Fragmented packets arrive as a head (fragment 0, carried as a normal
//! packet with the fragmented flag set) plus continuation fragments, in any
//! order. Entries are keyed by packet id and tracked with a presence
//! bitmap: bit 0 is the head, bit k (k >= 1) is fragment k. An entry is
//! complete when the bitmap population count equals the advertised total
//! and the head is present; incomplete entries age out.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use ethermesh_wire::constants::MAX_FRAGMENTS;
use ethermesh_wire::{Fragment, Packet};
use tracing::trace;

struct DefragEntry {
    creation_time: i64,
    /// 0 until a continuation fragment reveals the count
    total_fragments: u8,
    have: u16,
    frag0: Option<Packet>,
    frags: Vec<Option<Fragment>>,
}

impl DefragEntry {
    fn new(now: i64) -> Self {
        Self {
            creation_time: now,
            total_fragments: 0,
            have: 0,
            frag0: None,
            frags: vec![None; MAX_FRAGMENTS as usize - 1],
        }
    }

    fn complete(&self) -> bool {
        self.total_fragments > 0
            && self.have & 1 != 0
            && self.have.count_ones() == u32::from(self.total_fragments)
    }

    /// Concatenate the head with each fragment payload in order
    fn assemble(mut self) -> Packet {
        let mut packet = self.frag0.take().expect("complete entries hold the head");
        for f in 1..self.total_fragments {
            let frag = self.frags[f as usize - 1]
                .take()
                .expect("complete entries hold every fragment");
            packet.append_payload(frag.payload());
        }
        packet
    }
}

/// Reassembly table for fragmented packets addressed to this node
pub struct DefragCache {
    entries: Mutex<HashMap<u64, DefragEntry>>,
}

impl DefragCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a continuation fragment (the caller has already checked its
    /// sanity bounds). Returns the reassembled packet when this fragment
    /// completes the set. Duplicates are ignored.
    pub fn insert_fragment(&self, fragment: Fragment, now: i64) -> Option<Packet> {
        let pid = fragment.packet_id();
        let fno = fragment.fragment_number();
        let bit = 1u16 << fno;

        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(pid).or_insert_with(|| DefragEntry::new(now));
        if entry.have & bit != 0 {
            return None;
        }
        entry.total_fragments = fragment.total_fragments();
        entry.frags[fno as usize - 1] = Some(fragment);
        entry.have |= bit;
        if entry.complete() {
            let entry = entries.remove(&pid).expect("entry just touched");
            drop(entries);
            return Some(entry.assemble());
        }
        None
    }

    /// Record the head of a fragmented packet. Returns the reassembled
    /// packet when every continuation fragment already arrived. A duplicate
    /// head is ignored.
    pub fn insert_head(&self, packet: Packet, now: i64) -> Option<Packet> {
        let pid = packet.packet_id();

        let mut entries = self.entries.lock().unwrap();
        match entries.entry(pid) {
            Entry::Vacant(e) => {
                let entry = e.insert(DefragEntry::new(now));
                entry.have = 1;
                entry.frag0 = Some(packet);
                None
            }
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                if entry.have & 1 != 0 {
                    return None;
                }
                entry.have |= 1;
                entry.frag0 = Some(packet);
                if entry.complete() {
                    let entry = e.remove();
                    drop(entries);
                    return Some(entry.assemble());
                }
                None
            }
        }
    }

    /// Drop incomplete entries older than `timeout`; returns how many were
    /// discarded
    pub fn sweep(&self, now: i64, timeout: i64) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|pid, e| {
            let keep = now.saturating_sub(e.creation_time) <= timeout;
            if !keep {
                trace!(packet_id = format_args!("{pid:016x}"), "incomplete reassembly timed out");
            }
            keep
        });
        before - entries.len()
    }

    /// Number of reassemblies in flight
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DefragCache {
    fn default() -> Self {
        Self::new()
    }
}
