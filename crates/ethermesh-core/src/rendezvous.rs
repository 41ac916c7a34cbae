//! Rendezvous Scheduling and Unite Throttling
//!
//! When a RENDEZVOUS arrives the node must fire a NAT-traversal HELLO at
//! the advertised endpoint at a scheduled moment; the queue holds those
//! pending sends. The throttle bounds how often this node will introduce
//! any given pair of peers to each other, keyed order-invariantly so
//! unite(A, B) and unite(B, A) share state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use ethermesh_crypto::Address;

/// A scheduled NAT-traversal HELLO
#[derive(Debug, Clone, Copy)]
pub struct RendezvousEntry {
    pub fire_at: i64,
    pub local_socket: i64,
    pub remote: SocketAddr,
}

/// Pending time-fired hole-punch sends, one per counterpart peer
pub struct RendezvousQueue {
    entries: Mutex<HashMap<Address, RendezvousEntry>>,
}

impl RendezvousQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule (or reschedule) the hello toward one peer
    pub fn schedule(&self, with_peer: Address, entry: RendezvousEntry) {
        self.entries.lock().unwrap().insert(with_peer, entry);
    }

    /// Remove and return every entry due at `now`, along with the delay
    /// until the earliest remaining entry (i64::MAX when none)
    pub fn due(&self, now: i64) -> (Vec<(Address, RendezvousEntry)>, i64) {
        let mut fired = Vec::new();
        let mut next_delay = i64::MAX;
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|addr, entry| {
            if entry.fire_at <= now {
                fired.push((*addr, *entry));
                false
            } else {
                next_delay = next_delay.min(entry.fire_at - now);
                true
            }
        });
        (fired, next_delay)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RendezvousQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimum-interval gate on rendezvous introductions per unordered pair
pub struct UniteThrottle {
    last_attempt: Mutex<HashMap<(Address, Address), i64>>,
}

impl UniteThrottle {
    pub fn new() -> Self {
        Self {
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    /// Sorted so {A, B} and {B, A} share one slot
    fn key(a: Address, b: Address) -> (Address, Address) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Decide whether an introduction between this pair may go out now,
    /// recording the attempt when admitted. `force` bypasses the interval
    /// but still records.
    pub fn should_attempt(
        &self,
        a: Address,
        b: Address,
        force: bool,
        now: i64,
        min_interval: i64,
    ) -> bool {
        let mut last = self.last_attempt.lock().unwrap();
        let slot = last.entry(Self::key(a, b)).or_insert(i64::MIN);
        if !force && now.saturating_sub(*slot) < min_interval {
            return false;
        }
        *slot = now;
        true
    }
}

impl Default for UniteThrottle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_fires_and_reports_next_delay() {
        let q = RendezvousQueue::new();
        let remote: SocketAddr = "203.0.113.5:9993".parse().unwrap();
        q.schedule(
            Address::from_u64(1),
            RendezvousEntry {
                fire_at: 100,
                local_socket: 0,
                remote,
            },
        );
        q.schedule(
            Address::from_u64(2),
            RendezvousEntry {
                fire_at: 250,
                local_socket: 0,
                remote,
            },
        );

        let (fired, next) = q.due(100);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, Address::from_u64(1));
        assert_eq!(next, 150);

        let (fired, next) = q.due(300);
        assert_eq!(fired.len(), 1);
        assert_eq!(next, i64::MAX);
        assert!(q.is_empty());
    }

    #[test]
    fn test_reschedule_replaces() {
        let q = RendezvousQueue::new();
        let remote: SocketAddr = "203.0.113.5:9993".parse().unwrap();
        let entry = |t| RendezvousEntry {
            fire_at: t,
            local_socket: 0,
            remote,
        };
        q.schedule(Address::from_u64(1), entry(100));
        q.schedule(Address::from_u64(1), entry(500));
        let (fired, _) = q.due(200);
        assert!(fired.is_empty());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_throttle_is_order_invariant() {
        let t = UniteThrottle::new();
        let a = Address::from_u64(0xa);
        let b = Address::from_u64(0xb);

        assert!(t.should_attempt(a, b, false, 1_000, 30_000));
        assert!(!t.should_attempt(a, b, false, 2_000, 30_000));
        assert!(!t.should_attempt(b, a, false, 2_000, 30_000));
        assert!(t.should_attempt(a, b, false, 31_001, 30_000));
    }

    #[test]
    fn test_throttle_force_bypasses_and_records() {
        let t = UniteThrottle::new();
        let a = Address::from_u64(0xa);
        let b = Address::from_u64(0xb);

        assert!(t.should_attempt(a, b, false, 1_000, 30_000));
        assert!(t.should_attempt(b, a, true, 1_001, 30_000));
        // The forced attempt refreshed the stamp
        assert!(!t.should_attempt(a, b, false, 31_000, 30_000));
    }
}
