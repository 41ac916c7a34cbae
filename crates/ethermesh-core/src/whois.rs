//! Identity Resolution
//!
//! Outstanding WHOIS requests, one per unresolved address. Each request
//! carries a retry budget and remembers which roots it has already
//! consulted so retries rotate to a different root. The resolver only does
//! bookkeeping; the switch performs the sends after the lock is released.

use std::collections::HashMap;
use std::sync::Mutex;

use ethermesh_crypto::Address;
use tracing::trace;

struct WhoisRequest {
    last_sent: i64,
    retries: u8,
    consulted: Vec<Address>,
}

/// A retry the sweep decided is due: send WHOIS for `address` to the best
/// root not in `consulted`, then report back with `record_consulted`.
pub struct WhoisRetry {
    pub address: Address,
    pub consulted: Vec<Address>,
}

/// Table of outstanding identity resolutions
pub struct WhoisResolver {
    entries: Mutex<HashMap<Address, WhoisRequest>>,
}

impl WhoisResolver {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) resolution for an address. An outstanding
    /// request has its retry budget and consulted set reset, so every
    /// explicit request gets a full round of attempts.
    pub fn begin(&self, addr: Address, now: i64) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(addr).or_insert(WhoisRequest {
            last_sent: now,
            retries: 0,
            consulted: Vec::new(),
        });
        entry.last_sent = now;
        entry.retries = 0;
        entry.consulted.clear();
    }

    /// Record which root a WHOIS for `addr` was actually sent to
    pub fn record_consulted(&self, addr: Address, root: Address) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&addr) {
            entry.consulted.push(root);
        }
    }

    /// Resolution finished (or was abandoned); drop the request
    pub fn cancel(&self, addr: Address) {
        self.entries.lock().unwrap().remove(&addr);
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk the table: emit a retry for every entry whose delay elapsed and
    /// whose budget remains, remove exhausted entries, and return the
    /// retries together with the suggested delay until the next call.
    pub fn sweep(&self, now: i64, retry_delay: i64, max_retries: u8) -> (Vec<WhoisRetry>, i64) {
        let mut retries = Vec::new();
        let mut next_delay = i64::MAX;

        let mut entries = self.entries.lock().unwrap();
        entries.retain(|addr, entry| {
            let since = now.saturating_sub(entry.last_sent);
            if since >= retry_delay {
                if entry.retries >= max_retries {
                    trace!(%addr, "WHOIS timed out");
                    return false;
                }
                entry.last_sent = now;
                entry.retries += 1;
                retries.push(WhoisRetry {
                    address: *addr,
                    consulted: entry.consulted.clone(),
                });
                next_delay = next_delay.min(retry_delay);
            } else {
                next_delay = next_delay.min(retry_delay - since);
            }
            true
        });

        (retries, next_delay)
    }
}

impl Default for WhoisResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: i64 = 500;
    const MAX: u8 = 4;

    #[test]
    fn test_retry_schedule_and_bound() {
        let resolver = WhoisResolver::new();
        let addr = Address::from_u64(0xabc);
        resolver.begin(addr, 0);
        resolver.record_consulted(addr, Address::from_u64(1));

        // Too early: nothing due, delay counts down
        let (due, delay) = resolver.sweep(100, DELAY, MAX);
        assert!(due.is_empty());
        assert_eq!(delay, 400);

        // Each elapsed delay yields one retry carrying the consulted set
        let mut now = 0;
        for round in 0..MAX {
            now += DELAY;
            let (due, _) = resolver.sweep(now, DELAY, MAX);
            assert_eq!(due.len(), 1, "round {round}");
            assert_eq!(due[0].address, addr);
            assert_eq!(due[0].consulted.len() as u8, round + 1);
            resolver.record_consulted(addr, Address::from_u64(u64::from(round) + 2));
        }

        // Budget exhausted: the entry is removed, not retried
        now += DELAY;
        let (due, _) = resolver.sweep(now, DELAY, MAX);
        assert!(due.is_empty());
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_begin_resets_outstanding_budget() {
        let resolver = WhoisResolver::new();
        let addr = Address::from_u64(0xabc);
        resolver.begin(addr, 0);
        resolver.record_consulted(addr, Address::from_u64(1));
        for i in 1..=MAX {
            resolver.sweep(i64::from(i) * DELAY, DELAY, MAX);
        }
        assert_eq!(resolver.len(), 1);

        // A fresh request for the same address starts the budget over,
        // with an empty consulted set and a full delay before any retry
        resolver.begin(addr, 10_000);
        let (due, delay) = resolver.sweep(10_100, DELAY, MAX);
        assert!(due.is_empty());
        assert_eq!(delay, 400);
        let (due, _) = resolver.sweep(10_000 + DELAY, DELAY, MAX);
        assert_eq!(due.len(), 1);
        assert!(due[0].consulted.is_empty());
    }

    #[test]
    fn test_cancel() {
        let resolver = WhoisResolver::new();
        let addr = Address::from_u64(0xabc);
        resolver.begin(addr, 0);
        resolver.cancel(addr);
        let (due, delay) = resolver.sweep(DELAY, DELAY, MAX);
        assert!(due.is_empty());
        assert_eq!(delay, i64::MAX);
    }
}
