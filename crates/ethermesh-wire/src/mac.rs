//! Ethernet MACs and Multicast Groups
//!
//! The overlay assigns each node a virtual MAC whose first octet is a fixed
//! scheme prefix and whose remaining five octets are the node's short
//! address, so a unicast destination MAC can be mapped straight back to an
//! overlay address without any lookup.

use std::fmt;

use ethermesh_crypto::Address;

/// First octet of every overlay-scheme MAC
pub const OVERLAY_MAC_PREFIX: u8 = 0x3c;

/// A 48-bit Ethernet address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Mac([u8; 6]);

impl Mac {
    /// The all-ones broadcast address
    pub const BROADCAST: Mac = Mac([0xff; 6]);

    /// Create from raw octets
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Get raw octets
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// The overlay-scheme MAC for a node address
    pub fn from_address(addr: Address) -> Self {
        let a = addr.to_bytes();
        Mac([OVERLAY_MAC_PREFIX, a[0], a[1], a[2], a[3], a[4]])
    }

    /// True for group (multicast or broadcast) addresses
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// True for the all-ones broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// If this MAC follows the overlay scheme, the node address embedded in
    /// its low 40 bits. Reserved addresses never map back.
    pub fn overlay_address(&self) -> Option<Address> {
        if self.0[0] != OVERLAY_MAC_PREFIX {
            return None;
        }
        let addr = Address::from_bytes(&self.0[1..]).ok()?;
        if addr.is_reserved() {
            return None;
        }
        Some(addr)
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", self)
    }
}

/// A multicast channel: a group MAC plus a 32-bit "address of
/// differentiation" that partitions noisy broadcast traffic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MulticastGroup {
    mac: Mac,
    adi: u32,
}

impl MulticastGroup {
    /// A plain group with no differentiation
    pub fn new(mac: Mac, adi: u32) -> Self {
        Self { mac, adi }
    }

    /// The per-target-IP channel used for IPv4 ARP, so an ARP storm for one
    /// IP stays on its own channel instead of hitting every member.
    pub fn for_address_resolution(target_ip: [u8; 4]) -> Self {
        Self {
            mac: Mac::BROADCAST,
            adi: u32::from_be_bytes(target_ip),
        }
    }

    /// Group MAC
    pub fn mac(&self) -> Mac {
        self.mac
    }

    /// Address of differentiation
    pub fn adi(&self) -> u32 {
        self.adi
    }
}

impl fmt::Display for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:08x}", self.mac, self.adi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_scheme_roundtrip() {
        let addr = Address::from_u64(0xdeadbeef);
        let mac = Mac::from_address(addr);
        assert_eq!(mac.as_bytes(), &[0x3c, 0x00, 0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(mac.overlay_address(), Some(addr));
    }

    #[test]
    fn test_non_overlay_macs() {
        assert_eq!(Mac::from_bytes([0x02, 1, 2, 3, 4, 5]).overlay_address(), None);
        assert_eq!(Mac::BROADCAST.overlay_address(), None);
        // Overlay prefix but reserved (zero) embedded address
        assert_eq!(Mac::from_bytes([0x3c, 0, 0, 0, 0, 0]).overlay_address(), None);
    }

    #[test]
    fn test_multicast_bits() {
        assert!(Mac::BROADCAST.is_broadcast());
        assert!(Mac::BROADCAST.is_multicast());
        assert!(Mac::from_bytes([0x01, 0, 0x5e, 1, 2, 3]).is_multicast());
        assert!(!Mac::from_bytes([0x3c, 0, 0xde, 0xad, 0xbe, 0xef]).is_multicast());
    }

    #[test]
    fn test_arp_group_derivation() {
        let g = MulticastGroup::for_address_resolution([10, 1, 2, 3]);
        assert!(g.mac().is_broadcast());
        assert_eq!(g.adi(), 0x0a010203);
    }
}
