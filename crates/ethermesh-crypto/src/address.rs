//! Node Addresses
//!
//! Every node is identified by a 40-bit short address derived from its
//! public identity keys, and by the full 384-bit hash of those keys.
//! The short address is what travels in packet headers; the hash is a
//! collision-resistant secondary lookup key.

use std::fmt;
use std::str::FromStr;

use crate::constants::{ADDRESS_SIZE, IDENTITY_HASH_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// A 40-bit short node address, displayed as ten hex digits.
///
/// Address zero means "none"; addresses whose first byte is 0xff are
/// reserved for wire-format markers and never assigned to nodes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address {
    /// The reserved "none" address
    pub const ZERO: Address = Address(0);

    /// Create from a 64-bit value, keeping the low 40 bits
    pub fn from_u64(v: u64) -> Self {
        Address(v & 0xff_ffff_ffff)
    }

    /// Read a 5-byte big-endian address from a slice
    pub fn from_bytes(b: &[u8]) -> CryptoResult<Self> {
        if b.len() < ADDRESS_SIZE {
            return Err(CryptoError::InvalidAddress);
        }
        let mut v = 0u64;
        for byte in &b[..ADDRESS_SIZE] {
            v = (v << 8) | u64::from(*byte);
        }
        Ok(Address(v))
    }

    /// The 5-byte big-endian wire form
    pub fn to_bytes(self) -> [u8; ADDRESS_SIZE] {
        let b = self.0.to_be_bytes();
        [b[3], b[4], b[5], b[6], b[7]]
    }

    /// The numeric value (low 40 bits)
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// True for the "none" address
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// True if this address may never belong to a node: zero, or a first
    /// byte of 0xff (which the wire format uses as the fragment indicator)
    pub fn is_reserved(self) -> bool {
        self.0 == 0 || (self.0 >> 32) == 0xff
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:010x})", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 * ADDRESS_SIZE {
            return Err(CryptoError::InvalidAddress);
        }
        let v = u64::from_str_radix(s, 16).map_err(|_| CryptoError::InvalidAddress)?;
        Ok(Address(v))
    }
}

/// 384-bit hash of a node's public identity keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityHash([u8; IDENTITY_HASH_SIZE]);

impl IdentityHash {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; IDENTITY_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != IDENTITY_HASH_SIZE {
            return Err(CryptoError::InvalidIdentityHash);
        }
        let mut bytes = [0u8; IDENTITY_HASH_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; IDENTITY_HASH_SIZE] {
        &self.0
    }

    /// The short address embedded in this hash (its first five bytes)
    pub fn address(&self) -> Address {
        Address::from_bytes(&self.0[..ADDRESS_SIZE]).expect("hash is longer than an address")
    }

    /// The clear-text probe token derived from this hash: its first eight
    /// bytes as a big-endian integer. Peers announce this on first contact
    /// so the receiver can find them before any key agreement completes.
    pub fn probe(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().expect("hash is longer than a probe"))
    }
}

impl fmt::Debug for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityHash(")?;
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip() {
        let a = Address::from_u64(0xdeadbeef05);
        assert_eq!(a.to_bytes(), [0xde, 0xad, 0xbe, 0xef, 0x05]);
        assert_eq!(Address::from_bytes(&a.to_bytes()).unwrap(), a);
    }

    #[test]
    fn test_address_display() {
        let a = Address::from_u64(0xdeadbeef);
        assert_eq!(a.to_string(), "00deadbeef");
        assert_eq!("00deadbeef".parse::<Address>().unwrap(), a);
    }

    #[test]
    fn test_address_masks_to_40_bits() {
        let a = Address::from_u64(0xffff_dead_beef_0001);
        assert_eq!(a.to_u64(), 0xad_beef_0001);
    }

    #[test]
    fn test_reserved_addresses() {
        assert!(Address::ZERO.is_reserved());
        assert!(Address::from_u64(0xff00000001).is_reserved());
        assert!(!Address::from_u64(0xdeadbeef).is_reserved());
    }

    #[test]
    fn test_identity_hash_probe_and_address() {
        let mut bytes = [0u8; IDENTITY_HASH_SIZE];
        bytes[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let h = IdentityHash::from_bytes(bytes);
        assert_eq!(h.probe(), 0x0102030405060708);
        assert_eq!(h.address().to_u64(), 0x0102030405);
    }
}
