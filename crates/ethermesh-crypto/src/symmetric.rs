//! Session Keys
//!
//! Each peer relationship carries two 256-bit symmetric keys derived from
//! the X25519 shared secret: one that drives the packet keystream and one
//! that keys the packet authenticator. Derivation uses BLAKE3 `derive_key`
//! with distinct context strings so the two can never collide.

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::SYMMETRIC_KEY_SIZE;
use crate::error::{CryptoError, CryptoResult};

const CRYPT_KEY_CONTEXT: &str = "ethermesh v1 packet crypt key";
const MAC_KEY_CONTEXT: &str = "ethermesh v1 packet mac key";

/// A 256-bit symmetric key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

impl SymmetricKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SYMMETRIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SYMMETRIC_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }
}

/// The pair of keys protecting traffic with one peer
#[derive(Clone)]
pub struct SessionKeys {
    /// Keystream key for packet payload encryption
    pub crypt: SymmetricKey,
    /// Key for the 64-bit packet authenticator
    pub mac: SymmetricKey,
}

impl SessionKeys {
    /// Derive both session keys from an X25519 shared secret
    pub fn derive(shared_secret: &[u8; 32]) -> Self {
        Self {
            crypt: SymmetricKey::from_bytes(blake3::derive_key(CRYPT_KEY_CONTEXT, shared_secret)),
            mac: SymmetricKey::from_bytes(blake3::derive_key(MAC_KEY_CONTEXT, shared_secret)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic_and_split() {
        let secret = [7u8; 32];
        let a = SessionKeys::derive(&secret);
        let b = SessionKeys::derive(&secret);
        assert_eq!(a.crypt.as_bytes(), b.crypt.as_bytes());
        assert_eq!(a.mac.as_bytes(), b.mac.as_bytes());
        assert_ne!(a.crypt.as_bytes(), a.mac.as_bytes());
    }

    #[test]
    fn test_try_from_slice_length_check() {
        assert!(SymmetricKey::try_from_slice(&[0u8; 16]).is_err());
        assert!(SymmetricKey::try_from_slice(&[0u8; 32]).is_ok());
    }
}
