//! Ethermesh Cryptographic Primitives
//!
//! This crate provides the identity layer of the ethermesh overlay:
//! - Node addresses derived from public keys
//! - Long-term identities (Ed25519 signing + X25519 key agreement)
//! - Per-peer session keys (packet encryption and authentication)

pub mod address;
pub mod error;
pub mod identity;
pub mod symmetric;

pub use address::{Address, IdentityHash};
pub use error::{CryptoError, CryptoResult};
pub use identity::{Identity, IdentityPublic};
pub use symmetric::{SessionKeys, SymmetricKey};

/// Protocol constants
pub mod constants {
    /// Short node address size in bytes (40 bits)
    pub const ADDRESS_SIZE: usize = 5;

    /// Identity hash size in bytes (384 bits)
    pub const IDENTITY_HASH_SIZE: usize = 48;

    /// Ed25519 public key size
    pub const ED25519_PUBKEY_SIZE: usize = 32;

    /// X25519 public key size
    pub const X25519_PUBKEY_SIZE: usize = 32;

    /// Ed25519 signature size
    pub const SIGNATURE_SIZE: usize = 64;

    /// Symmetric session key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// Marshaled public identity size (address + both public keys)
    pub const IDENTITY_MARSHAL_SIZE: usize =
        ADDRESS_SIZE + ED25519_PUBKEY_SIZE + X25519_PUBKEY_SIZE;
}
