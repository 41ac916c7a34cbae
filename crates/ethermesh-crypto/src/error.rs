//! Crypto error types

use thiserror::Error;

/// Identity and key errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Address is malformed or reserved
    #[error("invalid address")]
    InvalidAddress,

    /// Identity hash has the wrong length
    #[error("invalid identity hash")]
    InvalidIdentityHash,

    /// Public key bytes failed to parse
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Key or marshal buffer has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Signature failed to verify
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// Claimed address does not match the identity it travels with
    #[error("address {claimed} does not match identity-derived address {derived}")]
    AddressMismatch { claimed: String, derived: String },
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
