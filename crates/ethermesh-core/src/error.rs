//! Core errors
//!
//! Ingress classification and the periodic tick never surface errors; every
//! failure there collapses to a logged drop. These variants cover the
//! construction and configuration surface.

use thiserror::Error;

/// Core engine errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Peer identity does not bind to the claimed address
    #[error("identity error: {0}")]
    Identity(#[from] ethermesh_crypto::CryptoError),

    /// Wire-level failure
    #[error("wire error: {0}")]
    Wire(#[from] ethermesh_wire::WireError),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Physical path configuration table is full
    #[error("physical path table full (max {0})")]
    PathConfigFull(usize),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
