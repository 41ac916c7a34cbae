//! Wire format errors
//!
//! Every parse failure on ingress collapses to a dropped packet at the
//! classifier boundary; these variants exist so the drop can be logged
//! with a reason.

use thiserror::Error;

/// Wire encoding/decoding errors
#[derive(Debug, Error)]
pub enum WireError {
    /// Buffer too short for the structure being read
    #[error("truncated buffer: need {needed}, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// Endpoint type tag not in the known set
    #[error("unknown endpoint type tag {0}")]
    UnknownEndpointType(u8),

    /// Verb byte not in the known set
    #[error("unknown verb 0x{0:02x}")]
    UnknownVerb(u8),

    /// DNS name or URL exceeds the marshal limit
    #[error("name length {0} exceeds endpoint name limit")]
    NameTooLong(usize),

    /// Name or URL field is missing its NUL terminator
    #[error("unterminated name in endpoint")]
    UnterminatedName,

    /// Fragment header fields are out of range
    #[error("malformed fragment: {0}")]
    BadFragment(&'static str),

    /// Compressed payload failed to expand
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// Address bytes are invalid
    #[error("invalid address in wire structure")]
    BadAddress,
}

/// Result type for wire operations
pub type WireResult<T> = Result<T, WireError>;
