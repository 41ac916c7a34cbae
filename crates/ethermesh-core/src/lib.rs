//! Ethermesh Core Protocol
//!
//! The packet engine of the overlay:
//! - Topology: canonical peer and path tables, ranked roots
//! - Switch: ingress classification, relaying, fragmentation and
//!   reassembly, rendezvous, identity resolution, periodic maintenance
//!
//! The virtual tap device, membership evaluation, multicast propagation
//! math, and peer persistence are collaborators reached through the traits
//! in [`runtime`].

pub mod config;
pub mod defrag;
pub mod error;
pub mod path;
pub mod peer;
pub mod queues;
pub mod rendezvous;
pub mod runtime;
pub mod switch;
pub mod topology;
pub mod whois;

pub use config::CoreConfig;
pub use defrag::DefragCache;
pub use error::{CoreError, CoreResult};
pub use path::Path;
pub use peer::Peer;
pub use runtime::{
    CachedPeer, DecodeOutcome, InboundPacketHandler, MulticastBloom, Multicaster, Network,
    PeerStore, WireSender,
};
pub use switch::Switch;
pub use topology::{InetPrefix, PhysicalPathConfig, Topology};

/// Overlay protocol version announced in HELLO
pub const PROTOCOL_VERSION: u8 = 1;

/// Software version advertised in HELLO
pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 1;
pub const VERSION_REVISION: u16 = 0;
