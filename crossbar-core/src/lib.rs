//! # Crossbar Core
//!
//! Identity and addressing primitives for the crossbar connection switch.
//!
//! This crate provides the foundation the switch crate builds on:
//! - Peer identities with a canonical base58 rendering ([`PeerId`])
//! - Opaque transport-tagged addresses ([`Multiaddr`])
//! - Shared peer handles combining identity and address book ([`PeerInfo`])

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod multiaddr;
pub mod peer;
pub mod peer_id;

// Re-export commonly used types at crate root
pub use error::{AddrError, CoreError, IdentityError};
pub use multiaddr::{Multiaddr, CIRCUIT_TAG};
pub use peer::PeerInfo;
pub use peer_id::PeerId;
