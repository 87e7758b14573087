//! Connection state machines.
//!
//! This module provides:
//! - The lifecycle state/event vocabulary and legal-transition tables
//! - The outbound upgrade machine (dial, protect, encrypt, mux)
//! - The inbound mirror for accepted sockets

pub mod inbound;
pub mod outbound;
pub mod state;

// Re-export main types
pub use outbound::ConnectionHandle;
pub use state::{inbound_step, outbound_step, ConnectionEvent, ConnectionState};
