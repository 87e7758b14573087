//! Peer-to-peer connection switch.
//!
//! This crate establishes, upgrades, multiplexes, and tears down
//! bidirectional connections between peers across pluggable transports,
//! encryption layers, and stream muxers:
//!
//! - Outbound connections run dial → (protect) → encrypt → mux, with
//!   transport fallback and a circuit-relay retry
//! - Accepted sockets run the mirror pipeline and feed negotiated streams to
//!   registered protocol handlers
//! - A dial queue coalesces concurrent dials per peer and bounds global
//!   parallelism
//!
//! # Architecture
//!
//! The switch uses a task-per-connection architecture; components talk over
//! channels and every connection's lifecycle is an explicit state machine.
//!
//! ```text
//! Switch (lifecycle, registries, connection tables)
//! ├── DialScheduler (global intake + per-peer queues)
//! │   └── OutboundConnection (dial → protect → encrypt → mux)
//! ├── Listener pumps (one per transport)
//! │   └── InboundConnection (protect → encrypt → mux)
//! └── ProtocolDispatcher (negotiate + route inbound streams)
//! ```
//!
//! Transports, the encryption layer, muxers, and the negotiation wire codec
//! are external collaborators plugged in through the contracts in
//! [`transport`], [`crypto`], [`muxing`], and [`negotiator`].
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use crossbar_core::{PeerId, PeerInfo};
//! use crossbar_switch::Switch;
//!
//! let us = PeerInfo::new(PeerId::from_bytes(local_key_digest)?);
//! let switch = Switch::builder(us)
//!     .crypto(Arc::new(noise))
//!     .negotiator(Arc::new(multistream))
//!     .transport("tcp", Arc::new(tcp))
//!     .muxer(Arc::new(yamux))
//!     .build()?;
//!
//! switch.handle("/kv/1.0.0", Arc::new(on_stream), None);
//! switch.start().await?;
//! let stream = switch.dial(peer, Some("/kv/1.0.0")).await?;
//! ```

pub mod config;
pub mod error;

pub mod connection;
pub mod crypto;
pub mod events;
pub mod muxing;
pub mod negotiator;
pub mod observer;
pub mod protocol;
pub mod stream;
pub mod switch;
pub mod transport;

mod ctx;
mod dialer;

// Re-export main types
pub use config::{SwitchConfig, DEFAULT_MAX_PARALLEL_DIALS};
pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionState};
pub use crypto::{Crypto, Protector};
pub use ctx::InboundInterceptor;
pub use error::{SwitchError, SwitchResult};
pub use events::{ConnectionNotice, SwitchEvent};
pub use muxing::{Muxer, MuxerFactory, MuxerRegistry};
pub use negotiator::{exact_matcher, Negotiator, ProtocolMatcher, Selection};
pub use observer::{Direction, PeerTraffic, TrafficObserver, TrafficSample};
pub use protocol::{ProtocolDispatcher, ProtocolHandlerFn, ProtocolTable};
pub use stream::{PeerSlot, StreamIo, SwitchStream};
pub use switch::{ConnectionSnapshot, Switch, SwitchBuilder, SwitchState};
pub use transport::{Listener, Transport, TransportRegistry};
