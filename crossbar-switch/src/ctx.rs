//! Shared internals of one switch instance.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use crossbar_core::PeerInfo;

use crate::config::SwitchConfig;
use crate::connection::inbound::InboundHandle;
use crate::connection::outbound::ConnectionHandle;
use crate::crypto::{Crypto, Protector};
use crate::events::{Bus, SwitchEvent};
use crate::muxing::MuxerRegistry;
use crate::negotiator::Negotiator;
use crate::observer::TrafficObserver;
use crate::protocol::{ProtocolDispatcher, ProtocolTable};
use crate::stream::SwitchStream;
use crate::transport::TransportRegistry;

/// Handler that, when installed, receives accepted streams right after the
/// private-network envelope instead of the regular upgrade pipeline.
pub type InboundInterceptor = Arc<dyn Fn(SwitchStream) + Send + Sync>;

/// State shared by the switch API, the dial queue, and every connection.
///
/// The registries are mutated by switch API calls and read by connections;
/// writes are serialized behind the per-field mutexes, and none of the locks
/// is held across a suspension point.
pub(crate) struct SwitchCtx {
    /// The local peer.
    pub us: PeerInfo,
    /// Switch configuration.
    pub config: SwitchConfig,
    /// Registered transports.
    pub transports: Mutex<TransportRegistry>,
    /// Registered muxer factories.
    pub muxers: Mutex<MuxerRegistry>,
    /// Registered protocol handlers.
    pub protocols: ProtocolTable,
    /// The encryption layer.
    pub crypto: Arc<dyn Crypto>,
    /// Optional private-network layer.
    pub protector: Option<Arc<dyn Protector>>,
    /// Protocol negotiation driver.
    pub negotiator: Arc<dyn Negotiator>,
    /// Traffic metering fan-out.
    pub observer: TrafficObserver,
    /// Switch event fan-out.
    pub events: Bus<SwitchEvent>,
    /// Optional bypass for accepted connections.
    pub inbound_interceptor: Option<InboundInterceptor>,
    /// Encrypted-but-not-muxed connections by base58 peer id.
    pub conns: Mutex<HashMap<String, ConnectionHandle>>,
    /// Fully muxed connections by base58 peer id.
    pub muxed_conns: Mutex<HashMap<String, ConnectionHandle>>,
    /// Accepted connections still alive, for shutdown draining.
    pub inbound: Mutex<HashMap<u64, InboundHandle>>,
    /// Id source for inbound tracking.
    pub next_inbound_id: AtomicU64,
}

impl SwitchCtx {
    /// Dispatcher bound to this switch's protocol table.
    pub fn dispatcher(&self) -> ProtocolDispatcher {
        ProtocolDispatcher::new(
            self.protocols.clone(),
            self.negotiator.clone(),
            self.observer.clone(),
        )
    }

    /// The muxed connection to `b58`, if one is registered.
    pub fn muxed_conn(&self, b58: &str) -> Option<ConnectionHandle> {
        self.muxed_conns.lock().unwrap().get(b58).cloned()
    }
}
