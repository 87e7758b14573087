//! Transport contract and registry.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crossbar_core::{Multiaddr, PeerInfo, CIRCUIT_TAG};

use crate::error::{SwitchError, SwitchResult};
use crate::stream::SwitchStream;

/// A way of reaching peers (TCP, WebSocket, circuit relay, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial the peer over one of its addresses this transport can serve.
    async fn dial(&self, peer: &PeerInfo) -> SwitchResult<SwitchStream>;

    /// Subset of `addrs` this transport can serve.
    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr>;

    /// Create a listener delivering accepted streams through `incoming`.
    fn create_listener(&self, incoming: mpsc::Sender<SwitchStream>) -> Box<dyn Listener>;
}

/// A bound listener of one transport.
#[async_trait]
pub trait Listener: Send {
    /// Bind to `addrs` and start accepting. Returns the bound addresses.
    async fn listen(&mut self, addrs: &[Multiaddr]) -> SwitchResult<Vec<Multiaddr>>;

    /// Stop accepting and release the binding.
    async fn close(&mut self) -> SwitchResult<()>;
}

/// Registered transports, looked up by tag.
#[derive(Default)]
pub struct TransportRegistry {
    entries: Vec<(String, Arc<dyn Transport>)>,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport under `tag`. Re-registering a tag replaces the
    /// transport but keeps its original position.
    pub fn add(&mut self, tag: &str, transport: Arc<dyn Transport>) {
        if let Some(entry) = self.entries.iter_mut().find(|(t, _)| t == tag) {
            entry.1 = transport;
        } else {
            self.entries.push((tag.to_string(), transport));
        }
    }

    /// Look up a transport by tag.
    pub fn get(&self, tag: &str) -> Option<Arc<dyn Transport>> {
        self.entries
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, t)| t.clone())
    }

    /// Dial `peer` through the transport registered under `tag`.
    pub async fn dial(&self, tag: &str, peer: &PeerInfo) -> SwitchResult<SwitchStream> {
        let transport = self
            .get(tag)
            .ok_or_else(|| SwitchError::NotConnected(format!("no transport {tag}")))?;
        transport.dial(peer).await
    }

    /// Registered tags in registration order.
    pub fn tags(&self) -> Vec<String> {
        self.entries.iter().map(|(t, _)| t.clone()).collect()
    }

    /// Whether any transport other than the circuit relay is registered.
    pub fn has_non_circuit(&self) -> bool {
        self.entries.iter().any(|(t, _)| t != CIRCUIT_TAG)
    }

    /// Whether the circuit-relay transport is registered.
    pub fn has_circuit(&self) -> bool {
        self.entries.iter().any(|(t, _)| t == CIRCUIT_TAG)
    }

    /// Tags of the transports whose filter accepts at least one of the
    /// peer's addresses.
    ///
    /// Registration order is preserved, except the circuit relay is
    /// partitioned to the back so direct routes are always tried first.
    pub fn available(&self, peer: &PeerInfo) -> Vec<String> {
        let addrs = peer.addrs();
        let mut tags = Vec::new();
        let mut circuit = None;
        for (tag, transport) in &self.entries {
            if transport.filter(&addrs).is_empty() {
                continue;
            }
            if tag == CIRCUIT_TAG {
                circuit = Some(tag.clone());
            } else {
                tags.push(tag.clone());
            }
        }
        tags.extend(circuit);
        tags
    }
}
