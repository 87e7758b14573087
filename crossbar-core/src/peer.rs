//! Peer information.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::multiaddr::Multiaddr;
use crate::peer_id::PeerId;

/// Identity plus address book of one peer.
///
/// `PeerInfo` is a cheaply clonable handle: every clone shares the same
/// address book, so addresses learned (or a connect/disconnect marker set) on
/// one handle are visible through all of them. The switch keeps one handle
/// for the local peer and one per known remote.
#[derive(Clone)]
pub struct PeerInfo {
    id: PeerId,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    addrs: Vec<Multiaddr>,
    connected: Option<Multiaddr>,
}

impl PeerInfo {
    /// Create info for a peer with an empty address book.
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Create info for a peer with a starting set of addresses.
    pub fn with_addrs(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        let info = Self::new(id);
        for addr in addrs {
            info.add_addr(addr);
        }
        info
    }

    /// The peer's identity.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Canonical base58 rendering of the identity.
    pub fn b58(&self) -> String {
        self.id.to_base58()
    }

    /// Snapshot of the known addresses, in insertion order.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        self.inner.lock().unwrap().addrs.clone()
    }

    /// Add an address. Returns false if it was already known.
    pub fn add_addr(&self, addr: Multiaddr) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.addrs.contains(&addr) {
            return false;
        }
        inner.addrs.push(addr);
        true
    }

    /// Mark the address the peer is currently connected through.
    pub fn connect(&self, addr: Multiaddr) {
        self.inner.lock().unwrap().connected = Some(addr);
    }

    /// Clear the connected-address marker.
    pub fn disconnect(&self) {
        self.inner.lock().unwrap().connected = None;
    }

    /// The address the peer is currently connected through, if any.
    pub fn connected_addr(&self) -> Option<Multiaddr> {
        self.inner.lock().unwrap().connected.clone()
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerInfo {}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("PeerInfo")
            .field("id", &self.id)
            .field("addrs", &inner.addrs)
            .field("connected", &inner.connected)
            .finish()
    }
}
