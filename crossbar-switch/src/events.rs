//! Switch and connection event delivery.
//!
//! Events travel over explicit channels handed out at subscription time;
//! there is no global emitter.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crossbar_core::PeerId;

/// Events observable on the switch.
#[derive(Debug, Clone)]
pub enum SwitchEvent {
    /// The switch finished starting and its listeners are bound.
    Started,
    /// The switch finished stopping.
    Stopped,
    /// A configuration or pipeline error worth surfacing.
    Error {
        /// Stable error identifier.
        code: &'static str,
        /// Rendered message.
        message: String,
    },
    /// A muxed connection to `peer` was registered.
    PeerMuxEstablished {
        /// Remote peer.
        peer: PeerId,
    },
    /// The muxed connection to `peer` was torn down.
    PeerMuxClosed {
        /// Remote peer.
        peer: PeerId,
    },
}

/// Notices observable on one connection.
#[derive(Debug, Clone)]
pub enum ConnectionNotice {
    /// The transport dial succeeded.
    Connected,
    /// The private-network envelope is in place.
    Private,
    /// The encryption handshake completed.
    Encrypted,
    /// A muxer is running over the connection.
    Muxed,
    /// The connection settled without a muxer.
    Unmuxed,
    /// The pipeline failed.
    Error {
        /// Stable error identifier.
        code: &'static str,
        /// Rendered message.
        message: String,
    },
    /// The connection reached its terminal state.
    Closed,
}

/// Fan-out bus: every subscriber receives a copy of every event sent after
/// it subscribed.
pub(crate) struct Bus<T> {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T> Default for Bus<T> {
    fn default() -> Self {
        Self {
            senders: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self {
            senders: self.senders.clone(),
        }
    }
}

impl<T: Clone> Bus<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: T) {
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
