//! Outbound connections.
//!
//! One `OutboundConnection` owns the whole upgrade pipeline of a single
//! outgoing connection: transport dial with fallback, optional
//! private-network protection, encryption, and muxer negotiation. The
//! machine is driven exclusively through [`ConnectionHandle::feed`]; entry
//! actions may chain follow-up events but never run concurrently for the
//! same connection.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crossbar_core::{Multiaddr, PeerInfo, CIRCUIT_TAG};

use crate::connection::state::{outbound_step, ConnectionEvent, ConnectionState};
use crate::ctx::SwitchCtx;
use crate::error::{SwitchError, SwitchResult};
use crate::events::{Bus, ConnectionNotice, SwitchEvent};
use crate::muxing::Muxer;
use crate::protocol::ProtocolDispatcher;
use crate::stream::SwitchStream;

/// Cloneable handle to one outbound connection.
///
/// This is what the connection tables store and what `dial_fsm` hands to
/// callers; the machine itself lives behind a mutex so no reference to it
/// survives across a suspension point.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Mutex<OutboundConnection>>,
    peer: PeerInfo,
    notices: Bus<ConnectionNotice>,
}

impl ConnectionHandle {
    /// Create a fresh, disconnected machine for `peer`.
    pub(crate) fn new(ctx: Arc<SwitchCtx>, peer: PeerInfo) -> Self {
        let notices = Bus::new();
        let machine = OutboundConnection {
            ctx,
            them: peer.clone(),
            state: ConnectionState::Disconnected,
            conn: None,
            muxer: None,
            tried_circuit: false,
            last_error: None,
            notices: notices.clone(),
        };
        Self {
            inner: Arc::new(Mutex::new(machine)),
            peer,
            notices,
        }
    }

    /// The remote peer.
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Feed one lifecycle event, running entry actions to completion.
    pub async fn feed(&self, event: ConnectionEvent) -> SwitchResult<()> {
        let mut guard = self.inner.lock().await;
        guard.drive(self, event).await
    }

    /// Current state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// The first terminal error recorded, if any.
    pub async fn last_error(&self) -> Option<SwitchError> {
        self.inner.lock().await.last_error.clone()
    }

    /// The muxer, once the connection reached `Muxed`.
    pub async fn muxer(&self) -> Option<Arc<dyn Muxer>> {
        self.inner.lock().await.muxer.clone()
    }

    /// Receive a copy of every future lifecycle notice.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionNotice> {
        self.notices.subscribe()
    }

    /// Open a stream to the remote and negotiate `protocol` on it.
    ///
    /// Over a muxed connection this opens a fresh substream; over an unmuxed
    /// one it binds the connection itself to the protocol, consuming it.
    pub async fn new_stream(&self, protocol: &str) -> SwitchResult<SwitchStream> {
        let mut guard = self.inner.lock().await;
        guard.shake(protocol).await
    }
}

/// The outbound upgrade machine.
pub(crate) struct OutboundConnection {
    ctx: Arc<SwitchCtx>,
    them: PeerInfo,
    state: ConnectionState,
    conn: Option<SwitchStream>,
    muxer: Option<Arc<dyn Muxer>>,
    tried_circuit: bool,
    last_error: Option<SwitchError>,
    notices: Bus<ConnectionNotice>,
}

impl OutboundConnection {
    async fn drive(
        &mut self,
        handle: &ConnectionHandle,
        event: ConnectionEvent,
    ) -> SwitchResult<()> {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let Some(to) = outbound_step(self.state, event) else {
                tracing::warn!(
                    peer = %self.them.b58(),
                    state = %self.state,
                    event = %event,
                    "rejected connection event"
                );
                return Err(SwitchError::InvalidTransition {
                    state: self.state.name(),
                    event: event.name(),
                });
            };
            tracing::debug!(
                peer = %self.them.b58(),
                from = %self.state,
                to = %to,
                "connection state transition"
            );
            self.state = to;
            next = self.enter(handle, to).await;
        }
        Ok(())
    }

    async fn enter(
        &mut self,
        handle: &ConnectionHandle,
        state: ConnectionState,
    ) -> Option<ConnectionEvent> {
        match state {
            ConnectionState::Dialing => self.enter_dialing().await,
            ConnectionState::Dialed => {
                self.notices.emit(ConnectionNotice::Connected);
                None
            }
            ConnectionState::Privatizing => self.enter_privatizing().await,
            ConnectionState::Privatized => {
                self.notices.emit(ConnectionNotice::Private);
                None
            }
            ConnectionState::Encrypting => self.enter_encrypting().await,
            ConnectionState::Encrypted => {
                self.notices.emit(ConnectionNotice::Encrypted);
                None
            }
            ConnectionState::Upgrading => self.enter_upgrading(handle).await,
            ConnectionState::Muxed => {
                self.notices.emit(ConnectionNotice::Muxed);
                None
            }
            ConnectionState::Connected => {
                self.notices.emit(ConnectionNotice::Unmuxed);
                None
            }
            ConnectionState::Disconnecting => self.enter_disconnecting().await,
            ConnectionState::Disconnected => {
                self.notices.emit(ConnectionNotice::Closed);
                None
            }
            ConnectionState::Aborted => {
                if self.last_error.is_none() {
                    self.last_error = Some(SwitchError::Aborted);
                }
                self.conn = None;
                self.notices.emit(ConnectionNotice::Closed);
                None
            }
            ConnectionState::Errored => Some(ConnectionEvent::Disconnect),
        }
    }

    /// Record a pipeline failure and surface it on the connection.
    fn fail(&mut self, err: SwitchError) {
        self.notices.emit(ConnectionNotice::Error {
            code: err.code(),
            message: err.to_string(),
        });
        if self.last_error.is_none() {
            self.last_error = Some(err);
        }
    }

    async fn enter_dialing(&mut self) -> Option<ConnectionEvent> {
        let (tags, has_circuit, has_non_circuit) = {
            let transports = self.ctx.transports.lock().unwrap();
            (
                transports.available(&self.them),
                transports.has_circuit(),
                transports.has_non_circuit(),
            )
        };

        if !has_non_circuit {
            let err = SwitchError::NoTransports;
            self.ctx.events.emit(SwitchEvent::Error {
                code: err.code(),
                message: err.to_string(),
            });
            self.fail(err);
            return Some(ConnectionEvent::Disconnect);
        }

        for tag in tags.iter().filter(|t| *t != CIRCUIT_TAG) {
            if self.try_dial(tag).await {
                return Some(ConnectionEvent::Done);
            }
        }

        // Direct routes exhausted; fall back through the relay exactly once.
        if has_circuit && !self.tried_circuit {
            self.tried_circuit = true;
            self.them.add_addr(Multiaddr::circuit_to(self.them.id()));
            tracing::debug!(peer = %self.them.b58(), "falling back to circuit relay");
            if self.try_dial(CIRCUIT_TAG).await {
                return Some(ConnectionEvent::Done);
            }
        }

        self.fail(SwitchError::AllTransportsFailed {
            peer: self.them.b58(),
        });
        Some(ConnectionEvent::Disconnect)
    }

    async fn try_dial(&mut self, tag: &str) -> bool {
        let transport = {
            let transports = self.ctx.transports.lock().unwrap();
            transports.get(tag)
        };
        let Some(transport) = transport else {
            return false;
        };
        match transport.dial(&self.them).await {
            Ok(raw) => {
                tracing::debug!(peer = %self.them.b58(), transport = %tag, "transport dial succeeded");
                if let Some(addr) = transport.filter(&self.them.addrs()).first() {
                    self.them.connect(addr.clone());
                }
                let tapped = self.ctx.observer.tap(raw, Some(tag.to_string()), None);
                self.conn = Some(tapped);
                true
            }
            Err(err) => {
                tracing::debug!(
                    peer = %self.them.b58(),
                    transport = %tag,
                    error = %err,
                    "transport dial failed"
                );
                false
            }
        }
    }

    async fn enter_privatizing(&mut self) -> Option<ConnectionEvent> {
        let Some(protector) = self.ctx.protector.clone() else {
            self.fail(SwitchError::Protector("no protector configured".to_string()));
            return Some(ConnectionEvent::Disconnect);
        };
        let Some(conn) = self.conn.take() else {
            self.fail(SwitchError::NotConnected(self.them.b58()));
            return Some(ConnectionEvent::Disconnect);
        };
        match protector.protect(conn).await {
            Ok(protected) => {
                self.conn = Some(protected);
                Some(ConnectionEvent::Done)
            }
            Err(err) => {
                self.fail(err);
                Some(ConnectionEvent::Disconnect)
            }
        }
    }

    async fn enter_encrypting(&mut self) -> Option<ConnectionEvent> {
        let Some(conn) = self.conn.take() else {
            self.fail(SwitchError::NotConnected(self.them.b58()));
            return Some(ConnectionEvent::Error);
        };

        let crypto = self.ctx.crypto.clone();
        let tag = crypto.tag().to_string();
        let result = async {
            let selection = self.ctx.negotiator.select(conn, &[tag.clone()]).await?;
            let stream = match selection {
                crate::negotiator::Selection::Selected { stream, .. } => stream,
                crate::negotiator::Selection::Refused { .. } => {
                    return Err(SwitchError::Negotiation(format!(
                        "encryption protocol {tag} refused"
                    )));
                }
            };
            let metered = self.ctx.observer.tap(stream, None, Some(tag));
            crypto
                .encrypt(
                    self.ctx.us.id().clone(),
                    metered,
                    Some(self.them.id().clone()),
                )
                .await
        }
        .await;

        match result {
            Ok(secured) => {
                secured.set_peer_info(self.them.clone());
                self.conn = Some(secured);
                Some(ConnectionEvent::Done)
            }
            Err(err) => {
                self.fail(SwitchError::maybe_unexpected_end(err));
                Some(ConnectionEvent::Error)
            }
        }
    }

    async fn enter_upgrading(&mut self, handle: &ConnectionHandle) -> Option<ConnectionEvent> {
        let codecs = {
            let muxers = self.ctx.muxers.lock().unwrap();
            muxers.codecs()
        };

        if codecs.is_empty() {
            self.ctx
                .conns
                .lock()
                .unwrap()
                .insert(self.them.b58(), handle.clone());
            return Some(ConnectionEvent::Stop);
        }

        let Some(conn) = self.conn.take() else {
            self.fail(SwitchError::NotConnected(self.them.b58()));
            return Some(ConnectionEvent::Error);
        };

        match self.ctx.negotiator.select(conn, &codecs).await {
            Ok(crate::negotiator::Selection::Selected { name, stream }) => {
                let factory = {
                    let muxers = self.ctx.muxers.lock().unwrap();
                    muxers.get(&name)
                };
                let Some(factory) = factory else {
                    self.fail(SwitchError::Muxer(format!(
                        "negotiated muxer {name} no longer registered"
                    )));
                    return Some(ConnectionEvent::Error);
                };

                let metered = self.ctx.observer.tap(stream, None, Some(name.clone()));
                let muxer = factory.dialer(metered);
                self.muxer = Some(muxer.clone());

                self.ctx
                    .muxed_conns
                    .lock()
                    .unwrap()
                    .insert(self.them.b58(), handle.clone());
                self.ctx.events.emit(SwitchEvent::PeerMuxEstablished {
                    peer: self.them.id().clone(),
                });
                tracing::debug!(peer = %self.them.b58(), muxer = %name, "muxed connection established");

                spawn_inbound_streams(
                    handle.clone(),
                    muxer,
                    self.ctx.dispatcher(),
                    self.them.clone(),
                );
                Some(ConnectionEvent::Done)
            }
            Ok(crate::negotiator::Selection::Refused { stream }) => {
                tracing::debug!(peer = %self.them.b58(), "no common muxer, keeping connection unmuxed");
                self.conn = Some(stream);
                self.ctx
                    .conns
                    .lock()
                    .unwrap()
                    .insert(self.them.b58(), handle.clone());
                Some(ConnectionEvent::Stop)
            }
            Err(err) => {
                self.fail(SwitchError::maybe_unexpected_end(err));
                Some(ConnectionEvent::Error)
            }
        }
    }

    async fn enter_disconnecting(&mut self) -> Option<ConnectionEvent> {
        // The local PeerInfo is process-global; only the remote's connected
        // marker is cleared.
        self.them.disconnect();

        let b58 = self.them.b58();
        self.ctx.conns.lock().unwrap().remove(&b58);
        self.ctx.muxed_conns.lock().unwrap().remove(&b58);

        if let Some(muxer) = self.muxer.take() {
            if let Err(err) = muxer.close().await {
                if !err.is_benign_shutdown() {
                    tracing::debug!(peer = %b58, error = %err, "muxer close failed");
                }
            }
            // Deliver the close event on the next scheduling tick, after
            // this entry action has returned.
            let events = self.ctx.events.clone();
            let peer = self.them.id().clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                events.emit(SwitchEvent::PeerMuxClosed { peer });
            });
        }

        self.conn = None;
        Some(ConnectionEvent::Done)
    }

    /// Negotiate `protocol` on a stream to the remote.
    async fn shake(&mut self, protocol: &str) -> SwitchResult<SwitchStream> {
        let candidates = vec![protocol.to_string()];

        let stream = if let Some(muxer) = self.muxer.clone() {
            let substream = muxer.open_stream().await?;
            substream.set_peer_info(self.them.clone());
            substream
        } else if let Some(conn) = self.conn.take() {
            // Unmuxed mode: the protocol binds the connection itself.
            conn.set_peer_info(self.them.clone());
            conn
        } else {
            return Err(SwitchError::NotConnected(self.them.b58()));
        };

        match self.ctx.negotiator.select(stream, &candidates).await? {
            crate::negotiator::Selection::Selected { name, stream } => {
                Ok(self.ctx.observer.tap(stream, None, Some(name)))
            }
            crate::negotiator::Selection::Refused { .. } => Err(SwitchError::Negotiation(
                format!("protocol {protocol} refused by {}", self.them.b58()),
            )),
        }
    }
}

/// Dispatch substreams the remote opens on a muxed connection, and tear the
/// connection down once the muxer closes underneath it.
fn spawn_inbound_streams(
    handle: ConnectionHandle,
    muxer: Arc<dyn Muxer>,
    dispatcher: ProtocolDispatcher,
    them: PeerInfo,
) {
    tokio::spawn(async move {
        while let Some(substream) = muxer.next_inbound().await {
            substream.set_peer_info(them.clone());
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(err) = dispatcher.handle(substream).await {
                    tracing::debug!(error = %err, "inbound substream dispatch failed");
                }
            });
        }
        if handle.state().await == ConnectionState::Muxed {
            if let Err(err) = handle.feed(ConnectionEvent::Disconnect).await {
                tracing::debug!(error = %err, "post-close disconnect rejected");
            }
        }
    });
}
