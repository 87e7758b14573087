//! Inbound connections.
//!
//! Accepted sockets run the mirror image of the outbound pipeline: optional
//! private-network protection, a listener-side encryption handshake that
//! learns the remote identity, then a combined muxer/protocol negotiation
//! handed to the protocol dispatcher. There is no abort or errored branch;
//! every failure takes the `disconnect` edge.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crossbar_core::PeerInfo;

use crate::connection::state::{inbound_step, ConnectionEvent, ConnectionState};
use crate::ctx::SwitchCtx;
use crate::error::{SwitchError, SwitchResult};
use crate::events::{Bus, ConnectionNotice, SwitchEvent};
use crate::muxing::Muxer;
use crate::negotiator::{exact_matcher, ProtocolMatcher};
use crate::stream::SwitchStream;

/// Cloneable handle to one accepted connection, tracked by the switch for
/// shutdown draining.
#[derive(Clone)]
pub(crate) struct InboundHandle {
    inner: Arc<Mutex<InboundConnection>>,
}

impl InboundHandle {
    fn new(ctx: Arc<SwitchCtx>, raw: SwitchStream, id: u64) -> Self {
        let machine = InboundConnection {
            ctx,
            id,
            state: ConnectionState::Dialed,
            conn: Some(raw),
            them: None,
            muxer: None,
            notices: Bus::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(machine)),
        }
    }

    /// Feed one lifecycle event, running entry actions to completion.
    pub(crate) async fn feed(&self, event: ConnectionEvent) -> SwitchResult<()> {
        let mut guard = self.inner.lock().await;
        guard.drive(self, event).await
    }

    /// Current state.
    pub(crate) async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// The muxer, once negotiated.
    pub(crate) async fn muxer(&self) -> Option<Arc<dyn Muxer>> {
        self.inner.lock().await.muxer.clone()
    }

    async fn take_conn(&self) -> Option<SwitchStream> {
        self.inner.lock().await.conn.take()
    }

    async fn set_muxer(&self, muxer: Arc<dyn Muxer>) {
        self.inner.lock().await.muxer = Some(muxer);
    }
}

/// The inbound upgrade machine.
struct InboundConnection {
    ctx: Arc<SwitchCtx>,
    id: u64,
    state: ConnectionState,
    conn: Option<SwitchStream>,
    them: Option<PeerInfo>,
    muxer: Option<Arc<dyn Muxer>>,
    notices: Bus<ConnectionNotice>,
}

impl InboundConnection {
    async fn drive(&mut self, handle: &InboundHandle, event: ConnectionEvent) -> SwitchResult<()> {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let Some(to) = inbound_step(self.state, event) else {
                tracing::warn!(
                    conn = self.id,
                    state = %self.state,
                    event = %event,
                    "rejected connection event"
                );
                return Err(SwitchError::InvalidTransition {
                    state: self.state.name(),
                    event: event.name(),
                });
            };
            tracing::debug!(conn = self.id, from = %self.state, to = %to, "connection state transition");
            self.state = to;
            next = self.enter(handle, to).await;
        }
        Ok(())
    }

    async fn enter(
        &mut self,
        handle: &InboundHandle,
        state: ConnectionState,
    ) -> Option<ConnectionEvent> {
        match state {
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
            ConnectionState::Upgrading => self.enter_upgrading(handle),
            ConnectionState::Muxed => {
                self.notices.emit(ConnectionNotice::Muxed);
                None
            }
            ConnectionState::Disconnecting => self.enter_disconnecting().await,
            ConnectionState::Disconnected => {
                self.ctx.inbound.lock().unwrap().remove(&self.id);
                self.notices.emit(ConnectionNotice::Closed);
                None
            }
            _ => None,
        }
    }

    fn fail(&mut self, err: SwitchError) {
        tracing::debug!(conn = self.id, error = %err, "inbound upgrade failed");
        self.notices.emit(ConnectionNotice::Error {
            code: err.code(),
            message: err.to_string(),
        });
    }

    async fn enter_privatizing(&mut self) -> Option<ConnectionEvent> {
        let Some(protector) = self.ctx.protector.clone() else {
            self.fail(SwitchError::Protector("no protector configured".to_string()));
            return Some(ConnectionEvent::Disconnect);
        };
        let Some(conn) = self.conn.take() else {
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
            return Some(ConnectionEvent::Disconnect);
        };

        let crypto = self.ctx.crypto.clone();
        let tag = crypto.tag().to_string();
        let result = async {
            let (name, stream) = self
                .ctx
                .negotiator
                .listen(conn, exact_matcher(&tag))
                .await?;
            let metered = self.ctx.observer.tap(stream, None, Some(name));
            crypto
                .encrypt(self.ctx.us.id().clone(), metered, None)
                .await
        }
        .await;

        match result {
            Ok(secured) => match secured.peer_info() {
                Some(them) => {
                    self.them = Some(them);
                    self.conn = Some(secured);
                    Some(ConnectionEvent::Done)
                }
                None => {
                    self.fail(SwitchError::Crypto(
                        "handshake did not resolve the remote identity".to_string(),
                    ));
                    Some(ConnectionEvent::Disconnect)
                }
            },
            Err(err) => {
                self.fail(SwitchError::maybe_unexpected_end(err));
                Some(ConnectionEvent::Disconnect)
            }
        }
    }

    /// Hand the connection to the combined muxer/protocol negotiation and
    /// move on; listeners accept whatever the remote selects.
    fn enter_upgrading(&mut self, handle: &InboundHandle) -> Option<ConnectionEvent> {
        let Some(conn) = self.conn.take() else {
            return Some(ConnectionEvent::Disconnect);
        };
        let them = self.them.clone();
        tokio::spawn(negotiate_upgrade(
            self.ctx.clone(),
            handle.clone(),
            conn,
            them,
        ));
        Some(ConnectionEvent::Done)
    }

    async fn enter_disconnecting(&mut self) -> Option<ConnectionEvent> {
        if let Some(them) = &self.them {
            them.disconnect();
        }

        if let Some(muxer) = self.muxer.take() {
            if let Err(err) = muxer.close().await {
                if !err.is_benign_shutdown() {
                    tracing::debug!(conn = self.id, error = %err, "muxer close failed");
                }
            }
            if let Some(them) = &self.them {
                let events = self.ctx.events.clone();
                let peer = them.id().clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    events.emit(SwitchEvent::PeerMuxClosed { peer });
                });
            }
        }

        self.conn = None;
        Some(ConnectionEvent::Done)
    }
}

/// Listener side of the upgrade: answer the remote's selection with the
/// registered muxer codecs and protocols. A muxer selection starts the
/// substream dispatch loop; a protocol selection binds the connection to
/// that protocol directly (the remote chose not to mux).
async fn negotiate_upgrade(
    ctx: Arc<SwitchCtx>,
    handle: InboundHandle,
    conn: SwitchStream,
    them: Option<PeerInfo>,
) {
    let codecs = {
        let muxers = ctx.muxers.lock().unwrap();
        muxers.codecs()
    };
    let protocols = ctx.protocols.accept_fn();
    let accept: ProtocolMatcher = {
        let codecs = codecs.clone();
        Arc::new(move |proposed| codecs.iter().any(|c| c == proposed) || protocols(proposed))
    };

    match ctx.negotiator.listen(conn, accept).await {
        Ok((selected, stream)) => {
            let factory = {
                let muxers = ctx.muxers.lock().unwrap();
                muxers.get(&selected)
            };
            if let Some(factory) = factory {
                let metered = ctx.observer.tap(stream, None, Some(selected.clone()));
                let muxer = factory.listener(metered);
                handle.set_muxer(muxer.clone()).await;
                tracing::debug!(muxer = %selected, "inbound connection muxed");

                let dispatcher = ctx.dispatcher();
                while let Some(substream) = muxer.next_inbound().await {
                    if let Some(them) = &them {
                        substream.set_peer_info(them.clone());
                    }
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(err) = dispatcher.handle(substream).await {
                            tracing::debug!(error = %err, "inbound substream dispatch failed");
                        }
                    });
                }
                if handle.state().await == ConnectionState::Muxed {
                    let _ = handle.feed(ConnectionEvent::Disconnect).await;
                }
            } else {
                // The remote negotiated a protocol directly on the
                // connection; one protocol per unmuxed connection.
                if let Some(them) = &them {
                    stream.set_peer_info(them.clone());
                }
                match ctx.protocols.lookup(&selected) {
                    Some(handler) => {
                        let metered = ctx.observer.tap(stream, None, Some(selected.clone()));
                        handler(selected, metered);
                    }
                    None => {
                        tracing::debug!(protocol = %selected, "no handler for negotiated protocol");
                        let _ = handle.feed(ConnectionEvent::Disconnect).await;
                    }
                }
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, "inbound upgrade negotiation failed");
            if handle.state().await == ConnectionState::Muxed {
                let _ = handle.feed(ConnectionEvent::Disconnect).await;
            }
        }
    }
}

/// Run the inbound pipeline for an accepted stream.
///
/// The task registers itself with the switch for shutdown draining and
/// removes itself once the connection reaches its terminal state.
pub(crate) fn spawn_accepted(ctx: Arc<SwitchCtx>, raw: SwitchStream) -> JoinHandle<()> {
    let id = ctx.next_inbound_id.fetch_add(1, Ordering::Relaxed);
    let handle = InboundHandle::new(ctx.clone(), raw, id);
    ctx.inbound.lock().unwrap().insert(id, handle.clone());

    tokio::spawn(async move {
        // Protect first when a protector is configured.
        if ctx.protector.is_some() {
            if handle.feed(ConnectionEvent::Privatize).await.is_err()
                || handle.state().await != ConnectionState::Privatized
            {
                return;
            }
            // A caller-supplied interceptor takes the protected stream and
            // bypasses the rest of the pipeline.
            if let Some(interceptor) = &ctx.inbound_interceptor {
                if let Some(stream) = handle.take_conn().await {
                    ctx.inbound.lock().unwrap().remove(&id);
                    interceptor(stream);
                }
                return;
            }
        } else if let Some(interceptor) = &ctx.inbound_interceptor {
            if let Some(stream) = handle.take_conn().await {
                ctx.inbound.lock().unwrap().remove(&id);
                interceptor(stream);
            }
            return;
        }

        if handle.feed(ConnectionEvent::Encrypt).await.is_err()
            || handle.state().await != ConnectionState::Encrypted
        {
            return;
        }
        let _ = handle.feed(ConnectionEvent::Upgrade).await;
    })
}
