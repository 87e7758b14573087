//! The switch: top-level lifecycle, registries, and connection tables.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crossbar_core::{PeerId, PeerInfo};

use crate::config::SwitchConfig;
use crate::connection::inbound;
use crate::connection::outbound::ConnectionHandle;
use crate::connection::state::{ConnectionEvent, ConnectionState};
use crate::crypto::{Crypto, Protector};
use crate::ctx::{InboundInterceptor, SwitchCtx};
use crate::dialer::{DialOutcome, DialRequest, DialScheduler};
use crate::error::{SwitchError, SwitchResult};
use crate::events::{Bus, SwitchEvent};
use crate::muxing::{MuxerFactory, MuxerRegistry};
use crate::negotiator::{Negotiator, ProtocolMatcher};
use crate::observer::TrafficObserver;
use crate::protocol::{ProtocolHandlerFn, ProtocolTable};
use crate::stream::SwitchStream;
use crate::transport::{Listener, Transport, TransportRegistry};

/// Lifecycle state of the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    /// Not running.
    Stopped,
    /// Binding listeners.
    Starting,
    /// Running.
    Started,
    /// Tearing down connections and listeners.
    Stopping,
}

impl SwitchState {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            SwitchState::Stopped => "stopped",
            SwitchState::Starting => "starting",
            SwitchState::Started => "started",
            SwitchState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One row of [`Switch::connection_snapshot`].
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    /// Remote peer.
    pub peer: PeerId,
    /// Current state of the connection.
    pub state: ConnectionState,
    /// Whether the connection carries a muxer.
    pub muxed: bool,
}

/// Builder assembling a [`Switch`].
pub struct SwitchBuilder {
    us: PeerInfo,
    config: SwitchConfig,
    crypto: Option<Arc<dyn Crypto>>,
    negotiator: Option<Arc<dyn Negotiator>>,
    protector: Option<Arc<dyn Protector>>,
    transports: Vec<(String, Arc<dyn Transport>)>,
    muxers: Vec<Arc<dyn MuxerFactory>>,
    interceptor: Option<InboundInterceptor>,
}

impl SwitchBuilder {
    fn new(us: PeerInfo) -> Self {
        Self {
            us,
            config: SwitchConfig::default(),
            crypto: None,
            negotiator: None,
            protector: None,
            transports: Vec::new(),
            muxers: Vec::new(),
            interceptor: None,
        }
    }

    /// Replace the default configuration.
    pub fn config(mut self, config: SwitchConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the encryption layer (required).
    pub fn crypto(mut self, crypto: Arc<dyn Crypto>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Set the negotiation driver (required).
    pub fn negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Set the private-network protector.
    pub fn protector(mut self, protector: Arc<dyn Protector>) -> Self {
        self.protector = Some(protector);
        self
    }

    /// Register a transport under `tag`.
    pub fn transport(mut self, tag: &str, transport: Arc<dyn Transport>) -> Self {
        self.transports.push((tag.to_string(), transport));
        self
    }

    /// Register a muxer factory.
    pub fn muxer(mut self, factory: Arc<dyn MuxerFactory>) -> Self {
        self.muxers.push(factory);
        self
    }

    /// Route accepted connections to `handler` right after the
    /// private-network envelope, bypassing the upgrade pipeline.
    pub fn inbound_interceptor(mut self, handler: InboundInterceptor) -> Self {
        self.interceptor = Some(handler);
        self
    }

    /// Build the switch.
    pub fn build(self) -> SwitchResult<Switch> {
        let crypto = self
            .crypto
            .ok_or_else(|| SwitchError::Crypto("an encryption layer must be configured".into()))?;
        let negotiator = self.negotiator.ok_or_else(|| {
            SwitchError::Negotiation("a negotiation driver must be configured".into())
        })?;

        let mut transports = TransportRegistry::new();
        for (tag, transport) in self.transports {
            transports.add(&tag, transport);
        }
        let mut muxers = MuxerRegistry::new();
        for factory in self.muxers {
            muxers.add(factory);
        }

        let ctx = Arc::new(SwitchCtx {
            us: self.us,
            config: self.config,
            transports: Mutex::new(transports),
            muxers: Mutex::new(muxers),
            protocols: ProtocolTable::new(),
            crypto,
            protector: self.protector,
            negotiator,
            observer: TrafficObserver::new(),
            events: Bus::new(),
            inbound_interceptor: self.interceptor,
            conns: Mutex::new(HashMap::new()),
            muxed_conns: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            next_inbound_id: AtomicU64::new(1),
        });

        Ok(Switch {
            ctx,
            scheduler: DialScheduler::new(),
            lifecycle: Mutex::new(SwitchState::Stopped),
            listeners: tokio::sync::Mutex::new(Vec::new()),
            accept_tasks: Mutex::new(Vec::new()),
        })
    }
}

/// A peer-to-peer connection switch.
///
/// The switch owns the registries (transports, muxers, protocols) and the
/// connection tables, schedules dials, and runs the upgrade pipeline for
/// accepted sockets.
pub struct Switch {
    ctx: Arc<SwitchCtx>,
    scheduler: DialScheduler,
    lifecycle: Mutex<SwitchState>,
    listeners: tokio::sync::Mutex<Vec<Box<dyn Listener>>>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("local_peer", &self.ctx.us)
            .field("state", &self.state())
            .finish()
    }
}

impl Switch {
    /// Start building a switch for the local peer.
    pub fn builder(us: PeerInfo) -> SwitchBuilder {
        SwitchBuilder::new(us)
    }

    /// The local peer.
    pub fn local_peer(&self) -> PeerInfo {
        self.ctx.us.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SwitchState {
        *self.lifecycle.lock().unwrap()
    }

    /// Receive a copy of every future switch event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SwitchEvent> {
        self.ctx.events.subscribe()
    }

    /// Traffic metering fan-out.
    pub fn observer(&self) -> TrafficObserver {
        self.ctx.observer.clone()
    }

    /// Register a transport under `tag`.
    pub fn add_transport(&self, tag: &str, transport: Arc<dyn Transport>) {
        self.ctx.transports.lock().unwrap().add(tag, transport);
    }

    /// Register a muxer factory.
    pub fn add_muxer(&self, factory: Arc<dyn MuxerFactory>) {
        self.ctx.muxers.lock().unwrap().add(factory);
    }

    /// Register a protocol handler. When `matcher` is given it decides
    /// acceptance of proposed protocol names; otherwise only the exact
    /// string is accepted.
    pub fn handle(&self, protocol: &str, handler: ProtocolHandlerFn, matcher: Option<ProtocolMatcher>) {
        self.ctx.protocols.register(protocol, handler, matcher);
    }

    /// Remove the handler registered for `protocol`.
    pub fn unhandle(&self, protocol: &str) {
        self.ctx.protocols.unregister(protocol);
    }

    /// Bind listeners for every transport that serves one of the local
    /// peer's addresses. Re-entrant `start` on a started switch is a no-op.
    pub async fn start(&self) -> SwitchResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            match *lifecycle {
                SwitchState::Started => return Ok(()),
                SwitchState::Stopped => *lifecycle = SwitchState::Starting,
                state => {
                    return Err(SwitchError::Lifecycle {
                        state: state.name(),
                        op: "start",
                    })
                }
            }
        }

        self.scheduler.reset();

        let tags = {
            let transports = self.ctx.transports.lock().unwrap();
            transports.available(&self.ctx.us)
        };

        let mut bound: Vec<Box<dyn Listener>> = Vec::new();
        let result: SwitchResult<()> = async {
            for tag in &tags {
                let transport = {
                    let transports = self.ctx.transports.lock().unwrap();
                    transports.get(tag)
                };
                let Some(transport) = transport else { continue };

                let (tx, mut rx) = mpsc::channel::<SwitchStream>(16);
                let mut listener = transport.create_listener(tx);
                let addrs = transport.filter(&self.ctx.us.addrs());
                let bound_addrs = listener.listen(&addrs).await?;
                for addr in bound_addrs {
                    self.ctx.us.add_addr(addr);
                }
                tracing::info!(transport = %tag, "listener bound");

                let ctx = self.ctx.clone();
                let task = tokio::spawn(async move {
                    while let Some(stream) = rx.recv().await {
                        let _ = inbound::spawn_accepted(ctx.clone(), stream);
                    }
                });
                self.accept_tasks.lock().unwrap().push(task);
                bound.push(listener);
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.listeners.lock().await.extend(bound);
                *self.lifecycle.lock().unwrap() = SwitchState::Started;
                self.ctx.events.emit(SwitchEvent::Started);
                Ok(())
            }
            Err(err) => {
                for mut listener in bound {
                    let _ = listener.close().await;
                }
                *self.lifecycle.lock().unwrap() = SwitchState::Stopped;
                Err(err)
            }
        }
    }

    /// End every muxer, tear down every connection, and close every
    /// listener.
    pub async fn stop(&self) -> SwitchResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            match *lifecycle {
                SwitchState::Started => *lifecycle = SwitchState::Stopping,
                state => {
                    return Err(SwitchError::Lifecycle {
                        state: state.name(),
                        op: "stop",
                    })
                }
            }
        }

        self.scheduler.abort();

        let mut first_err: Option<SwitchError> = None;

        let muxed: Vec<ConnectionHandle> = {
            let table = self.ctx.muxed_conns.lock().unwrap();
            table.values().cloned().collect()
        };
        for handle in muxed {
            if let Some(muxer) = handle.muxer().await {
                if let Err(err) = muxer.close().await {
                    if !err.is_benign_shutdown() && first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
            let _ = handle.feed(ConnectionEvent::Disconnect).await;
        }

        let plain: Vec<ConnectionHandle> = {
            let table = self.ctx.conns.lock().unwrap();
            table.values().cloned().collect()
        };
        for handle in plain {
            let _ = handle.feed(ConnectionEvent::Disconnect).await;
        }

        let accepted: Vec<_> = {
            let table = self.ctx.inbound.lock().unwrap();
            table.values().cloned().collect()
        };
        for handle in accepted {
            if let Some(muxer) = handle.muxer().await {
                if let Err(err) = muxer.close().await {
                    if !err.is_benign_shutdown() && first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
            let _ = handle.feed(ConnectionEvent::Disconnect).await;
        }

        let mut listeners = self.listeners.lock().await;
        for listener in listeners.iter_mut() {
            if let Err(err) = listener.close().await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        listeners.clear();
        drop(listeners);

        let tasks: Vec<JoinHandle<()>> = self.accept_tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(self.ctx.config.shutdown_grace, task)
                .await
                .is_err()
            {
                tracing::warn!("accept task did not finish within the shutdown grace period");
            }
        }

        *self.lifecycle.lock().unwrap() = SwitchState::Stopped;
        self.ctx.events.emit(SwitchEvent::Stopped);

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Dial `peer` and, when `protocol` is given, open a stream negotiated
    /// to it. Concurrent dials to the same peer share one connection.
    pub async fn dial(
        &self,
        peer: PeerInfo,
        protocol: Option<&str>,
    ) -> SwitchResult<Option<SwitchStream>> {
        match self.dial_request(peer, protocol, false).await? {
            DialOutcome::Stream(stream) => Ok(stream),
            DialOutcome::Connection(_) => Ok(None),
        }
    }

    /// Dial `peer` and surface the connection handle instead of a stream.
    /// Protocol streams are opened afterwards with
    /// [`ConnectionHandle::new_stream`].
    pub async fn dial_fsm(&self, peer: PeerInfo) -> SwitchResult<ConnectionHandle> {
        match self.dial_request(peer, None, true).await? {
            DialOutcome::Connection(handle) => Ok(handle),
            DialOutcome::Stream(_) => Err(SwitchError::Aborted),
        }
    }

    async fn dial_request(
        &self,
        peer: PeerInfo,
        protocol: Option<&str>,
        use_fsm: bool,
    ) -> SwitchResult<DialOutcome> {
        {
            let lifecycle = self.lifecycle.lock().unwrap();
            if *lifecycle != SwitchState::Started {
                return Err(SwitchError::Lifecycle {
                    state: lifecycle.name(),
                    op: "dial",
                });
            }
        }

        if peer.id() == self.ctx.us.id() {
            let err = SwitchError::DialSelf;
            self.ctx.events.emit(SwitchEvent::Error {
                code: err.code(),
                message: err.to_string(),
            });
            return Err(err);
        }

        let (tx, rx) = oneshot::channel();
        self.scheduler.dial(
            &self.ctx,
            DialRequest {
                peer,
                protocol: protocol.map(str::to_string),
                use_fsm,
                reply: tx,
            },
        );
        rx.await.map_err(|_| SwitchError::Aborted)?
    }

    /// Tear down the connection to `peer`, if any.
    pub async fn hang_up(&self, peer: &PeerId) -> SwitchResult<()> {
        let b58 = peer.to_base58();
        if let Some(handle) = self.ctx.muxed_conn(&b58) {
            handle.feed(ConnectionEvent::Disconnect).await?;
        }
        let plain = {
            let table = self.ctx.conns.lock().unwrap();
            table.get(&b58).cloned()
        };
        if let Some(handle) = plain {
            let _ = handle.feed(ConnectionEvent::Disconnect).await;
        }
        Ok(())
    }

    /// Cancel every pending dial, then accept new ones again.
    pub fn abort_pending_dials(&self) {
        self.scheduler.abort();
        self.scheduler.reset();
    }

    /// The muxed connection to `peer`, if one is registered.
    pub fn muxed_connection(&self, peer: &PeerId) -> Option<ConnectionHandle> {
        self.ctx.muxed_conn(&peer.to_base58())
    }

    /// The encrypted-but-unmuxed connection to `peer`, if one is stored.
    pub fn connection(&self, peer: &PeerId) -> Option<ConnectionHandle> {
        let table = self.ctx.conns.lock().unwrap();
        table.get(&peer.to_base58()).cloned()
    }

    /// Per-connection state rows for reporting.
    pub async fn connection_snapshot(&self) -> Vec<ConnectionSnapshot> {
        let handles: Vec<ConnectionHandle> = {
            let muxed = self.ctx.muxed_conns.lock().unwrap();
            let plain = self.ctx.conns.lock().unwrap();
            muxed.values().chain(plain.values()).cloned().collect()
        };
        let mut rows = Vec::with_capacity(handles.len());
        for handle in handles {
            let state = handle.state().await;
            rows.push(ConnectionSnapshot {
                peer: handle.peer().id().clone(),
                state,
                muxed: state == ConnectionState::Muxed,
            });
        }
        rows
    }
}
