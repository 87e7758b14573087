//! Dial scheduling.
//!
//! Dial requests flow through a global FIFO intake into per-peer queues. At
//! most one upgrade pipeline runs per peer, so concurrent dials to the same
//! peer coalesce onto one transport dial and one muxer; a hard cap bounds
//! how many per-peer queues dial at once. Every request carries a `oneshot`
//! reply, so each caller hears back exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crossbar_core::PeerInfo;

use crate::connection::outbound::ConnectionHandle;
use crate::connection::state::{outbound_step, ConnectionEvent, ConnectionState};
use crate::ctx::SwitchCtx;
use crate::error::{SwitchError, SwitchResult};
use crate::stream::SwitchStream;

/// What a dial request resolves to.
pub(crate) enum DialOutcome {
    /// The connection is up; carries a protocol stream when one was asked
    /// for.
    Stream(Option<SwitchStream>),
    /// The connection handle, for `dial_fsm` callers.
    Connection(ConnectionHandle),
}

/// One queued dial.
pub(crate) struct DialRequest {
    pub peer: PeerInfo,
    pub protocol: Option<String>,
    pub use_fsm: bool,
    pub reply: oneshot::Sender<SwitchResult<DialOutcome>>,
}

/// Pending handshakes for one remote peer.
struct PeerQueue {
    peer: PeerInfo,
    pending: Mutex<VecDeque<DialRequest>>,
}

struct SchedState {
    intake: VecDeque<DialRequest>,
    dials: usize,
    queues: HashMap<String, QueueEntry>,
}

struct QueueEntry {
    queue: Arc<PeerQueue>,
    running: bool,
}

struct SchedInner {
    state: Mutex<SchedState>,
    token: Mutex<CancellationToken>,
}

/// Global dial manager.
#[derive(Clone)]
pub(crate) struct DialScheduler {
    inner: Arc<SchedInner>,
}

impl DialScheduler {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(SchedInner {
                state: Mutex::new(SchedState {
                    intake: VecDeque::new(),
                    dials: 0,
                    queues: HashMap::new(),
                }),
                token: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Enqueue a request and pump the intake.
    pub(crate) fn dial(&self, ctx: &Arc<SwitchCtx>, request: DialRequest) {
        self.inner.state.lock().unwrap().intake.push_back(request);
        self.run(ctx);
    }

    /// Cancel every pending request and mark in-flight pipelines for
    /// teardown.
    pub(crate) fn abort(&self) {
        self.inner.token.lock().unwrap().cancel();

        let mut cancelled = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            cancelled.extend(state.intake.drain(..));
            for entry in state.queues.values() {
                let mut pending = entry.queue.pending.lock().unwrap();
                cancelled.extend(pending.drain(..));
            }
        }
        for request in cancelled {
            let _ = request.reply.send(Err(SwitchError::Aborted));
        }
    }

    /// Arm a fresh cancellation token after an abort.
    pub(crate) fn reset(&self) {
        *self.inner.token.lock().unwrap() = CancellationToken::new();
    }

    fn token(&self) -> CancellationToken {
        self.inner.token.lock().unwrap().clone()
    }

    /// Drain the intake into per-peer queues while below the parallel-dial
    /// cap, starting idle queues.
    fn run(&self, ctx: &Arc<SwitchCtx>) {
        let cap = ctx.config.max_parallel_dials;
        let mut started = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            while state.dials < cap {
                let Some(request) = state.intake.pop_front() else {
                    break;
                };
                let b58 = request.peer.b58();
                let entry = state.queues.entry(b58.clone()).or_insert_with(|| QueueEntry {
                    queue: Arc::new(PeerQueue {
                        peer: request.peer.clone(),
                        pending: Mutex::new(VecDeque::new()),
                    }),
                    running: false,
                });
                entry.queue.pending.lock().unwrap().push_back(request);
                if !entry.running {
                    entry.running = true;
                    let queue = entry.queue.clone();
                    state.dials += 1;
                    started.push((b58, queue));
                }
            }
        }
        for (b58, queue) in started {
            let scheduler = self.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                scheduler.process(ctx, b58, queue).await;
            });
        }
    }

    /// Run one per-peer queue: reuse or build the connection, then replay
    /// pending handshakes in submission order.
    async fn process(&self, ctx: Arc<SwitchCtx>, b58: String, queue: Arc<PeerQueue>) {
        loop {
            let token = self.token();
            let established = if let Some(handle) = ctx.muxed_conn(&b58) {
                Ok(handle)
            } else if token.is_cancelled() {
                Err(SwitchError::Aborted)
            } else {
                self.establish(&ctx, &queue.peer, &token).await
            };

            loop {
                let Some(request) = queue.pending.lock().unwrap().pop_front() else {
                    break;
                };
                let outcome = match &established {
                    Ok(handle) => {
                        if request.use_fsm {
                            Ok(DialOutcome::Connection(handle.clone()))
                        } else {
                            match &request.protocol {
                                None => Ok(DialOutcome::Stream(None)),
                                Some(protocol) => handle
                                    .new_stream(protocol)
                                    .await
                                    .map(|s| DialOutcome::Stream(Some(s))),
                            }
                        }
                    }
                    Err(err) => Err(err.clone()),
                };
                let _ = request.reply.send(outcome);
            }

            let mut state = self.inner.state.lock().unwrap();
            if queue.pending.lock().unwrap().is_empty() {
                state.queues.remove(&b58);
                state.dials = state.dials.saturating_sub(1);
                drop(state);
                // Freeing a slot may unblock queued peers.
                self.run(&ctx);
                return;
            }
            // More requests arrived while draining; go around again.
        }
    }

    /// Drive a fresh outbound machine through the upgrade pipeline.
    async fn establish(
        &self,
        ctx: &Arc<SwitchCtx>,
        peer: &PeerInfo,
        token: &CancellationToken,
    ) -> SwitchResult<ConnectionHandle> {
        let handle = ConnectionHandle::new(ctx.clone(), peer.clone());
        handle.feed(ConnectionEvent::Dial).await?;

        loop {
            let state = handle.state().await;

            if token.is_cancelled() && outbound_step(state, ConnectionEvent::Abort).is_some() {
                let _ = handle.feed(ConnectionEvent::Abort).await;
                return Err(SwitchError::Aborted);
            }

            match state {
                ConnectionState::Dialed => {
                    let event = if ctx.protector.is_some() {
                        ConnectionEvent::Privatize
                    } else {
                        ConnectionEvent::Encrypt
                    };
                    handle.feed(event).await?;
                }
                ConnectionState::Privatized => {
                    handle.feed(ConnectionEvent::Encrypt).await?;
                }
                ConnectionState::Encrypted => {
                    handle.feed(ConnectionEvent::Upgrade).await?;
                }
                ConnectionState::Muxed | ConnectionState::Connected => {
                    if token.is_cancelled() {
                        // Cancelled mid-upgrade in a state without an abort
                        // edge; the completed pipeline is torn down instead.
                        let _ = handle.feed(ConnectionEvent::Disconnect).await;
                        return Err(SwitchError::Aborted);
                    }
                    return Ok(handle);
                }
                ConnectionState::Disconnected | ConnectionState::Aborted => {
                    return Err(handle
                        .last_error()
                        .await
                        .unwrap_or_else(|| SwitchError::NotConnected(peer.b58())));
                }
                other => {
                    tracing::warn!(peer = %peer.b58(), state = %other, "pipeline settled in unexpected state");
                    return Err(SwitchError::NotConnected(peer.b58()));
                }
            }
        }
    }
}
