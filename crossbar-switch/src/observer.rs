//! Traffic metering.
//!
//! Every byte moved through a tapped stream is tagged with the transport,
//! the negotiated protocol, and the remote peer, then fanned out to
//! subscribers and folded into per-peer totals. The peer may be unknown when
//! a tap is created; it is resolved lazily through the stream's shared peer
//! slot once the handshake learns it.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crossbar_core::PeerId;

use crate::stream::{PeerSlot, StreamIo, SwitchStream};

/// Direction of a metered transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from the remote.
    Inbound,
    /// Bytes written to the remote.
    Outbound,
}

/// One metered transfer.
#[derive(Debug, Clone)]
pub struct TrafficSample {
    /// Transport tag the bytes moved over, when the tap sits on a raw socket.
    pub transport: Option<String>,
    /// Negotiated protocol, when the tap sits above negotiation.
    pub protocol: Option<String>,
    /// Remote peer, when already resolved.
    pub peer: Option<PeerId>,
    /// Transfer direction.
    pub direction: Direction,
    /// Number of bytes moved.
    pub bytes: u64,
}

/// Per-peer byte totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerTraffic {
    /// Bytes written to the peer.
    pub bytes_sent: u64,
    /// Bytes read from the peer.
    pub bytes_recv: u64,
}

/// Fan-out point for traffic samples.
#[derive(Clone, Default)]
pub struct TrafficObserver {
    inner: Arc<ObserverInner>,
}

#[derive(Default)]
struct ObserverInner {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TrafficSample>>>,
    totals: Mutex<HashMap<String, PeerTraffic>>,
}

impl TrafficObserver {
    /// Create an observer with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive a copy of every future traffic sample.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TrafficSample> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Byte totals recorded for a peer so far.
    pub fn totals(&self, peer: &PeerId) -> PeerTraffic {
        self.inner
            .totals
            .lock()
            .unwrap()
            .get(&peer.to_base58())
            .copied()
            .unwrap_or_default()
    }

    /// Wrap a stream so every byte is reported through this observer.
    pub fn tap(
        &self,
        stream: SwitchStream,
        transport: Option<String>,
        protocol: Option<String>,
    ) -> SwitchStream {
        let (io, slot) = stream.into_parts();
        let metered = MeteredIo {
            inner: io,
            observer: self.clone(),
            transport,
            protocol,
            peer: slot.clone(),
        };
        SwitchStream::from_parts(Box::new(metered), slot)
    }

    fn record(&self, sample: TrafficSample) {
        if let Some(peer) = &sample.peer {
            let mut totals = self.inner.totals.lock().unwrap();
            let entry = totals.entry(peer.to_base58()).or_default();
            match sample.direction {
                Direction::Inbound => entry.bytes_recv += sample.bytes,
                Direction::Outbound => entry.bytes_sent += sample.bytes,
            }
        }
        let mut subs = self.inner.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(sample.clone()).is_ok());
    }
}

struct MeteredIo {
    inner: Box<dyn StreamIo>,
    observer: TrafficObserver,
    transport: Option<String>,
    protocol: Option<String>,
    peer: PeerSlot,
}

impl MeteredIo {
    fn report(&self, direction: Direction, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.observer.record(TrafficSample {
            transport: self.transport.clone(),
            protocol: self.protocol.clone(),
            peer: self.peer.get().map(|p| p.id().clone()),
            direction,
            bytes,
        });
    }
}

impl AsyncRead for MeteredIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let delta = (buf.filled().len() - before) as u64;
                this.report(Direction::Inbound, delta);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for MeteredIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.report(Direction::Outbound, n as u64);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
