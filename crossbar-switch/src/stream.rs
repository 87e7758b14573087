//! The stream type flowing through the upgrade pipeline.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crossbar_core::PeerInfo;

/// Object-safe alias for the byte streams the switch moves around.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// Shared slot holding the remote peer of a stream once it is known.
///
/// The slot is cloned into every metering tap layered onto the stream, so a
/// tap created before the handshake resolves the peer lazily. The first
/// write wins; later calls are ignored.
#[derive(Clone, Default)]
pub struct PeerSlot {
    inner: Arc<Mutex<Option<PeerInfo>>>,
}

impl PeerSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the slot. A second call is a no-op.
    pub fn set(&self, info: PeerInfo) {
        let mut slot = self.inner.lock().unwrap();
        if slot.is_none() {
            *slot = Some(info);
        }
    }

    /// The peer, if it has been resolved.
    pub fn get(&self) -> Option<PeerInfo> {
        self.inner.lock().unwrap().clone()
    }
}

/// A bidirectional byte stream at some layer of the upgrade pipeline.
///
/// Raw transport sockets, protected streams, encrypted streams, and muxed
/// substreams all travel as `SwitchStream`; re-wrapping (for metering or by
/// an upgrade layer) keeps the same peer slot so the remote identity, once
/// learned, is visible at every layer.
pub struct SwitchStream {
    io: Box<dyn StreamIo>,
    peer: PeerSlot,
}

impl SwitchStream {
    /// Wrap a transport-produced byte stream.
    pub fn new(io: impl StreamIo + 'static) -> Self {
        Self {
            io: Box::new(io),
            peer: PeerSlot::new(),
        }
    }

    /// Wrap a byte stream whose remote peer is already known.
    pub fn with_peer(io: impl StreamIo + 'static, info: PeerInfo) -> Self {
        let stream = Self::new(io);
        stream.set_peer_info(info);
        stream
    }

    /// Rebuild a stream from a replacement io and an existing slot.
    pub fn from_parts(io: Box<dyn StreamIo>, peer: PeerSlot) -> Self {
        Self { io, peer }
    }

    /// Split into the raw io and the peer slot.
    pub fn into_parts(self) -> (Box<dyn StreamIo>, PeerSlot) {
        (self.io, self.peer)
    }

    /// Record the remote peer of this stream. First write wins.
    pub fn set_peer_info(&self, info: PeerInfo) {
        self.peer.set(info);
    }

    /// The remote peer, if resolved.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.peer.get()
    }

    /// Handle on the shared peer slot.
    pub fn peer_slot(&self) -> PeerSlot {
        self.peer.clone()
    }
}

impl fmt::Debug for SwitchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchStream")
            .field("peer", &self.peer.get().map(|p| p.b58()))
            .finish()
    }
}

impl AsyncRead for SwitchStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for SwitchStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}
