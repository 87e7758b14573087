//! Shared mock stack for the acceptance tests.
//!
//! The hub wires switches together through in-memory duplex pipes; the
//! crypto exchanges identities in plaintext; the negotiator speaks a
//! line-oriented propose/ok/na protocol; the muxer frames substreams with a
//! length prefix.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crossbar_core::{Multiaddr, PeerId, PeerInfo};
use crossbar_switch::{
    Crypto, Listener, Muxer, MuxerFactory, Negotiator, Protector, ProtocolMatcher, Selection,
    SwitchError, SwitchResult, SwitchStream, Transport,
};

/// The crypto tag the mock stack negotiates.
pub const CRYPTO_TAG: &str = "/plain/1.0.0";

/// The muxer codec the mock stack negotiates.
pub const MUXER_CODEC: &str = "/frame/1.0.0";

/// Make a peer id from a short seed.
pub fn peer_id(seed: u8) -> PeerId {
    PeerId::from_bytes(vec![seed; 8]).unwrap()
}

/// Make a peer info with the given addresses.
pub fn peer_info(seed: u8, addrs: &[&str]) -> PeerInfo {
    let info = PeerInfo::new(peer_id(seed));
    for addr in addrs {
        info.add_addr(addr.parse().unwrap());
    }
    info
}

// ---------------------------------------------------------------------------
// In-memory transport

/// Address book connecting dialers to listeners through duplex pipes.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HashMap<String, mpsc::Sender<SwitchStream>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_listener(&self, addr: &str) -> bool {
        self.inner.lock().unwrap().contains_key(addr)
    }

    fn register(&self, addr: String, tx: mpsc::Sender<SwitchStream>) {
        self.inner.lock().unwrap().insert(addr, tx);
    }

    fn unregister(&self, addr: &str) {
        self.inner.lock().unwrap().remove(addr);
    }

    async fn connect(&self, addr: &str) -> SwitchResult<SwitchStream> {
        let tx = self
            .inner
            .lock()
            .unwrap()
            .get(addr)
            .cloned()
            .ok_or_else(|| SwitchError::Io(format!("connection refused: {addr}")))?;
        let (local, remote) = tokio::io::duplex(64 * 1024);
        tx.send(SwitchStream::new(remote))
            .await
            .map_err(|_| SwitchError::Io(format!("listener gone: {addr}")))?;
        Ok(SwitchStream::new(local))
    }
}

/// Transport dialing hub addresses whose tag matches.
pub struct MemTransport {
    tag: String,
    hub: MemoryHub,
    fail: AtomicBool,
    hang: AtomicBool,
    pub dials: AtomicUsize,
}

impl MemTransport {
    pub fn new(tag: &str, hub: MemoryHub) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            hub,
            fail: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
        })
    }

    /// Every dial fails with a refused error.
    pub fn failing(tag: &str, hub: MemoryHub) -> Arc<Self> {
        let t = Self::new(tag, hub);
        t.fail.store(true, Ordering::SeqCst);
        t
    }

    /// Every dial blocks forever.
    pub fn hanging(tag: &str, hub: MemoryHub) -> Arc<Self> {
        let t = Self::new(tag, hub);
        t.hang.store(true, Ordering::SeqCst);
        t
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn dial(&self, peer: &PeerInfo) -> SwitchResult<SwitchStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SwitchError::Io("connection refused".to_string()));
        }
        let mut last = SwitchError::Io("no matching address".to_string());
        for addr in self.filter(&peer.addrs()) {
            match self.hub.connect(&addr.to_string()).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        addrs
            .iter()
            .filter(|a| a.transport_tag() == self.tag)
            .cloned()
            .collect()
    }

    fn create_listener(&self, incoming: mpsc::Sender<SwitchStream>) -> Box<dyn Listener> {
        Box::new(MemListener {
            hub: self.hub.clone(),
            incoming: Some(incoming),
            bound: Vec::new(),
        })
    }
}

struct MemListener {
    hub: MemoryHub,
    incoming: Option<mpsc::Sender<SwitchStream>>,
    bound: Vec<String>,
}

#[async_trait]
impl Listener for MemListener {
    async fn listen(&mut self, addrs: &[Multiaddr]) -> SwitchResult<Vec<Multiaddr>> {
        let tx = self
            .incoming
            .clone()
            .ok_or_else(|| SwitchError::Io("listener closed".to_string()))?;
        for addr in addrs {
            self.hub.register(addr.to_string(), tx.clone());
            self.bound.push(addr.to_string());
        }
        Ok(addrs.to_vec())
    }

    async fn close(&mut self) -> SwitchResult<()> {
        for addr in &self.bound {
            self.hub.unregister(addr);
        }
        self.bound.clear();
        self.incoming = None;
        Ok(())
    }
}

/// Relay transport bridging circuit addresses to a fixed hub address.
pub struct CircuitTransport {
    hub: MemoryHub,
    bridge: String,
    pub dials: AtomicUsize,
}

impl CircuitTransport {
    pub fn new(hub: MemoryHub, bridge: &str) -> Arc<Self> {
        Arc::new(Self {
            hub,
            bridge: bridge.to_string(),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for CircuitTransport {
    async fn dial(&self, peer: &PeerInfo) -> SwitchResult<SwitchStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.filter(&peer.addrs()).is_empty() {
            return Err(SwitchError::Io("no circuit address".to_string()));
        }
        self.hub.connect(&self.bridge).await
    }

    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        addrs.iter().filter(|a| a.is_circuit()).cloned().collect()
    }

    fn create_listener(&self, _incoming: mpsc::Sender<SwitchStream>) -> Box<dyn Listener> {
        Box::new(NullListener)
    }
}

struct NullListener;

#[async_trait]
impl Listener for NullListener {
    async fn listen(&mut self, _addrs: &[Multiaddr]) -> SwitchResult<Vec<Multiaddr>> {
        Ok(Vec::new())
    }

    async fn close(&mut self) -> SwitchResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Line-oriented negotiator

/// Propose/ok/na negotiation, one name per line.
pub struct LineNegotiator;

async fn write_line(stream: &mut SwitchStream, line: &str) -> SwitchResult<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    Ok(())
}

async fn read_line(stream: &mut SwitchStream) -> SwitchResult<String> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 1024 {
            return Err(SwitchError::Negotiation("line too long".to_string()));
        }
    }
    String::from_utf8(line).map_err(|_| SwitchError::Negotiation("invalid utf-8".to_string()))
}

#[async_trait]
impl Negotiator for LineNegotiator {
    async fn select(
        &self,
        mut stream: SwitchStream,
        candidates: &[String],
    ) -> SwitchResult<Selection> {
        for candidate in candidates {
            write_line(&mut stream, candidate).await?;
            match read_line(&mut stream).await?.as_str() {
                "ok" => {
                    return Ok(Selection::Selected {
                        name: candidate.clone(),
                        stream,
                    })
                }
                "na" => continue,
                other => {
                    return Err(SwitchError::Negotiation(format!(
                        "unexpected reply: {other}"
                    )))
                }
            }
        }
        Ok(Selection::Refused { stream })
    }

    async fn listen(
        &self,
        mut stream: SwitchStream,
        accept: ProtocolMatcher,
    ) -> SwitchResult<(String, SwitchStream)> {
        loop {
            let proposal = read_line(&mut stream).await?;
            if accept(&proposal) {
                write_line(&mut stream, "ok").await?;
                return Ok((proposal, stream));
            }
            write_line(&mut stream, "na").await?;
        }
    }
}

// ---------------------------------------------------------------------------
// Pass-through protector

/// Protector that accepts every stream unchanged, enough to exercise the
/// privatize leg of the pipeline.
pub struct PassProtector;

#[async_trait]
impl Protector for PassProtector {
    async fn protect(&self, stream: SwitchStream) -> SwitchResult<SwitchStream> {
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Identity-exchange crypto

/// Plaintext "encryption" exchanging peer identities, enough to drive the
/// pipeline's identity bookkeeping.
pub struct IdCrypto;

#[async_trait]
impl Crypto for IdCrypto {
    fn tag(&self) -> &str {
        CRYPTO_TAG
    }

    async fn encrypt(
        &self,
        local: PeerId,
        mut stream: SwitchStream,
        remote: Option<PeerId>,
    ) -> SwitchResult<SwitchStream> {
        let bytes = local.as_bytes();
        stream.write_all(&[bytes.len() as u8]).await?;
        stream.write_all(bytes).await?;
        stream.flush().await?;

        let mut len = [0u8; 1];
        stream.read_exact(&mut len).await?;
        let mut buf = vec![0u8; len[0] as usize];
        stream.read_exact(&mut buf).await?;
        let their_id =
            PeerId::from_bytes(buf).map_err(|e| SwitchError::Crypto(e.to_string()))?;

        match remote {
            Some(expected) => {
                if expected != their_id {
                    return Err(SwitchError::Crypto("peer identity mismatch".to_string()));
                }
            }
            None => {
                // Listener mode resolves the remote identity.
                stream.set_peer_info(PeerInfo::new(their_id));
            }
        }
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Frame muxer

const FLAG_OPEN: u8 = 0;
const FLAG_DATA: u8 = 1;
const FLAG_CLOSE: u8 = 2;
const FLAG_GOAWAY: u8 = 3;

enum Frame {
    Open(u32),
    Data(u32, Vec<u8>),
    Close(u32),
    GoAway,
}

/// Factory counting instantiations, negotiated as `/frame/1.0.0`.
pub struct FrameMuxerFactory {
    pub dialers: AtomicUsize,
    pub listeners: AtomicUsize,
}

impl FrameMuxerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dialers: AtomicUsize::new(0),
            listeners: AtomicUsize::new(0),
        })
    }

    pub fn dialer_count(&self) -> usize {
        self.dialers.load(Ordering::SeqCst)
    }
}

impl MuxerFactory for FrameMuxerFactory {
    fn multicodec(&self) -> &str {
        MUXER_CODEC
    }

    fn dialer(&self, stream: SwitchStream) -> Arc<dyn Muxer> {
        self.dialers.fetch_add(1, Ordering::SeqCst);
        FrameMuxer::start(stream, true)
    }

    fn listener(&self, stream: SwitchStream) -> Arc<dyn Muxer> {
        self.listeners.fetch_add(1, Ordering::SeqCst);
        FrameMuxer::start(stream, false)
    }
}

struct MuxShared {
    routes: Mutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>,
    frames_tx: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
}

/// Substream muxer framing `[id][flag][len][payload]` over one stream.
pub struct FrameMuxer {
    shared: Arc<MuxShared>,
    next_id: AtomicU32,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SwitchStream>>,
}

impl FrameMuxer {
    fn start(stream: SwitchStream, dialer: bool) -> Arc<dyn Muxer> {
        let (read_half, write_half) = tokio::io::split(stream);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MuxShared {
            routes: Mutex::new(HashMap::new()),
            frames_tx,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(writer_task(frames_rx, write_half));
        tokio::spawn(reader_task(read_half, shared.clone(), inbound_tx));

        Arc::new(Self {
            shared,
            next_id: AtomicU32::new(if dialer { 1 } else { 2 }),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        })
    }
}

#[async_trait]
impl Muxer for FrameMuxer {
    async fn open_stream(&self) -> SwitchResult<SwitchStream> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SwitchError::Muxer("muxer closed".to_string()));
        }
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        self.shared.routes.lock().unwrap().insert(id, data_tx);
        self.shared
            .frames_tx
            .send(Frame::Open(id))
            .map_err(|_| SwitchError::Muxer("muxer closed".to_string()))?;
        Ok(SwitchStream::new(SubStream {
            id,
            shared: self.shared.clone(),
            rx: data_rx,
            buffer: Vec::new(),
            offset: 0,
            closed_write: false,
        }))
    }

    async fn next_inbound(&self) -> Option<SwitchStream> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) -> SwitchResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shared.frames_tx.send(Frame::GoAway);
        Ok(())
    }
}

async fn writer_task(mut rx: mpsc::UnboundedReceiver<Frame>, mut writer: WriteHalf<SwitchStream>) {
    while let Some(frame) = rx.recv().await {
        let goaway = matches!(frame, Frame::GoAway);
        let (id, flag, payload) = match &frame {
            Frame::Open(id) => (*id, FLAG_OPEN, Vec::new()),
            Frame::Data(id, data) => (*id, FLAG_DATA, data.clone()),
            Frame::Close(id) => (*id, FLAG_CLOSE, Vec::new()),
            Frame::GoAway => (0, FLAG_GOAWAY, Vec::new()),
        };
        let mut head = Vec::with_capacity(9);
        head.extend_from_slice(&id.to_be_bytes());
        head.push(flag);
        head.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        if writer.write_all(&head).await.is_err() {
            break;
        }
        if !payload.is_empty() && writer.write_all(&payload).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
        if goaway {
            let _ = writer.shutdown().await;
            break;
        }
    }
}

async fn reader_task(
    mut reader: ReadHalf<SwitchStream>,
    shared: Arc<MuxShared>,
    inbound_tx: mpsc::UnboundedSender<SwitchStream>,
) {
    loop {
        let mut head = [0u8; 9];
        if reader.read_exact(&mut head).await.is_err() {
            break;
        }
        let id = u32::from_be_bytes(head[0..4].try_into().unwrap());
        let flag = head[4];
        let len = u32::from_be_bytes(head[5..9].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        if len > 0 && reader.read_exact(&mut payload).await.is_err() {
            break;
        }
        match flag {
            FLAG_OPEN => {
                let (data_tx, data_rx) = mpsc::unbounded_channel();
                shared.routes.lock().unwrap().insert(id, data_tx);
                let substream = SubStream {
                    id,
                    shared: shared.clone(),
                    rx: data_rx,
                    buffer: Vec::new(),
                    offset: 0,
                    closed_write: false,
                };
                if inbound_tx.send(SwitchStream::new(substream)).is_err() {
                    break;
                }
            }
            FLAG_DATA => {
                let tx = shared.routes.lock().unwrap().get(&id).cloned();
                if let Some(tx) = tx {
                    let _ = tx.send(payload);
                }
            }
            FLAG_CLOSE => {
                shared.routes.lock().unwrap().remove(&id);
            }
            _ => break,
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    shared.routes.lock().unwrap().clear();
}

struct SubStream {
    id: u32,
    shared: Arc<MuxShared>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    buffer: Vec<u8>,
    offset: usize,
    closed_write: bool,
}

impl Drop for SubStream {
    fn drop(&mut self) {
        if !self.closed_write {
            let _ = self.shared.frames_tx.send(Frame::Close(self.id));
        }
    }
}

impl AsyncRead for SubStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.offset < this.buffer.len() {
                let n = buf.remaining().min(this.buffer.len() - this.offset);
                buf.put_slice(&this.buffer[this.offset..this.offset + n]);
                this.offset += n;
                return std::task::Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                std::task::Poll::Ready(Some(data)) => {
                    this.buffer = data;
                    this.offset = 0;
                }
                std::task::Poll::Ready(None) => return std::task::Poll::Ready(Ok(())),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for SubStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.closed_write || this.shared.closed.load(Ordering::SeqCst) {
            return std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
        }
        match this.shared.frames_tx.send(Frame::Data(this.id, buf.to_vec())) {
            Ok(()) => std::task::Poll::Ready(Ok(buf.len())),
            Err(_) => std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.closed_write {
            this.closed_write = true;
            let _ = this.shared.frames_tx.send(Frame::Close(this.id));
        }
        std::task::Poll::Ready(Ok(()))
    }
}
