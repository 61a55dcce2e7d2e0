//! # Provider
//!
//! The local handle to one live connection and the peer behind it.
//!
//! A provider owns the peer's handshake state, its stream registry and its
//! table of outstanding round trips. The read half of the encrypted session is
//! driven by the connection's read loop in [`crate::rpc`]; the write half
//! belongs to a writer task fed through a bounded channel. A frame is either
//! queued whole or not at all, so a caller that stops waiting never leaves a
//! partial frame on the wire, and frames from concurrent tasks never
//! interleave.
//!
//! ## Stream Ids
//!
//! | Side | Ids |
//! |------|-----|
//! | dialer (`initiator = true`) | 1, 3, 5, ... |
//! | acceptor | 2, 4, 6, ... |
//!
//! Both sides can therefore open request streams on the same connection
//! without coordinating.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::{Identity, PublicKey};
use crate::messages::{
    DataPacket, FindNodeRequest, FindNodeResponse, Frame, HandshakePacket, Headers, Packet,
    ServiceRequestPacket,
};
use crate::protocols::Response;
use crate::session::{FrameReader, FrameWriter, Session, SessionState};
use crate::stream::{PendingRequests, StreamRegistry};
use crate::transport::BoxedConnection;

pub(crate) type ConnReader = FrameReader<ReadHalf<BoxedConnection>>;
pub(crate) type ConnWriter = FrameWriter<WriteHalf<BoxedConnection>>;

/// Frames queued for the writer task before senders wait.
const OUTBOUND_QUEUE_SIZE: usize = 256;

#[derive(Debug)]
struct PeerInfo {
    state: SessionState,
    identity: Option<Identity>,
    services: BTreeSet<String>,
}

pub struct Provider {
    id: u64,
    addr: String,
    initiator: bool,
    binding: [u8; 32],
    outbound: StdRwLock<Option<mpsc::Sender<Frame>>>,
    writer_task: StdMutex<Option<JoinHandle<()>>>,
    peer: StdRwLock<PeerInfo>,
    pub(crate) streams: StreamRegistry,
    pub(crate) pending: PendingRequests,
    next_stream: AtomicU32,
    shutdown_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("initiator", &self.initiator)
            .field("identity", &self.identity())
            .field("services", &self.services())
            .finish_non_exhaustive()
    }
}

impl Provider {
    pub(crate) fn new(
        id: u64,
        addr: String,
        initiator: bool,
        binding: [u8; 32],
        writer: ConnWriter,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let provider = Arc::new(Self {
            id,
            addr,
            initiator,
            binding,
            outbound: StdRwLock::new(Some(outbound_tx)),
            writer_task: StdMutex::new(None),
            peer: StdRwLock::new(PeerInfo {
                state: SessionState::KeyExchanged,
                identity: None,
                services: BTreeSet::new(),
            }),
            streams: StreamRegistry::new(),
            pending: PendingRequests::new(),
            next_stream: AtomicU32::new(if initiator { 1 } else { 2 }),
            shutdown_tx,
            closed_tx,
        });

        let task = tokio::spawn(write_loop(Arc::downgrade(&provider), writer, outbound_rx));
        if let Ok(mut slot) = provider.writer_task.lock() {
            *slot = Some(task);
        }
        provider
    }

    /// Connection id, increasing in connection order.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The address dialed, or the remote address an inbound connection came from.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether this side dialed the connection.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// The peer's verified identity; `None` for anonymous peers or before the handshake.
    pub fn identity(&self) -> Option<Identity> {
        self.peer.read().ok().and_then(|p| p.identity.clone())
    }

    pub fn key(&self) -> Option<PublicKey> {
        self.peer.read().ok().and_then(|p| p.identity.as_ref().map(|id| *id.key()))
    }

    /// Services the peer advertised in its handshake.
    pub fn services(&self) -> Vec<String> {
        self.peer
            .read()
            .map(|p| p.services.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The session's channel binding, covered by handshake signatures.
    pub(crate) fn binding(&self) -> &[u8; 32] {
        &self.binding
    }

    pub fn state(&self) -> SessionState {
        self.peer
            .read()
            .map(|p| p.state)
            .unwrap_or(SessionState::Unauthenticated)
    }

    pub fn is_handshaked(&self) -> bool {
        self.state().is_handshaked()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        if let Ok(mut peer) = self.peer.write() {
            peer.state = state;
        }
    }

    /// Record the peer's verified handshake. A second handshake is a violation.
    pub(crate) fn complete_handshake(&self, identity: Option<Identity>, services: Vec<String>) -> Result<()> {
        let mut peer = self
            .peer
            .write()
            .map_err(|_| Error::handshake("peer state unavailable"))?;
        if peer.state.is_handshaked() {
            return Err(Error::handshake("duplicate handshake"));
        }
        peer.identity = identity;
        peer.services = services.into_iter().collect();
        peer.state = SessionState::Handshaked;
        Ok(())
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Queue `frame` for the writer task.
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        let outbound = self
            .outbound
            .read()
            .ok()
            .and_then(|tx| tx.clone())
            .ok_or(Error::ConnectionClosed)?;
        outbound.send(frame).await.map_err(|_| Error::ConnectionClosed)
    }

    pub(crate) async fn send_packet<P: Packet>(&self, seq: u32, packet: &P) -> Result<()> {
        self.send(Frame::from_packet(seq, packet)?).await
    }

    /// Stream `body` as Data chunks of at most `chunk_size` bytes, then an empty end marker.
    pub(crate) async fn send_body(&self, stream: u32, body: &[u8], chunk_size: usize) -> Result<()> {
        for chunk in body.chunks(chunk_size.max(1)) {
            self.send_packet(0, &DataPacket {
                stream,
                chunk: chunk.to_vec(),
            })
            .await?;
        }
        self.send_packet(0, &DataPacket {
            stream,
            chunk: Vec::new(),
        })
        .await
    }

    /// Send `packet` with a fresh sequence number and wait for the frame that echoes it.
    pub(crate) async fn request<P: Packet>(&self, packet: &P) -> Result<Frame> {
        let (seq, rx) = self.pending.register().await?;
        if let Err(err) = self.send_packet(seq, packet).await {
            self.pending.cancel(seq).await;
            return Err(err);
        }
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    pub(crate) async fn exchange_handshake(&self, ours: &HandshakePacket) -> Result<HandshakePacket> {
        self.set_state(SessionState::Handshaking);
        let frame = self.request(ours).await?;
        frame.packet::<HandshakePacket>()
    }

    /// Ask the peer for the identities it knows closest to `target`.
    pub async fn find_node(&self, target: PublicKey) -> Result<Vec<Identity>> {
        let frame = self.request(&FindNodeRequest { target }).await?;
        Ok(frame.packet::<FindNodeResponse>()?.nodes)
    }

    /// Open a stream, send a ServiceRequest with `body`, and return the
    /// response as soon as its headers arrive. The response body streams in
    /// afterwards.
    pub async fn service_request(
        self: &Arc<Self>,
        services: &[String],
        headers: Headers,
        body: &[u8],
        chunk_size: usize,
    ) -> Result<Response> {
        let stream = self.next_stream.fetch_add(2, Ordering::Relaxed);
        let (head, response_body) = self.streams.register(stream).await?;

        // Detached so that a caller dropping this future still leaves a
        // complete request on the wire.
        let request = ServiceRequestPacket {
            stream,
            services: services.to_vec(),
            headers,
        };
        let body = body.to_vec();
        let provider = Arc::clone(self);
        let sending = tokio::spawn(async move {
            let sent = async {
                provider.send_packet(0, &request).await?;
                provider.send_body(stream, &body, chunk_size).await
            }
            .await;
            if sent.is_err() {
                provider.streams.remove(stream).await;
            }
            sent
        });
        sending.await.map_err(|_| Error::ConnectionClosed)??;

        let head = head.await.map_err(|_| Error::ConnectionClosed)?;
        debug!(peer = %self.addr, stream, handled = head.handled, "service response headers received");
        Ok(Response {
            handled: head.handled,
            headers: head.headers,
            body: response_body,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Ask the read loop to stop. Returns immediately; see [`Provider::closed`].
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Wait until the connection is fully torn down.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Neither closed nor closing.
    pub fn is_live(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Fail everything waiting on this connection and close our write half.
    pub(crate) async fn teardown(&self) {
        self.shutdown_tx.send_replace(true);
        self.pending.close().await;
        self.streams.close_all().await;
        if let Ok(mut outbound) = self.outbound.write() {
            outbound.take();
        }
        let task = self.writer_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub(crate) fn finish(&self) {
        self.closed_tx.send_replace(true);
    }
}

/// Split a keyed session into the reader for the read loop and a new provider.
pub(crate) fn from_session(
    id: u64,
    addr: String,
    initiator: bool,
    session: Session<BoxedConnection>,
) -> (Arc<Provider>, ConnReader) {
    let binding = *session.binding();
    let (reader, writer) = session.split();
    (Provider::new(id, addr, initiator, binding, writer), reader)
}

/// Resolves once the provider is asked to close. If the provider is dropped
/// instead, never resolves, so the queue still drains.
async fn close_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drain queued frames onto the connection until the provider closes, every
/// sender is gone, or a write fails. A failed write closes the provider.
async fn write_loop(
    provider: Weak<Provider>,
    mut writer: ConnWriter,
    mut outbound: mpsc::Receiver<Frame>,
) {
    let Some(mut stop) = provider.upgrade().map(|p| p.shutdown_signal()) else {
        return;
    };
    loop {
        let frame = tokio::select! {
            biased;
            _ = close_requested(&mut stop) => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let written = tokio::select! {
            biased;
            _ = close_requested(&mut stop) => break,
            written = writer.write_frame(&frame) => written,
        };
        if let Err(err) = written {
            debug!(error = %err, "connection write failed");
            if let Some(provider) = provider.upgrade() {
                provider.close();
            }
            break;
        }
    }
    outbound.close();
    let _ = writer.shutdown().await;
}
