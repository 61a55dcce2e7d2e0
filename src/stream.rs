//! # Stream Multiplexer
//!
//! Many logical streams share one encrypted connection. Each stream is keyed
//! by a `u32` id chosen by the side that opens it (dialer odd, acceptor even),
//! and moves through:
//!
//! ```text
//! Registered ──pull(handled)──► HeadersReceived ──recv(chunk)──► Receiving ──recv(empty)──► Ended
//!     │                                                                                      ▲
//!     └──────────────────────────── pull(!handled) ──────────────────────────────────────────┘
//! ```
//!
//! Ended streams are removed from the registry, so a late frame for them looks
//! exactly like a frame for an id that was never registered: both are protocol
//! errors for the caller to act on.
//!
//! [`PendingRequests`] is the sibling table for single round-trip exchanges
//! (Handshake, FindNode) correlated by frame sequence number.
//!
//! Closing either table fails everything still waiting on it, so no caller
//! can hang on a dead connection.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Error, Result};
use crate::messages::{Frame, Headers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Outbound request sent, waiting for the response headers.
    Registered,
    HeadersReceived,
    Receiving,
    Ended,
}

/// Response headers delivered to the requester of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub handled: bool,
    pub headers: Headers,
}

/// The receiving side of a streamed body: a finite, single-pass sequence of
/// chunks in arrival order.
#[derive(Debug)]
pub struct Body {
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
}

impl Body {
    fn channel() -> (mpsc::UnboundedSender<Result<Vec<u8>>>, Body) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Body { rx })
    }

    /// A body that ends immediately.
    pub fn empty() -> Self {
        Self::channel().1
    }

    /// Next chunk, `Ok(None)` at end of stream, or the connection error that cut it short.
    pub async fn chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// Collect the remaining chunks.
    pub async fn bytes(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

struct StreamEntry {
    state: StreamState,
    head: Option<oneshot::Sender<Head>>,
    body: mpsc::UnboundedSender<Result<Vec<u8>>>,
}

#[derive(Default)]
struct Streams {
    entries: HashMap<u32, StreamEntry>,
    closed: bool,
}

#[derive(Default)]
pub struct StreamRegistry {
    inner: Mutex<Streams>,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry").finish_non_exhaustive()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a stream we opened; resolves with the peer's response headers.
    pub async fn register(&self, id: u32) -> Result<(oneshot::Receiver<Head>, Body)> {
        let mut streams = self.inner.lock().await;
        if streams.closed {
            return Err(Error::ConnectionClosed);
        }
        if streams.entries.contains_key(&id) {
            return Err(Error::protocol(format!("stream {id} already registered")));
        }
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body) = Body::channel();
        streams.entries.insert(
            id,
            StreamEntry {
                state: StreamState::Registered,
                head: Some(head_tx),
                body: body_tx,
            },
        );
        Ok((head_rx, body))
    }

    /// Track a stream the peer opened. Its headers arrived with the request.
    pub async fn accept(&self, id: u32) -> Result<Body> {
        let mut streams = self.inner.lock().await;
        if streams.closed {
            return Err(Error::ConnectionClosed);
        }
        if streams.entries.contains_key(&id) {
            return Err(Error::protocol(format!("stream {id} already open")));
        }
        let (body_tx, body) = Body::channel();
        streams.entries.insert(
            id,
            StreamEntry {
                state: StreamState::HeadersReceived,
                head: None,
                body: body_tx,
            },
        );
        Ok(body)
    }

    /// Current state of a live stream; `None` once ended or if never registered.
    pub async fn get(&self, id: u32) -> Option<StreamState> {
        self.inner.lock().await.entries.get(&id).map(|e| e.state)
    }

    /// Deliver response headers. An unhandled response ends the stream.
    pub async fn pull(&self, id: u32, handled: bool, headers: Headers) -> Result<()> {
        let mut streams = self.inner.lock().await;
        let entry = streams
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::protocol(format!("response for unknown stream {id}")))?;
        let head = entry
            .head
            .take()
            .ok_or_else(|| Error::protocol(format!("duplicate response for stream {id}")))?;

        // The requester may have stopped waiting; the stream still follows the protocol.
        let _ = head.send(Head { handled, headers });
        if handled {
            entry.state = StreamState::HeadersReceived;
        } else {
            streams.entries.remove(&id);
        }
        Ok(())
    }

    /// Append a Data chunk; an empty chunk ends the stream.
    pub async fn recv(&self, id: u32, chunk: Vec<u8>) -> Result<()> {
        let mut streams = self.inner.lock().await;
        let entry = streams
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::protocol(format!("data for unknown stream {id}")))?;
        if entry.state == StreamState::Registered {
            return Err(Error::protocol(format!("data before response headers on stream {id}")));
        }

        if chunk.is_empty() {
            entry.state = StreamState::Ended;
            streams.entries.remove(&id);
        } else {
            entry.state = StreamState::Receiving;
            let _ = entry.body.send(Ok(chunk));
        }
        Ok(())
    }

    pub async fn remove(&self, id: u32) -> bool {
        self.inner.lock().await.entries.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Fail every open stream and refuse new ones.
    pub async fn close_all(&self) {
        let mut streams = self.inner.lock().await;
        streams.closed = true;
        for (_, entry) in streams.entries.drain() {
            let _ = entry.body.send(Err(Error::ConnectionClosed));
        }
    }
}

// ============================================================================
// Sequence-correlated round trips
// ============================================================================

struct Pending {
    next_seq: u32,
    waiters: HashMap<u32, oneshot::Sender<Frame>>,
    closed: bool,
}

pub struct PendingRequests {
    inner: Mutex<Pending>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Pending {
                next_seq: 1,
                waiters: HashMap::new(),
                closed: false,
            }),
        }
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests").finish_non_exhaustive()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh non-zero sequence number and the slot its reply lands in.
    pub async fn register(&self) -> Result<(u32, oneshot::Receiver<Frame>)> {
        let mut pending = self.inner.lock().await;
        if pending.closed {
            return Err(Error::ConnectionClosed);
        }
        let mut seq = pending.next_seq;
        while seq == 0 || pending.waiters.contains_key(&seq) {
            seq = seq.wrapping_add(1);
        }
        pending.next_seq = seq.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(seq, tx);
        Ok((seq, rx))
    }

    /// Hand a reply to its waiter. Returns the frame back if nobody asked for it.
    pub async fn resolve(&self, frame: Frame) -> std::result::Result<(), Frame> {
        let waiter = self.inner.lock().await.waiters.remove(&frame.seq);
        match waiter {
            Some(tx) => {
                let _ = tx.send(frame);
                Ok(())
            }
            None => Err(frame),
        }
    }

    pub async fn cancel(&self, seq: u32) {
        self.inner.lock().await.waiters.remove(&seq);
    }

    /// Fail every waiter and refuse new requests.
    pub async fn close(&self) {
        let mut pending = self.inner.lock().await;
        pending.closed = true;
        pending.waiters.clear();
    }
}
