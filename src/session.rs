//! # Encrypted Session Layer
//!
//! Before any frame is exchanged, both sides run an ephemeral X25519 key
//! exchange directly on the raw connection:
//!
//! ```text
//! dialer                          acceptor
//!   │ ── ephemeral pub (32B) ──────► │
//!   │ ◄────── ephemeral pub (32B) ── │
//!   │                                │
//!   └─ shared = X25519(e_self, e_peer) ─┘
//! ```
//!
//! Two directional ChaCha20-Poly1305 keys are derived with BLAKE3 from
//! `shared ‖ dialer_pub ‖ acceptor_pub`. Every frame afterwards travels as
//!
//! ```text
//! u32 length ‖ seal(opcode ‖ seq ‖ payload)
//! ```
//!
//! where `length` counts the sealed body, the 4-byte length prefix is bound as
//! associated data, and the nonce is a per-direction counter. A reordered,
//! replayed, truncated or tampered frame fails authentication and kills the
//! connection.
//!
//! The key exchange is anonymous on its own. Peers prove their long-term
//! identity afterwards with a [`HandshakePacket`] whose signature covers the
//! session's [`Session::binding`], which ties the proof to these ephemeral keys.
//!
//! [`HandshakePacket`]: crate::messages::HandshakePacket

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::error::{Error, Result};
use crate::messages::{Frame, FRAME_HEADER_LEN, LENGTH_PREFIX_LEN, MAX_FRAME_SIZE};

/// Poly1305 authentication tag appended to every sealed frame.
pub const TAG_LEN: usize = 16;

const EPHEMERAL_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const DIALER_TO_ACCEPTOR: &str = "servmesh session v1 dialer to acceptor";
const ACCEPTOR_TO_DIALER: &str = "servmesh session v1 acceptor to dialer";
const CHANNEL_BINDING: &str = "servmesh session v1 channel binding";

/// Per-connection progress from raw socket to authenticated peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    /// Session keys agreed, no Handshake packet exchanged yet.
    KeyExchanged,
    /// Our Handshake packet is in flight.
    Handshaking,
    Handshaked,
}

impl SessionState {
    pub fn is_handshaked(self) -> bool {
        self == SessionState::Handshaked
    }
}

// ============================================================================
// Cipher state
// ============================================================================

struct CipherState {
    cipher: ChaCha20Poly1305,
    nonce: u64,
}

impl CipherState {
    fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            nonce: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<Nonce> {
        if self.nonce == u64::MAX {
            return Err(Error::protocol("session nonce exhausted"));
        }
        let mut bytes = [0u8; NONCE_LEN];
        bytes[4..12].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce += 1;
        Ok(Nonce::from(bytes))
    }

    fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| Error::protocol("frame encryption failed"))
    }

    fn open(&mut self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(&nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| Error::protocol("frame authentication failed"))
    }
}

// ============================================================================
// Key exchange
// ============================================================================

/// A connection with agreed session keys, ready to be split into halves.
pub struct Session<S> {
    stream: S,
    send: CipherState,
    recv: CipherState,
    binding: [u8; 32],
}

impl<S> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sent", &self.send.nonce)
            .field("received", &self.recv.nonce)
            .finish_non_exhaustive()
    }
}

/// Run the dialer side of the key exchange.
pub async fn client_handshake<S>(mut stream: S) -> Result<Session<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let ours = X25519PublicKey::from(&secret);

    stream.write_all(ours.as_bytes()).await?;
    stream.flush().await?;
    let theirs = read_ephemeral(&mut stream).await?;

    let keys = derive_keys(secret, &theirs, ours.as_bytes(), theirs.as_bytes())?;
    Ok(Session {
        stream,
        send: CipherState::new(keys.dialer_to_acceptor),
        recv: CipherState::new(keys.acceptor_to_dialer),
        binding: keys.binding,
    })
}

/// Run the acceptor side of the key exchange.
pub async fn server_handshake<S>(mut stream: S) -> Result<Session<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let theirs = read_ephemeral(&mut stream).await?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let ours = X25519PublicKey::from(&secret);
    stream.write_all(ours.as_bytes()).await?;
    stream.flush().await?;

    let keys = derive_keys(secret, &theirs, theirs.as_bytes(), ours.as_bytes())?;
    Ok(Session {
        stream,
        send: CipherState::new(keys.acceptor_to_dialer),
        recv: CipherState::new(keys.dialer_to_acceptor),
        binding: keys.binding,
    })
}

async fn read_ephemeral<S: AsyncRead + Unpin>(stream: &mut S) -> Result<X25519PublicKey> {
    let mut bytes = [0u8; EPHEMERAL_KEY_LEN];
    stream.read_exact(&mut bytes).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::handshake("connection closed during key exchange")
        } else {
            Error::Io(err)
        }
    })?;
    Ok(X25519PublicKey::from(bytes))
}

struct SessionKeys {
    dialer_to_acceptor: [u8; 32],
    acceptor_to_dialer: [u8; 32],
    binding: [u8; 32],
}

fn derive_keys(
    secret: EphemeralSecret,
    peer: &X25519PublicKey,
    dialer_pub: &[u8; 32],
    acceptor_pub: &[u8; 32],
) -> Result<SessionKeys> {
    let shared = secret.diffie_hellman(peer);
    if !shared.was_contributory() {
        return Err(Error::handshake("non-contributory key exchange"));
    }

    let mut material = Vec::with_capacity(96);
    material.extend_from_slice(shared.as_bytes());
    material.extend_from_slice(dialer_pub);
    material.extend_from_slice(acceptor_pub);

    Ok(SessionKeys {
        dialer_to_acceptor: blake3::derive_key(DIALER_TO_ACCEPTOR, &material),
        acceptor_to_dialer: blake3::derive_key(ACCEPTOR_TO_DIALER, &material),
        binding: blake3::derive_key(CHANNEL_BINDING, &material),
    })
}

impl<S> Session<S> {
    /// A value both ends of this session share and no other session does.
    /// Handshake signatures cover it, so a signed handshake cannot be
    /// replayed onto another connection.
    pub fn binding(&self) -> &[u8; 32] {
        &self.binding
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Split into independently owned read and write halves.
    pub fn split(self) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            FrameReader {
                inner: read,
                cipher: self.recv,
            },
            FrameWriter {
                inner: write,
                cipher: self.send,
            },
        )
    }
}

// ============================================================================
// Framed halves
// ============================================================================

pub struct FrameReader<R> {
    inner: R,
    cipher: CipherState,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read and decrypt the next frame. `Ok(None)` means the peer closed cleanly
    /// at a frame boundary.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        match self.inner.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if !(FRAME_HEADER_LEN + TAG_LEN..=MAX_FRAME_SIZE).contains(&len) {
            return Err(Error::protocol(format!("invalid sealed frame length {len}")));
        }

        let mut sealed = vec![0u8; len];
        self.inner.read_exact(&mut sealed).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::ConnectionClosed
            } else {
                Error::Io(err)
            }
        })?;

        let body = self.cipher.open(&sealed, &prefix)?;
        Frame::decode_body(&body).map(Some)
    }
}

pub struct FrameWriter<W> {
    inner: W,
    cipher: CipherState,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let body = frame.encode_body();
        let sealed_len = body.len() + TAG_LEN;
        if sealed_len > MAX_FRAME_SIZE {
            return Err(Error::protocol(format!("frame of {sealed_len} bytes exceeds limit")));
        }
        let prefix = (sealed_len as u32).to_be_bytes();
        let sealed = self.cipher.seal(&body, &prefix)?;

        let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + sealed.len());
        out.extend_from_slice(&prefix);
        out.extend_from_slice(&sealed);
        self.inner.write_all(&out).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Half-close the write side so the peer's reader observes end of stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Opcode;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::timeout;

    async fn pair() -> (Session<DuplexStream>, Session<DuplexStream>) {
        let (a, b) = duplex(1 << 20);
        let (client, server) = tokio::join!(client_handshake(a), server_handshake(b));
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (client, server) = pair().await;
        let (mut c_read, mut c_write) = client.split();
        let (mut s_read, mut s_write) = server.split();

        for seq in 1..=3u32 {
            let frame = Frame::new(Opcode::FindNodeRequest, seq, vec![seq as u8; 32]);
            c_write.write_frame(&frame).await.unwrap();
            assert_eq!(s_read.read_frame().await.unwrap(), Some(frame));
        }

        let reply = Frame::new(Opcode::Data, 0, Vec::new());
        s_write.write_frame(&reply).await.unwrap();
        assert_eq!(c_read.read_frame().await.unwrap(), Some(reply));
    }

    #[tokio::test]
    async fn binding_is_shared_per_session_only() {
        let (client, server) = pair().await;
        assert_eq!(client.binding(), server.binding());
        let (other, _) = pair().await;
        assert_ne!(client.binding(), other.binding());
    }

    #[tokio::test]
    async fn ciphertext_does_not_contain_plaintext() {
        let (a, mut raw) = duplex(1 << 16);
        let server = tokio::spawn(async move {
            let mut theirs = [0u8; 32];
            raw.read_exact(&mut theirs).await.unwrap();
            let secret = EphemeralSecret::random_from_rng(OsRng);
            raw.write_all(X25519PublicKey::from(&secret).as_bytes()).await.unwrap();
            let mut wire = vec![0u8; 4 + FRAME_HEADER_LEN + 12 + TAG_LEN];
            raw.read_exact(&mut wire).await.unwrap();
            wire
        });

        let session = client_handshake(a).await.unwrap();
        let (_r, mut w) = session.split();
        w.write_frame(&Frame::new(Opcode::Data, 0, b"secret-bytes".to_vec()))
            .await
            .unwrap();

        let wire = server.await.unwrap();
        assert_eq!(&wire[..4], &((FRAME_HEADER_LEN + 12 + TAG_LEN) as u32).to_be_bytes());
        assert!(!wire.windows(12).any(|w| w == b"secret-bytes"));
    }

    #[tokio::test]
    async fn tampered_frame_is_rejected() {
        let (a, b) = duplex(1 << 16);
        let (client, server) = tokio::join!(client_handshake(a), server_handshake(b));
        let (mut reader, _w) = server.unwrap().split();

        // Write a syntactically valid but forged frame straight onto the stream.
        let (_r, mut raw_write) = tokio::io::split(client.unwrap().stream);
        let mut forged = ((FRAME_HEADER_LEN + TAG_LEN) as u32).to_be_bytes().to_vec();
        forged.extend_from_slice(&[0u8; FRAME_HEADER_LEN + TAG_LEN]);
        raw_write.write_all(&forged).await.unwrap();

        assert!(matches!(reader.read_frame().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let (client, server) = pair().await;
        let (mut reader, _sw) = server.split();
        let (_cr, mut writer) = client.split();
        writer.shutdown().await.unwrap();
        let next = timeout(Duration::from_secs(5), reader.read_frame())
            .await
            .expect("reader should observe close");
        assert!(matches!(next, Ok(None)));
    }

    #[tokio::test]
    async fn oversized_length_prefix_rejected() {
        let (a, b) = duplex(1 << 16);
        let (client, server) = tokio::join!(client_handshake(a), server_handshake(b));
        let (mut reader, _w) = server.unwrap().split();
        let (_r, mut raw_write) = tokio::io::split(client.unwrap().stream);
        raw_write
            .write_all(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(reader.read_frame().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn peer_closing_during_key_exchange_is_handshake_error() {
        let (a, b) = duplex(64);
        drop(b);
        assert!(matches!(client_handshake(a).await, Err(Error::Handshake(_)) | Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn low_order_ephemeral_rejected() {
        let (a, mut raw) = duplex(1 << 10);
        tokio::spawn(async move {
            let mut theirs = [0u8; 32];
            let _ = raw.read_exact(&mut theirs).await;
            // The all-zero point yields a non-contributory shared secret.
            let _ = raw.write_all(&[0u8; 32]).await;
            let _ = raw.flush().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        assert!(matches!(client_handshake(a).await, Err(Error::Handshake(_))));
    }
}
