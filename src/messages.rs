//! # Wire Protocol Messages
//!
//! Every message on a connection is a frame:
//!
//! ```text
//! u32 length | u8 opcode | u32 seq | payload[length - 5]
//! ```
//!
//! All integers are big-endian. `seq` correlates a request with its reply: a
//! responder echoes the request's sequence number, and `seq = 0` marks a frame
//! that expects no direct reply.
//!
//! ## Packet Types
//!
//! | Opcode | Packet | Payload |
//! |--------|--------|---------|
//! | 0 | [`HandshakePacket`] | `opt identity ‖ list services ‖ opt sig[64]` |
//! | 1 | [`FindNodeRequest`] | `key[32]` |
//! | 2 | [`FindNodeResponse`] | `list identity` |
//! | 3 | [`ServiceRequestPacket`] | `u32 stream ‖ list services ‖ headers` |
//! | 4 | [`ServiceResponsePacket`] | `u32 stream ‖ u8 handled ‖ headers` |
//! | 5 | [`DataPacket`] | `u32 stream ‖ chunk` |
//!
//! Primitive encodings: `string = u16 len ‖ utf8`, `identity = key[32] ‖
//! string host ‖ u16 port`, `list = u16 count ‖ items`, `headers = u16 count ‖
//! (string key ‖ string value)*` in key order, `opt = u8 flag ‖ value`.
//!
//! ## Limits
//!
//! - `MAX_FRAME_SIZE`: largest accepted frame body (16 MiB)
//! - `MAX_CHUNK_SIZE`: largest Data chunk a sender may emit
//! - Decoding rejects truncated input, unknown opcodes and trailing bytes

use std::collections::BTreeMap;

use crate::crypto::{sign_with_domain, verify_with_domain, HANDSHAKE_SIGNATURE_DOMAIN, SIGNATURE_LEN};
use crate::error::{Error, Result};
use crate::identity::{Identity, Keypair, PublicKey, PUBLIC_KEY_LEN};

/// Request/response header map, kept sorted so encodings are deterministic.
pub type Headers = BTreeMap<String, String>;

/// Opcode plus sequence number.
pub const FRAME_HEADER_LEN: usize = 5;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest frame body (everything after the length prefix) accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default size of the Data chunks a body is split into.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound for a configured chunk size.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Handshake = 0,
    FindNodeRequest = 1,
    FindNodeResponse = 2,
    ServiceRequest = 3,
    ServiceResponse = 4,
    Data = 5,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Opcode::Handshake),
            1 => Ok(Opcode::FindNodeRequest),
            2 => Ok(Opcode::FindNodeResponse),
            3 => Ok(Opcode::ServiceRequest),
            4 => Ok(Opcode::ServiceResponse),
            5 => Ok(Opcode::Data),
            other => Err(Error::protocol(format!("unknown opcode {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, seq: u32, payload: Vec<u8>) -> Self {
        Self { opcode, seq, payload }
    }

    /// Encode a packet into a frame carrying `seq`.
    pub fn from_packet<P: Packet>(seq: u32, packet: &P) -> Result<Self> {
        Ok(Self::new(P::OPCODE, seq, packet.encode()?))
    }

    /// Decode the payload as `P`, checking the opcode first.
    pub fn packet<P: Packet>(&self) -> Result<P> {
        if self.opcode != P::OPCODE {
            return Err(Error::protocol(format!(
                "expected {:?} frame, got {:?}",
                P::OPCODE,
                self.opcode
            )));
        }
        P::decode(&self.payload)
    }

    /// `u8 opcode ‖ u32 seq ‖ payload`, the frame without its length prefix.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.push(self.opcode as u8);
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode_body(body: &[u8]) -> Result<Self> {
        if body.len() < FRAME_HEADER_LEN {
            return Err(Error::protocol("frame shorter than header"));
        }
        let opcode = Opcode::try_from(body[0])?;
        let seq = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
        Ok(Self::new(opcode, seq, body[FRAME_HEADER_LEN..].to_vec()))
    }

    /// The complete frame including its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = self.encode_body();
        if body.len() > MAX_FRAME_SIZE {
            return Err(Error::protocol(format!("frame of {} bytes exceeds limit", body.len())));
        }
        let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode exactly one length-prefixed frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LENGTH_PREFIX_LEN {
            return Err(Error::protocol("missing length prefix"));
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::protocol(format!("frame of {len} bytes exceeds limit")));
        }
        let body = &bytes[LENGTH_PREFIX_LEN..];
        if body.len() != len {
            return Err(Error::protocol(format!(
                "length prefix says {len} bytes, frame has {}",
                body.len()
            )));
        }
        Self::decode_body(body)
    }
}

/// A packet type carried by exactly one opcode.
pub trait Packet: Sized {
    const OPCODE: Opcode;

    fn encode(&self) -> Result<Vec<u8>>;

    fn decode(payload: &[u8]) -> Result<Self>;
}

// ============================================================================
// Primitive codecs
// ============================================================================

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn count(&mut self, n: usize, what: &str) -> Result<()> {
        let n = u16::try_from(n).map_err(|_| Error::protocol(format!("too many {what}: {n}")))?;
        self.u16(n);
        Ok(())
    }

    fn string(&mut self, s: &str) -> Result<()> {
        self.count(s.len(), "string bytes")?;
        self.bytes(s.as_bytes());
        Ok(())
    }

    fn identity(&mut self, id: &Identity) -> Result<()> {
        self.bytes(id.key().as_bytes());
        self.string(id.host())?;
        self.u16(id.port());
        Ok(())
    }

    fn opt_identity(&mut self, id: Option<&Identity>) -> Result<()> {
        match id {
            Some(id) => {
                self.u8(1);
                self.identity(id)
            }
            None => {
                self.u8(0);
                Ok(())
            }
        }
    }

    fn strings(&mut self, items: &[String]) -> Result<()> {
        self.count(items.len(), "list items")?;
        for item in items {
            self.string(item)?;
        }
        Ok(())
    }

    fn headers(&mut self, headers: &Headers) -> Result<()> {
        self.count(headers.len(), "headers")?;
        for (k, v) in headers {
            self.string(k)?;
            self.string(v)?;
        }
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::protocol("truncated packet"));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn flag(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::protocol(format!("invalid flag byte {other}"))),
        }
    }

    fn key(&mut self) -> Result<PublicKey> {
        let mut key = [0u8; PUBLIC_KEY_LEN];
        key.copy_from_slice(self.take(PUBLIC_KEY_LEN)?);
        Ok(PublicKey::from_bytes(key))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("string is not utf-8"))
    }

    fn identity(&mut self) -> Result<Identity> {
        let key = self.key()?;
        let host = self.string()?;
        let port = self.u16()?;
        Ok(Identity::new(key, host, port))
    }

    fn strings(&mut self) -> Result<Vec<String>> {
        let count = self.u16()? as usize;
        (0..count).map(|_| self.string()).collect()
    }

    fn headers(&mut self) -> Result<Headers> {
        let count = self.u16()? as usize;
        let mut headers = Headers::new();
        for _ in 0..count {
            let k = self.string()?;
            let v = self.string()?;
            if headers.insert(k, v).is_some() {
                return Err(Error::protocol("duplicate header key"));
            }
        }
        Ok(headers)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::protocol(format!("{} trailing bytes", self.buf.len())))
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandshakePacket {
    pub identity: Option<Identity>,
    pub services: Vec<String>,
    pub signature: Option<[u8; SIGNATURE_LEN]>,
}

impl HandshakePacket {
    /// An unsigned handshake for a node without an identity.
    pub fn anonymous(services: Vec<String>) -> Self {
        Self {
            identity: None,
            services,
            signature: None,
        }
    }

    /// A handshake advertising `identity`, signed with its keypair over the
    /// session `binding` it is sent on.
    pub fn signed(
        identity: Identity,
        services: Vec<String>,
        keypair: &Keypair,
        binding: &[u8; 32],
    ) -> Result<Self> {
        let mut packet = Self {
            identity: Some(identity),
            services,
            signature: None,
        };
        let payload = packet.signed_payload(binding)?;
        packet.signature = Some(sign_with_domain(keypair, HANDSHAKE_SIGNATURE_DOMAIN, &payload));
        Ok(packet)
    }

    /// The bytes covered by the signature: `binding[32] ‖ opt identity ‖ list services`.
    /// The binding never travels on the wire; both ends derive it from the session.
    pub fn signed_payload(&self, binding: &[u8; 32]) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.bytes(binding);
        w.opt_identity(self.identity.as_ref())?;
        w.strings(&self.services)?;
        Ok(w.finish())
    }

    /// Check the signature against the session `binding` and return the
    /// proven identity, if any.
    pub fn verify(&self, binding: &[u8; 32]) -> Result<Option<&Identity>> {
        match (&self.identity, &self.signature) {
            (None, None) => Ok(None),
            (Some(identity), Some(signature)) => {
                let payload = self.signed_payload(binding)?;
                verify_with_domain(identity.key(), HANDSHAKE_SIGNATURE_DOMAIN, &payload, signature)?;
                Ok(Some(identity))
            }
            (Some(_), None) => Err(Error::handshake("identity presented without signature")),
            (None, Some(_)) => Err(Error::handshake("signature presented without identity")),
        }
    }
}

impl Packet for HandshakePacket {
    const OPCODE: Opcode = Opcode::Handshake;

    fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.opt_identity(self.identity.as_ref())?;
        w.strings(&self.services)?;
        match &self.signature {
            Some(sig) => {
                w.u8(1);
                w.bytes(sig);
            }
            None => w.u8(0),
        }
        Ok(w.finish())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let identity = if r.flag()? { Some(r.identity()?) } else { None };
        let services = r.strings()?;
        let signature = if r.flag()? {
            let mut sig = [0u8; SIGNATURE_LEN];
            sig.copy_from_slice(r.take(SIGNATURE_LEN)?);
            Some(sig)
        } else {
            None
        };
        r.finish()?;
        Ok(Self {
            identity,
            services,
            signature,
        })
    }
}

// ============================================================================
// FindNode
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeRequest {
    pub target: PublicKey,
}

impl Packet for FindNodeRequest {
    const OPCODE: Opcode = Opcode::FindNodeRequest;

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.target.as_bytes().to_vec())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let target = r.key()?;
        r.finish()?;
        Ok(Self { target })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindNodeResponse {
    pub nodes: Vec<Identity>,
}

impl Packet for FindNodeResponse {
    const OPCODE: Opcode = Opcode::FindNodeResponse;

    fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.count(self.nodes.len(), "identities")?;
        for node in &self.nodes {
            w.identity(node)?;
        }
        Ok(w.finish())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let count = r.u16()? as usize;
        let nodes = (0..count).map(|_| r.identity()).collect::<Result<Vec<_>>>()?;
        r.finish()?;
        Ok(Self { nodes })
    }
}

// ============================================================================
// Service requests and streamed data
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceRequestPacket {
    pub stream: u32,
    /// Candidate services; the receiver serves the first one it has a handler for.
    pub services: Vec<String>,
    pub headers: Headers,
}

impl Packet for ServiceRequestPacket {
    const OPCODE: Opcode = Opcode::ServiceRequest;

    fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.u32(self.stream);
        w.strings(&self.services)?;
        w.headers(&self.headers)?;
        Ok(w.finish())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let stream = r.u32()?;
        let services = r.strings()?;
        let headers = r.headers()?;
        r.finish()?;
        Ok(Self {
            stream,
            services,
            headers,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceResponsePacket {
    pub stream: u32,
    pub handled: bool,
    pub headers: Headers,
}

impl Packet for ServiceResponsePacket {
    const OPCODE: Opcode = Opcode::ServiceResponse;

    fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.u32(self.stream);
        w.u8(u8::from(self.handled));
        w.headers(&self.headers)?;
        Ok(w.finish())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let stream = r.u32()?;
        let handled = r.flag()?;
        let headers = r.headers()?;
        r.finish()?;
        Ok(Self {
            stream,
            handled,
            headers,
        })
    }
}

/// One chunk of a streamed body. An empty chunk ends the stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataPacket {
    pub stream: u32,
    pub chunk: Vec<u8>,
}

impl DataPacket {
    pub fn is_eof(&self) -> bool {
        self.chunk.is_empty()
    }
}

impl Packet for DataPacket {
    const OPCODE: Opcode = Opcode::Data;

    fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.u32(self.stream);
        w.bytes(&self.chunk);
        Ok(w.finish())
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let stream = r.u32()?;
        let chunk = r.rest().to_vec();
        Ok(Self { stream, chunk })
    }
}
