//! # servmesh - Self-Certifying Service Mesh Node
//!
//! servmesh is a peer-to-peer overlay node in which peers:
//!
//! - **Identity**: are named by Ed25519 public keys and prove ownership by signature
//! - **Discovery**: find each other with a Kademlia-style XOR routing table
//! - **Session**: encrypt every frame with per-connection ChaCha20-Poly1305 keys
//! - **Services**: advertise named services and answer streamed requests for them
//!
//! ## Data Flow
//!
//! ```text
//! connection ─► session (decrypt) ─► frame ─► stream mux ─► opcode dispatch
//!                                                              │
//!                        routing table / service registry ◄────┤
//!                                          service handler ◄───┘
//! ```
//!
//! Responses travel back down the same path.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: start, connect, listen, bootstrap, push, shutdown |
//! | `identity` | Public keys, identities, secret keys and keypairs |
//! | `crypto` | Domain-separated handshake signatures |
//! | `routing` | XOR-metric routing table |
//! | `messages` | Frames and bit-exact packet codecs |
//! | `session` | Key exchange and sealed frame I/O |
//! | `stream` | Per-connection stream registry and request correlation |
//! | `provider` | One live connection and the peer behind it |
//! | `registry` | Service name to provider mapping |
//! | `protocols` | Service handler trait and request/response types |
//! | `rpc` | Connection read loop and opcode dispatch |
//! | `transport` | Byte-stream transport seam (TCP by default) |

mod crypto;
mod error;
mod identity;
pub mod messages;
mod node;
mod protocols;
mod provider;
mod registry;
mod routing;
mod rpc;
pub mod session;
mod stream;
pub mod transport;

pub use crypto::{SignatureError, HANDSHAKE_SIGNATURE_DOMAIN, SIGNATURE_LEN};
pub use error::{Error, Result};
pub use identity::{
    generate_secret_key, Distance, Identity, Keypair, PublicKey, SecretKey, PUBLIC_KEY_LEN,
    SECRET_KEY_LEN,
};
pub use messages::{Headers, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_FRAME_SIZE};
pub use node::{Node, NodeConfig, AUTO_BIND_ADDR, RECONNECT_ATTEMPTS, RECONNECT_DELAY};
pub use protocols::{Context, Handler, Reply, Response, ERROR_HEADER};
pub use provider::Provider;
pub use registry::ServiceRegistry;
pub use routing::{RoutingTable, UpdateOutcome, DEFAULT_K};
pub use session::SessionState;
pub use stream::{Body, Head, PendingRequests, StreamRegistry, StreamState};
