//! Error taxonomy shared by every layer of the node.
//!
//! | Variant | Scope |
//! |---------|-------|
//! | `Handshake` | fatal to the connection it occurred on |
//! | `Protocol` | fatal to the connection it occurred on |
//! | `ServiceUnavailable` | reported to the caller or remote peer |
//! | `Shutdown` | reported synchronously, no state change |
//! | `ConnectionClosed`, `Io` | dial/read/write failures; outbound links retry |

use thiserror::Error;

use crate::crypto::SignatureError;

#[derive(Error, Debug)]
pub enum Error {
    /// Signature mismatch, duplicate handshake or failed key exchange.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Malformed frame or a reference to an unregistered stream.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("no provider available for services {0:?}")]
    ServiceUnavailable(Vec<String>),

    #[error("node is shut down")]
    Shutdown,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Whether this error originated in the transport rather than in the peer's behaviour.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::Io(_))
    }
}

impl From<SignatureError> for Error {
    fn from(err: SignatureError) -> Self {
        Error::Handshake(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
