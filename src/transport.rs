//! # Byte-Stream Transport
//!
//! The node runs its session layer over any reliable, ordered, bidirectional
//! byte stream. This module defines that seam and the default TCP backing.
//!
//! ```text
//! ┌──────────┐  connect/bind   ┌───────────┐
//! │   Node   │ ──────────────► │ Transport │ ──► TcpStream
//! └──────────┘                 └─────┬─────┘
//!                                    │ accept
//!                              ┌─────▼─────┐
//!                              │ Listener  │ ──► (BoxedConnection, peer addr)
//!                              └───────────┘
//! ```
//!
//! No encryption happens here; confidentiality and integrity are provided by
//! [`crate::session`] on top of whatever stream the transport yields.

use std::fmt::Debug;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// A connected byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedConnection = Box<dyn Connection>;

#[async_trait]
pub trait Listener: Send + Sync + Debug {
    /// Wait for the next inbound connection and the remote address it came from.
    async fn accept(&self) -> io::Result<(BoxedConnection, String)>;

    /// The address actually bound, with any `:0` port resolved.
    fn local_addr(&self) -> io::Result<String>;
}

#[async_trait]
pub trait Transport: Send + Sync + Debug + 'static {
    async fn connect(&self, addr: &str) -> io::Result<BoxedConnection>;

    async fn bind(&self, addr: &str) -> io::Result<Box<dyn Listener>>;
}

/// Plain TCP with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &str) -> io::Result<BoxedConnection> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn bind(&self, addr: &str) -> io::Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpAcceptor { listener }))
    }
}

#[derive(Debug)]
struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> io::Result<(BoxedConnection, String)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), remote.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.listener.local_addr()?.to_string())
    }
}
