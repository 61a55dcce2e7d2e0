//! Application-facing service handler seam.
//!
//! A node serves a set of named services. Each inbound ServiceRequest that
//! names one of them is handed to its [`Handler`] on a task of its own, so a
//! slow handler never stalls the connection's read loop.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Handler`] | serves one named service |
//! | [`Context`] | what the handler sees: service, headers, caller, request body |
//! | [`Reply`] | what the handler returns: headers and a response body |
//! | [`Response`] | what a requester receives back from `push`, body still streaming |
//!
//! Handler errors and panics never reach the read loop: they become a handled
//! response carrying an `error` header and the error message as body.

use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::Identity;
use crate::messages::Headers;
use crate::stream::Body;

/// Header set on responses produced from a failed handler.
pub const ERROR_HEADER: &str = "error";

/// A service request as seen by its handler.
#[derive(Debug)]
pub struct Context {
    /// The service that matched, out of the candidates the caller listed.
    pub service: String,
    pub headers: Headers,
    /// The caller's verified identity, absent for anonymous peers.
    pub peer: Option<Identity>,
    pub body: Body,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub(crate) fn from_error(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        Self::new(message.clone()).with_header(ERROR_HEADER, message)
    }
}

/// A remote peer's answer to a service request. It is handed back as soon as
/// the headers arrive; `body` yields the chunks as they follow.
#[derive(Debug, Default)]
pub struct Response {
    /// False when the peer had no handler for any requested service.
    pub handled: bool,
    pub headers: Headers,
    pub body: Body,
}

impl Response {
    /// The remote handler's error message, if it failed.
    pub fn error(&self) -> Option<&str> {
        self.headers.get(ERROR_HEADER).map(String::as_str)
    }

    /// Wait for the rest of the body and collect it.
    pub async fn bytes(self) -> crate::error::Result<Vec<u8>> {
        self.body.bytes().await
    }
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: Context) -> Result<Reply>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply>> + Send + 'static,
{
    async fn handle(&self, ctx: Context) -> Result<Reply> {
        (self)(ctx).await
    }
}
