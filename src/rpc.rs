//! # Connection Read Loop and Opcode Dispatch
//!
//! Every live connection runs exactly one read loop. Frames are decoded and
//! dispatched strictly in receipt order: the effects of frame *i* (routing
//! table or registry mutation, stream delivery) complete before frame *i+1*
//! is read. The one exception is a ServiceRequest, whose handler runs on a
//! task of its own so that requests can be pipelined on one connection.
//!
//! ## Dispatch Table
//!
//! | Opcode | Precondition | Effect |
//! |--------|--------------|--------|
//! | Handshake | acceptor, not handshaked | verify, record peer, register, reply with ours (same seq) |
//! | Handshake | dialer | resolves our pending handshake request |
//! | Handshake | already handshaked | fatal: duplicate handshake |
//! | FindNodeRequest | any | reply with the closest K identities (same seq) |
//! | FindNodeResponse | matching pending seq | resolves the pending request |
//! | ServiceRequest | any | open inbound stream; `handled=false` or spawn handler |
//! | ServiceResponse | stream registered | deliver headers to the waiting requester |
//! | Data | stream open | append chunk, empty chunk ends the stream |
//!
//! Any error returned by dispatch itself terminates the connection. Handler
//! errors are not dispatch errors: they become an error response.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::messages::{
    DataPacket, FindNodeRequest, FindNodeResponse, Frame, HandshakePacket, Opcode,
    ServiceRequestPacket, ServiceResponsePacket,
};
use crate::node::Node;
use crate::protocols::{Context, Reply};
use crate::provider::{ConnReader, Provider};

/// Resolve once `rx` reads `true`.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Drive one connection until the peer closes it, a dispatch error occurs, or
/// the provider is asked to close.
pub(crate) async fn run_connection(node: Node, provider: Arc<Provider>, mut reader: ConnReader) {
    let mut shutdown = provider.shutdown_signal();

    let outcome: Result<()> = loop {
        let next = tokio::select! {
            _ = signalled(&mut shutdown) => break Ok(()),
            next = reader.read_frame() => next,
        };
        match next {
            Ok(Some(frame)) => {
                if let Err(err) = dispatch(&node, &provider, frame).await {
                    break Err(err);
                }
            }
            Ok(None) => break Err(Error::ConnectionClosed),
            Err(err) => break Err(err),
        }
    };

    match &outcome {
        Ok(()) => debug!(addr = %provider.addr(), "connection closed locally"),
        Err(err) if err.is_connection_error() => {
            debug!(addr = %provider.addr(), error = %err, "connection lost")
        }
        Err(err) => warn!(addr = %provider.addr(), error = %err, "dropping connection"),
    }

    provider.teardown().await;
    drop(reader);
    node.on_disconnect(&provider, outcome.is_err()).await;
    provider.finish();
}

async fn dispatch(node: &Node, provider: &Arc<Provider>, frame: Frame) -> Result<()> {
    match frame.opcode {
        Opcode::Handshake => handle_handshake(node, provider, frame).await,
        Opcode::FindNodeRequest => {
            let request = frame.packet::<FindNodeRequest>()?;
            let nodes = node.closest(&request.target).await;
            debug!(addr = %provider.addr(), found = nodes.len(), "answering find_node");
            provider
                .send_packet(frame.seq, &FindNodeResponse { nodes })
                .await
        }
        Opcode::FindNodeResponse => provider
            .pending
            .resolve(frame)
            .await
            .map_err(|f| Error::protocol(format!("unsolicited find_node response seq {}", f.seq))),
        Opcode::ServiceRequest => handle_service_request(node, provider, frame).await,
        Opcode::ServiceResponse => {
            let response = frame.packet::<ServiceResponsePacket>()?;
            provider
                .streams
                .pull(response.stream, response.handled, response.headers)
                .await
        }
        Opcode::Data => {
            let data = frame.packet::<DataPacket>()?;
            provider.streams.recv(data.stream, data.chunk).await
        }
    }
}

async fn handle_handshake(node: &Node, provider: &Arc<Provider>, frame: Frame) -> Result<()> {
    if provider.is_handshaked() {
        return Err(Error::handshake("duplicate handshake"));
    }

    if provider.is_initiator() {
        // Our own handshake request is the only one a dialer expects an answer to.
        return provider
            .pending
            .resolve(frame)
            .await
            .map_err(|_| Error::handshake("unexpected handshake from acceptor"));
    }

    let theirs = frame.packet::<HandshakePacket>()?;
    let identity = theirs.verify(provider.binding())?.cloned();
    provider.complete_handshake(identity, theirs.services)?;
    node.on_handshake(provider).await;

    let ours = node.local_handshake(provider.binding()).await?;
    provider.send_packet(frame.seq, &ours).await?;

    match provider.identity() {
        Some(peer) => info!(peer = %peer.key().short(), addr = %peer.addr(), "peer handshaked"),
        None => info!(addr = %provider.addr(), "anonymous peer handshaked"),
    }
    Ok(())
}

async fn handle_service_request(node: &Node, provider: &Arc<Provider>, frame: Frame) -> Result<()> {
    let request = frame.packet::<ServiceRequestPacket>()?;
    let stream = request.stream;
    let body = provider.streams.accept(stream).await?;

    let Some((service, handler)) = node.handler_for(&request.services).await else {
        // The stream stays open until the requester's body has been absorbed.
        debug!(addr = %provider.addr(), stream, services = ?request.services, "no local handler");
        return provider
            .send_packet(0, &ServiceResponsePacket {
                stream,
                handled: false,
                headers: Default::default(),
            })
            .await;
    };

    let ctx = Context {
        service,
        headers: request.headers,
        peer: provider.identity(),
        body,
    };
    let provider = Arc::clone(provider);
    let chunk_size = node.chunk_size();
    tokio::spawn(async move {
        // The handler runs on a task of its own so a panic still gets answered.
        let reply = match tokio::spawn(async move { handler.handle(ctx).await }).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                warn!(addr = %provider.addr(), stream, error = %err, "service handler failed");
                Reply::from_error(&err)
            }
            Err(err) => {
                let what = if err.is_panic() { "panicked" } else { "was cancelled" };
                warn!(addr = %provider.addr(), stream, "service handler {what}");
                Reply::from_error(&anyhow::anyhow!("service handler {what}"))
            }
        };
        let sent = async {
            provider
                .send_packet(0, &ServiceResponsePacket {
                    stream,
                    handled: true,
                    headers: reply.headers,
                })
                .await?;
            provider.send_body(stream, &reply.body, chunk_size).await
        }
        .await;
        if let Err(err) = sent {
            debug!(addr = %provider.addr(), stream, error = %err, "failed to send service response");
        }
    });
    Ok(())
}
