//! # High-Level Node API
//!
//! A [`Node`] ties the layers together: it owns the routing table, the
//! service registry, every live connection and listener, and the handlers for
//! the services it serves.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::start(
//!     NodeConfig::default()
//!         .with_secret_key(generate_secret_key())
//!         .service("echo", |ctx: Context| async move {
//!             Ok(Reply::new(ctx.body.bytes().await?))
//!         }),
//! )
//! .await?;
//!
//! let other = Node::start(NodeConfig::default().bootstrap(node.local_addrs().await[0].clone())).await?;
//! let response = other.push(&["echo".into()], Headers::new(), b"hi").await?;
//! assert_eq!(response.bytes().await?, b"hi");
//! ```
//!
//! ## Connection Lifecycle
//!
//! ```text
//! connect(addr) ──► transport dial ──► key exchange ──► Handshake request
//!                                                         │
//!              routing table + service registry ◄── verify reply
//!                                                         │
//!                     read loop ... peer closes ──► cleanup ──► reconnect?
//! ```
//!
//! Only links this node dialed and completed a handshake on are re-dialed
//! after they drop, every [`RECONNECT_DELAY`] for at most
//! [`RECONNECT_ATTEMPTS`] attempts, and never once the node is shut down.
//!
//! ## Shared State
//!
//! All mutable orchestration state lives behind one lock in `NodeState`;
//! connection read loops and the public methods below take it briefly and
//! never hold it across network I/O.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::{split_host_port, Identity, Keypair, PublicKey, SecretKey};
use crate::messages::{HandshakePacket, Headers, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::protocols::{Handler, Response};
use crate::provider::{self, Provider};
use crate::registry::ServiceRegistry;
use crate::routing::{RoutingTable, DEFAULT_K};
use crate::rpc;
use crate::session::{client_handshake, server_handshake};
use crate::transport::{BoxedConnection, Listener, TcpTransport, Transport};

/// Pause before each reconnection attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Reconnection attempts before a dropped outbound link is given up.
pub const RECONNECT_ATTEMPTS: u32 = 8;

/// Bind address used when a keyed node is given neither bind nor public addresses.
pub const AUTO_BIND_ADDR: &str = "127.0.0.1:0";

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================================================
// Configuration
// ============================================================================

pub struct NodeConfig {
    /// Address advertised in our identity; also bound if `bind_addrs` is empty.
    pub public_addr: Option<String>,
    pub bind_addrs: Vec<String>,
    /// Bootstrap peers.
    pub addrs: Vec<String>,
    /// Without a key the node is anonymous: it can dial out but not be dialed.
    pub secret_key: Option<SecretKey>,
    pub services: BTreeMap<String, Arc<dyn Handler>>,
    pub chunk_size: usize,
    pub transport: Arc<dyn Transport>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            public_addr: None,
            bind_addrs: Vec::new(),
            addrs: Vec::new(),
            secret_key: None,
            services: BTreeMap::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            transport: Arc::new(TcpTransport),
        }
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("public_addr", &self.public_addr)
            .field("bind_addrs", &self.bind_addrs)
            .field("addrs", &self.addrs)
            .field("secret_key", &self.secret_key)
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("chunk_size", &self.chunk_size)
            .field("transport", &self.transport)
            .finish()
    }
}

impl NodeConfig {
    pub fn with_public_addr(mut self, addr: impl Into<String>) -> Self {
        self.public_addr = Some(addr.into());
        self
    }

    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind_addrs.push(addr.into());
        self
    }

    pub fn bootstrap(mut self, addr: impl Into<String>) -> Self {
        self.addrs.push(addr.into());
        self
    }

    pub fn with_secret_key(mut self, secret: SecretKey) -> Self {
        self.secret_key = Some(secret);
        self
    }

    pub fn service(mut self, name: impl Into<String>, handler: impl Handler) -> Self {
        self.services.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }
}

// ============================================================================
// Node
// ============================================================================

struct ListenerHandle {
    addr: String,
    task: JoinHandle<()>,
}

/// One slot per canonical dial address; holding its lock serializes dials.
type DialSlot = Arc<Mutex<Option<Arc<Provider>>>>;

struct NodeState {
    identity: Option<Identity>,
    routing: RoutingTable,
    registry: ServiceRegistry<Arc<Provider>>,
    providers: BTreeMap<u64, Arc<Provider>>,
    dials: HashMap<[u8; 32], DialSlot>,
    listeners: Vec<ListenerHandle>,
    handlers: BTreeMap<String, Arc<dyn Handler>>,
    shut_down: bool,
}

impl NodeState {
    /// Drop the dial slot for `addr` unless a dial holds it or its connection is live.
    fn prune_dial(&mut self, addr: &str) {
        let Ok(key) = dial_key(addr) else {
            return;
        };
        let stale = self.dials.get(&key).is_some_and(|slot| {
            slot.try_lock()
                .is_ok_and(|current| current.as_ref().is_none_or(|p| !p.is_live()))
        });
        if stale {
            self.dials.remove(&key);
        }
    }
}

struct NodeInner {
    keypair: Option<Keypair>,
    chunk_size: usize,
    transport: Arc<dyn Transport>,
    next_conn_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    state: Mutex<NodeState>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("public_key", &self.public_key())
            .field("chunk_size", &self.inner.chunk_size)
            .finish_non_exhaustive()
    }
}

/// Canonical hash of a dial address, used to deduplicate connections.
fn dial_key(addr: &str) -> Result<[u8; 32]> {
    let (host, port) = split_host_port(addr)?;
    let canonical = format!("{}:{}", host.to_ascii_lowercase(), port);
    Ok(*blake3::hash(canonical.as_bytes()).as_bytes())
}

impl Node {
    /// Start a node: bind listeners and derive our identity if keyed, then
    /// connect to the bootstrap peers and run [`Node::bootstrap`].
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let keypair = config
            .secret_key
            .as_ref()
            .map(Keypair::from_secret_key)
            .transpose()?;
        let (shutdown_tx, _) = watch::channel(false);

        let node = Node {
            inner: Arc::new(NodeInner {
                chunk_size: config.chunk_size.clamp(1, MAX_CHUNK_SIZE),
                transport: config.transport.clone(),
                next_conn_id: AtomicU64::new(1),
                shutdown_tx,
                state: Mutex::new(NodeState {
                    identity: None,
                    routing: RoutingTable::new(keypair.as_ref().map(Keypair::public_key), DEFAULT_K),
                    registry: ServiceRegistry::new(),
                    providers: BTreeMap::new(),
                    dials: HashMap::new(),
                    listeners: Vec::new(),
                    handlers: config.services.clone(),
                    shut_down: false,
                }),
                keypair,
            }),
        };

        if let Some(keypair) = &node.inner.keypair
            && let Err(err) = node.bind_identity(&config, keypair.public_key()).await
        {
            let _ = node.shutdown().await;
            return Err(err);
        }

        for addr in &config.addrs {
            if let Err(err) = node.connect(addr).await {
                warn!(addr = %addr, error = %err, "bootstrap peer unreachable");
            }
        }
        if !config.addrs.is_empty() {
            node.bootstrap().await?;
        }
        Ok(node)
    }

    async fn bind_identity(&self, config: &NodeConfig, key: PublicKey) -> Result<()> {
        let bind_addrs = if !config.bind_addrs.is_empty() {
            config.bind_addrs.clone()
        } else if let Some(public) = &config.public_addr {
            vec![public.clone()]
        } else {
            vec![AUTO_BIND_ADDR.to_string()]
        };

        let mut bound = Vec::with_capacity(bind_addrs.len());
        for addr in &bind_addrs {
            bound.push(self.listen(addr).await?);
        }

        let advertised = match (&config.public_addr, bound.first()) {
            (Some(public), _) => public.clone(),
            (None, Some(first)) => first.clone(),
            (None, None) => return Err(Error::InvalidAddress("no address to advertise".into())),
        };
        let identity = Identity::with_addr(key, &advertised)?;
        info!(key = %key.short(), addr = %identity.addr(), "node identity ready");
        self.inner.state.lock().await.identity = Some(identity);
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn public_key(&self) -> Option<PublicKey> {
        self.inner.keypair.as_ref().map(Keypair::public_key)
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.inner.state.lock().await.identity.clone()
    }

    /// Addresses of every active listener.
    pub async fn local_addrs(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.listeners.iter().map(|l| l.addr.clone()).collect()
    }

    /// Snapshot of the routing table.
    pub async fn peers(&self) -> Vec<Identity> {
        self.inner.state.lock().await.routing.identities()
    }

    /// Every live connection, in connection order.
    pub async fn providers(&self) -> Vec<Arc<Provider>> {
        self.inner.state.lock().await.providers.values().cloned().collect()
    }

    pub async fn is_shut_down(&self) -> bool {
        self.inner.state.lock().await.shut_down
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Connect to `addr`, or return the live connection already established
    /// (or being established) to the same address.
    pub async fn connect(&self, addr: &str) -> Result<Arc<Provider>> {
        let key = dial_key(addr)?;
        let slot = {
            let mut state = self.inner.state.lock().await;
            if state.shut_down {
                return Err(Error::Shutdown);
            }
            state.dials.entry(key).or_default().clone()
        };

        let mut current = slot.lock().await;
        if let Some(provider) = current.as_ref()
            && provider.is_live()
        {
            return Ok(Arc::clone(provider));
        }
        match self.dial(addr).await {
            Ok(provider) => {
                *current = Some(Arc::clone(&provider));
                Ok(provider)
            }
            Err(err) => {
                *current = None;
                drop(current);
                self.inner.state.lock().await.prune_dial(addr);
                Err(err)
            }
        }
    }

    /// [`Node::connect`] behind a concrete future type, for callers spawned
    /// from inside a connection's own lifecycle.
    fn connect_boxed(&self, addr: String) -> BoxFuture<'_, Result<Arc<Provider>>> {
        Box::pin(async move { self.connect(&addr).await })
    }

    /// Reuse a live connection to `peer`'s key if we have one, else dial its address.
    async fn connect_to(&self, peer: &Identity) -> Result<Arc<Provider>> {
        let existing = {
            let state = self.inner.state.lock().await;
            state
                .providers
                .values()
                .find(|p| p.is_live() && p.key().as_ref() == Some(peer.key()))
                .cloned()
        };
        match existing {
            Some(provider) => Ok(provider),
            None => self.connect(&peer.addr()).await,
        }
    }

    async fn dial(&self, addr: &str) -> Result<Arc<Provider>> {
        let conn = self.inner.transport.connect(addr).await?;
        let session = client_handshake(conn).await?;
        let id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (provider, reader) = provider::from_session(id, addr.to_string(), true, session);

        self.track(&provider).await?;
        tokio::spawn(rpc::run_connection(self.clone(), Arc::clone(&provider), reader));

        let result = async {
            let ours = self.local_handshake(provider.binding()).await?;
            let theirs = provider.exchange_handshake(&ours).await?;
            let identity = theirs.verify(provider.binding())?.cloned();
            provider.complete_handshake(identity, theirs.services)
        }
        .await;

        if let Err(err) = result {
            warn!(addr = %addr, error = %err, "handshake failed");
            provider.close();
            provider.closed().await;
            return Err(err);
        }

        self.on_handshake(&provider).await;
        match provider.identity() {
            Some(peer) => info!(peer = %peer.key().short(), addr = %addr, "connected"),
            None => info!(addr = %addr, "connected to anonymous peer"),
        }
        Ok(provider)
    }

    async fn track(&self, provider: &Arc<Provider>) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.shut_down {
            return Err(Error::Shutdown);
        }
        state.providers.insert(provider.id(), Arc::clone(provider));
        Ok(())
    }

    /// Bind a listener on `addr` and serve inbound connections until shutdown.
    /// Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<String> {
        if self.is_shut_down().await {
            return Err(Error::Shutdown);
        }
        let listener = self.inner.transport.bind(addr).await?;
        let local = listener.local_addr()?;

        let mut state = self.inner.state.lock().await;
        if state.shut_down {
            return Err(Error::Shutdown);
        }
        let node = self.clone();
        let stop = self.inner.shutdown_tx.subscribe();
        let task = tokio::spawn(async move { node.accept_loop(listener, stop).await });
        state.listeners.push(ListenerHandle {
            addr: local.clone(),
            task,
        });
        info!(addr = %local, "listening");
        Ok(local)
    }

    async fn accept_loop(self, listener: Box<dyn Listener>, mut stop: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = rpc::signalled(&mut stop) => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((conn, remote)) => {
                    let node = self.clone();
                    tokio::spawn(async move { node.accept_connection(conn, remote).await });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
        debug!(addr = ?listener.local_addr().ok(), "listener closed");
    }

    async fn accept_connection(self, conn: BoxedConnection, remote: String) {
        let mut stop = self.inner.shutdown_tx.subscribe();
        let exchanged = tokio::select! {
            _ = rpc::signalled(&mut stop) => return,
            exchanged = server_handshake(conn) => exchanged,
        };
        let session = match exchanged {
            Ok(session) => session,
            Err(err) => {
                debug!(addr = %remote, error = %err, "key exchange failed");
                return;
            }
        };
        let id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (provider, reader) = provider::from_session(id, remote, false, session);
        if self.track(&provider).await.is_err() {
            return;
        }
        debug!(addr = %provider.addr(), "inbound connection");
        rpc::run_connection(self, provider, reader).await;
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Iterative lookup of our own key, starting from the closest peers we
    /// know. Each round queries its whole frontier concurrently; peers that
    /// fail are skipped. Returns every identity discovered.
    pub async fn bootstrap(&self) -> Result<Vec<Identity>> {
        let (target, mut frontier) = {
            let state = self.inner.state.lock().await;
            if state.shut_down {
                return Err(Error::Shutdown);
            }
            // Anonymous nodes look up a random key instead of their own.
            let target = state
                .routing
                .self_key()
                .copied()
                .unwrap_or_else(|| Keypair::generate().public_key());
            (target, state.routing.closest_to(&target, DEFAULT_K))
        };

        let mut visited: HashSet<PublicKey> = frontier.iter().map(|id| *id.key()).collect();
        visited.insert(target);
        let mut discovered = Vec::new();

        while !frontier.is_empty() {
            let mut round = JoinSet::new();
            for peer in frontier.drain(..) {
                let node = self.clone();
                round.spawn(async move {
                    let provider = node.connect_to(&peer).await?;
                    provider.find_node(target).await
                });
            }

            let mut next = Vec::new();
            while let Some(joined) = round.join_next().await {
                let found = match joined {
                    Ok(Ok(found)) => found,
                    Ok(Err(err)) => {
                        debug!(error = %err, "bootstrap query failed");
                        continue;
                    }
                    Err(err) => {
                        debug!(error = %err, "bootstrap query aborted");
                        continue;
                    }
                };
                for identity in found {
                    if visited.insert(*identity.key()) {
                        next.push(identity);
                    }
                }
            }

            if !next.is_empty() {
                let mut state = self.inner.state.lock().await;
                for identity in &next {
                    state.routing.update(identity.clone());
                }
            }
            discovered.extend(next.iter().cloned());
            frontier = next;
        }

        info!(discovered = discovered.len(), "bootstrap finished");
        Ok(discovered)
    }

    // ========================================================================
    // Services
    // ========================================================================

    /// Serve `name` with `handler`. Peers learn about it on their next handshake.
    pub async fn register_service(&self, name: impl Into<String>, handler: impl Handler) {
        let name = name.into();
        debug!(service = %name, "service registered");
        self.inner
            .state
            .lock()
            .await
            .handlers
            .insert(name, Arc::new(handler));
    }

    /// Send a request to the first provider of any of `services` and return its response.
    pub async fn push(&self, services: &[String], headers: Headers, body: &[u8]) -> Result<Response> {
        let provider = {
            let state = self.inner.state.lock().await;
            if state.shut_down {
                return Err(Error::Shutdown);
            }
            state.registry.first_for(services)
        }
        .ok_or_else(|| Error::ServiceUnavailable(services.to_vec()))?;

        debug!(addr = %provider.addr(), services = ?services, bytes = body.len(), "push");
        let response = provider
            .service_request(services, headers, body, self.inner.chunk_size)
            .await?;
        if !response.handled {
            return Err(Error::ServiceUnavailable(services.to_vec()));
        }
        Ok(response)
    }

    /// Providers advertising any of `services`, one per peer key. Anonymous
    /// peers have no key and are listed per connection.
    pub async fn providers_for(&self, services: &[String]) -> Vec<Arc<Provider>> {
        let state = self.inner.state.lock().await;
        let mut seen = HashSet::new();
        state
            .registry
            .providers_for(services)
            .into_iter()
            .filter(|(_, provider)| provider.key().is_none_or(|key| seen.insert(key)))
            .map(|(_, provider)| provider)
            .collect()
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Close every connection and listener and wait until they are gone.
    /// Fails if the node is already shut down.
    pub async fn shutdown(&self) -> Result<()> {
        let (providers, listeners) = {
            let mut state = self.inner.state.lock().await;
            if state.shut_down {
                return Err(Error::Shutdown);
            }
            state.shut_down = true;
            let providers: Vec<_> = state.providers.values().cloned().collect();
            let listeners: Vec<_> = state.listeners.drain(..).collect();
            (providers, listeners)
        };

        self.inner.shutdown_tx.send_replace(true);
        for provider in &providers {
            provider.close();
        }
        for listener in listeners {
            let _ = listener.task.await;
        }
        for provider in &providers {
            provider.closed().await;
        }
        info!(connections = providers.len(), "node shut down");
        Ok(())
    }

    // ========================================================================
    // Hooks used by the read loop
    // ========================================================================

    pub(crate) async fn local_handshake(&self, binding: &[u8; 32]) -> Result<HandshakePacket> {
        let (identity, services) = {
            let state = self.inner.state.lock().await;
            (state.identity.clone(), state.handlers.keys().cloned().collect())
        };
        match (identity, &self.inner.keypair) {
            (Some(identity), Some(keypair)) => {
                HandshakePacket::signed(identity, services, keypair, binding)
            }
            _ => Ok(HandshakePacket::anonymous(services)),
        }
    }

    pub(crate) async fn closest(&self, target: &PublicKey) -> Vec<Identity> {
        self.inner.state.lock().await.routing.closest_to(target, DEFAULT_K)
    }

    /// The first requested service we have a handler for.
    pub(crate) async fn handler_for(&self, services: &[String]) -> Option<(String, Arc<dyn Handler>)> {
        let state = self.inner.state.lock().await;
        services
            .iter()
            .find_map(|s| state.handlers.get(s).map(|h| (s.clone(), Arc::clone(h))))
    }

    pub(crate) async fn on_handshake(&self, provider: &Arc<Provider>) {
        let mut state = self.inner.state.lock().await;
        if let Some(identity) = provider.identity() {
            state.routing.update(identity);
        }
        let services = provider.services();
        state.registry.add(provider.id(), Arc::clone(provider), &services);
    }

    /// Forget a closed connection; re-dial it if it was an established
    /// outbound link that dropped on its own.
    pub(crate) async fn on_disconnect(&self, provider: &Arc<Provider>, lost: bool) {
        let reconnect = {
            let mut state = self.inner.state.lock().await;
            state.providers.remove(&provider.id());
            state.registry.remove(provider.id());
            if let Some(key) = provider.key() {
                let still_connected = state.providers.values().any(|p| p.key() == Some(key));
                if !still_connected {
                    state.routing.delete(&key);
                }
            }
            let reconnect =
                lost && !state.shut_down && provider.is_initiator() && provider.is_handshaked();
            if provider.is_initiator() && !reconnect {
                state.prune_dial(provider.addr());
            }
            reconnect
        };

        if reconnect {
            let node = self.clone();
            let addr = provider.addr().to_string();
            tokio::spawn(async move { node.reconnect(addr).await });
        }
    }

    async fn reconnect(self, addr: String) {
        let mut stop = self.inner.shutdown_tx.subscribe();
        for attempt in 1..=RECONNECT_ATTEMPTS {
            tokio::select! {
                _ = rpc::signalled(&mut stop) => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
            match self.connect_boxed(addr.clone()).await {
                Ok(_) => {
                    info!(addr = %addr, attempt, "reconnected");
                    return;
                }
                Err(Error::Shutdown) => return,
                Err(err) => debug!(addr = %addr, attempt, error = %err, "reconnect attempt failed"),
            }
        }
        warn!(addr = %addr, attempts = RECONNECT_ATTEMPTS, "giving up on peer");
        self.inner.state.lock().await.prune_dial(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_key_is_canonical() {
        assert_eq!(dial_key("LocalHost:80").unwrap(), dial_key("localhost:80").unwrap());
        assert_eq!(dial_key("[::1]:80").unwrap(), dial_key("::1:80").unwrap());
        assert_ne!(dial_key("localhost:80").unwrap(), dial_key("localhost:81").unwrap());
        assert!(dial_key("nope").is_err());
    }

    #[test]
    fn config_builder_and_defaults() {
        let config = NodeConfig::default()
            .bind("127.0.0.1:0")
            .bootstrap("127.0.0.1:1")
            .with_public_addr("example.org:9000")
            .with_chunk_size(0);
        assert_eq!(config.bind_addrs, vec!["127.0.0.1:0".to_string()]);
        assert_eq!(config.addrs, vec!["127.0.0.1:1".to_string()]);
        assert_eq!(config.public_addr.as_deref(), Some("example.org:9000"));
        assert_eq!(NodeConfig::default().chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(format!("{config:?}").contains("example.org"));
    }

    #[tokio::test]
    async fn anonymous_node_has_no_identity_or_listeners() {
        let node = Node::start(NodeConfig::default()).await.unwrap();
        assert!(node.identity().await.is_none());
        assert!(node.public_key().is_none());
        assert!(node.local_addrs().await.is_empty());
        let hs = node.local_handshake(&[0u8; 32]).await.unwrap();
        assert!(hs.identity.is_none() && hs.signature.is_none());
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn chunk_size_is_clamped() {
        let tiny = Node::start(NodeConfig::default().with_chunk_size(0)).await.unwrap();
        assert_eq!(tiny.chunk_size(), 1);
        let huge = Node::start(NodeConfig::default().with_chunk_size(usize::MAX)).await.unwrap();
        assert_eq!(huge.chunk_size(), MAX_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn keyed_node_advertises_public_addr() {
        let secret = crate::identity::generate_secret_key();
        let node = Node::start(
            NodeConfig::default()
                .with_secret_key(secret)
                .bind("127.0.0.1:0")
                .with_public_addr("203.0.113.7:4040"),
        )
        .await
        .unwrap();
        let identity = node.identity().await.unwrap();
        assert_eq!(identity.addr(), "203.0.113.7:4040");
        assert_eq!(Some(*identity.key()), node.public_key());

        let binding = [3u8; 32];
        let hs = node.local_handshake(&binding).await.unwrap();
        assert_eq!(hs.verify(&binding).unwrap(), Some(&identity));
        assert!(hs.verify(&[4u8; 32]).is_err());
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn handler_lookup_uses_request_order() {
        let node = Node::start(NodeConfig::default()).await.unwrap();
        node.register_service("b", |_ctx: crate::protocols::Context| async {
            Ok::<_, anyhow::Error>(crate::protocols::Reply::default())
        })
        .await;
        node.register_service("a", |_ctx: crate::protocols::Context| async {
            Ok::<_, anyhow::Error>(crate::protocols::Reply::default())
        })
        .await;
        let (service, _) = node
            .handler_for(&["missing".into(), "b".into(), "a".into()])
            .await
            .unwrap();
        assert_eq!(service, "b");
        assert!(node.handler_for(&["missing".into()]).await.is_none());
    }

    #[tokio::test]
    async fn dial_slots_are_released() {
        let a = Node::start(NodeConfig::default().with_secret_key(crate::identity::generate_secret_key()))
            .await
            .unwrap();
        let b = Node::start(NodeConfig::default()).await.unwrap();

        assert!(b.connect("127.0.0.1:1").await.is_err());
        assert!(b.inner.state.lock().await.dials.is_empty(), "failed dial leaves no slot");

        let provider = b.connect(&a.local_addrs().await[0]).await.unwrap();
        assert_eq!(b.inner.state.lock().await.dials.len(), 1);
        provider.close();
        provider.closed().await;
        assert!(b.inner.state.lock().await.dials.is_empty(), "closed link leaves no slot");

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
