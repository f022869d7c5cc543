//! Handshake server accepting connections from other contexts.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use doomberg_ipc_core::{
    BufferedEmitter, ConnectionIdentity, Delivery, Envelope, EnvelopeFilter, HandshakeMessage,
    MessagePassingProtocol, MessagePort, MessageType, TabId, from_message_emitter,
};
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::protocol::Protocol;

/// Identifier of one accepted connection. A source that reconnects gets a
/// new one.
pub type ConnectionId = u64;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Context identifier clients address their hello to.
    pub id: String,
    /// Broadcast a reconnect announcement when the server starts.
    #[serde(default = "default_announce")]
    pub announce_on_start: bool,
    /// How long a source may sit between hello and identifier frame.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

const fn default_announce() -> bool {
    true
}

const fn default_handshake_timeout_ms() -> u64 {
    5_000
}

impl ServerConfig {
    /// Create a config for server `id` with defaults.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            announce_on_start: default_announce(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClosed {
    /// The client sent a disconnect frame, or the server disconnected it.
    Disconnected,
    /// A newer hello from the same source replaced this connection.
    Superseded,
    /// The connection was dropped from the server without notifying the peer.
    Removed,
    /// The server was disposed.
    ServerDisposed,
}

/// Decides whether a client may connect.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check the identifier a client presented.
    ///
    /// # Errors
    /// Returns the rejection reason sent back to the client.
    async fn authenticate(&self, source: &str, auth: &str) -> Result<(), String>;
}

/// Authenticator that lets every client in.
#[derive(Debug, Default, Clone)]
pub struct AcceptAll;

#[async_trait]
impl Authenticator for AcceptAll {
    async fn authenticate(&self, _source: &str, _auth: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Published once per accepted connection.
#[derive(Clone)]
pub struct ClientConnectionEvent {
    /// Server-assigned id, unique per accepted connection.
    pub connection_id: ConnectionId,
    /// Source identifier of the client context.
    pub source: String,
    /// Identifier presented in the handshake.
    pub client_id: String,
    /// Tab hosting the client, if any.
    pub tab_id: Option<TabId>,
    pub protocol: Arc<Protocol>,
    closed: watch::Receiver<Option<ConnectionClosed>>,
}

impl ClientConnectionEvent {
    /// Wait until this connection ends.
    pub async fn closed(&self) -> ConnectionClosed {
        let mut rx = self.closed.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ConnectionClosed::ServerDisposed),
            Err(_) => ConnectionClosed::ServerDisposed,
        }
    }

    /// Whether the connection has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Per-connection disconnect event; yields once.
    #[must_use]
    pub fn on_did_client_disconnect(&self) -> BoxStream<'static, ConnectionClosed> {
        let this = self.clone();
        futures::stream::once(async move { this.closed().await }).boxed()
    }
}

struct PendingClient {
    connection_id: ConnectionId,
    since: Instant,
    tab_id: Option<TabId>,
    protocol: Arc<Protocol>,
}

struct ActiveClient {
    connection_id: ConnectionId,
    protocol: Arc<Protocol>,
    closed: watch::Sender<Option<ConnectionClosed>>,
}

impl ActiveClient {
    fn close(&self, reason: ConnectionClosed) {
        self.closed.send_replace(Some(reason));
        self.protocol.mark_closed();
    }
}

#[derive(Default)]
struct ServerState {
    pending: HashMap<String, PendingClient>,
    /// Sources whose identifier frame is being checked. Frames arriving
    /// meanwhile queue on the connection's protocol.
    authenticating: HashMap<String, (ConnectionId, Arc<Protocol>)>,
    active: HashMap<String, ActiveClient>,
}

struct ServerInner {
    config: ServerConfig,
    port: Arc<dyn MessagePort>,
    authenticator: Arc<dyn Authenticator>,
    state: Mutex<ServerState>,
    connections: BufferedEmitter<ClientConnectionEvent>,
    next_connection: AtomicU64,
    cancel: CancellationToken,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Accepts hello handshakes addressed to its id and hands out one
/// [`Protocol`] per connected source.
///
/// All connection state belongs to the instance; two servers on the same
/// bus with different ids do not see each other's clients.
#[derive(Clone)]
pub struct MessageServer {
    inner: Arc<ServerInner>,
}

impl MessageServer {
    /// Start a server that accepts every client.
    #[must_use]
    pub fn start(config: ServerConfig, port: Arc<dyn MessagePort>) -> Self {
        Self::with_authenticator(config, port, Arc::new(AcceptAll))
    }

    /// Start a server that checks clients with `authenticator`.
    #[must_use]
    pub fn with_authenticator(
        config: ServerConfig,
        port: Arc<dyn MessagePort>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let deliveries =
            from_message_emitter(port.as_ref(), EnvelopeFilter::any().target(config.id.clone()));

        let inner = Arc::new(ServerInner {
            config,
            port,
            authenticator,
            state: Mutex::new(ServerState::default()),
            connections: BufferedEmitter::new(),
            next_connection: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run(
            Arc::downgrade(&inner),
            deliveries,
            inner.config.handshake_timeout(),
            inner.cancel.clone(),
        ));

        let server = Self { inner };
        tracing::info!(id = %server.id(), "Message server started");
        if server.inner.config.announce_on_start {
            server.announce_reconnect();
        }
        server
    }

    /// Context identifier this server answers to.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// Connection events. The first listener also receives connections
    /// accepted before it subscribed.
    #[must_use]
    pub fn on_did_client_connect(&self) -> BoxStream<'static, ClientConnectionEvent> {
        self.inner.connections.event()
    }

    /// Ask every listening client to replay its handshake.
    pub fn announce_reconnect(&self) {
        if let Err(e) = self.inner.port.post(Envelope::reconnect(self.id()), None) {
            tracing::debug!(id = %self.id(), "Reconnect announcement not delivered: {e}");
        }
    }

    /// Disconnect `source` if `connection_id` is still its current connection.
    ///
    /// Returns whether a connection was closed.
    pub fn disconnect_client(&self, source: &str, connection_id: ConnectionId) -> bool {
        let Some(client) = self.take_current(source, connection_id) else {
            tracing::debug!(source, connection_id, "Disconnect for stale connection ignored");
            return false;
        };
        client.protocol.disconnect();
        client.close(ConnectionClosed::Disconnected);
        tracing::info!(source, connection_id, "Client disconnected by server");
        true
    }

    /// Drop `source` without notifying it, if `connection_id` is still current.
    pub fn forget(&self, source: &str, connection_id: ConnectionId) -> bool {
        let Some(client) = self.take_current(source, connection_id) else {
            return false;
        };
        client.close(ConnectionClosed::Removed);
        tracing::debug!(source, connection_id, "Client removed");
        true
    }

    fn take_current(&self, source: &str, connection_id: ConnectionId) -> Option<ActiveClient> {
        let mut state = self.inner.state.lock();
        match state.active.get(source) {
            Some(client) if client.connection_id == connection_id => state.active.remove(source),
            _ => None,
        }
    }

    /// Whether `source` has a live connection.
    #[must_use]
    pub fn is_connected(&self, source: &str) -> bool {
        self.inner.state.lock().active.contains_key(source)
    }

    /// Number of live connections.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// Sources with a live connection.
    #[must_use]
    pub fn sources(&self) -> Vec<String> {
        self.inner.state.lock().active.keys().cloned().collect()
    }

    /// Stop accepting frames and close every connection.
    pub fn dispose(&self) {
        self.inner.cancel.cancel();
        let drained: Vec<(String, ActiveClient)> = {
            let mut state = self.inner.state.lock();
            state.pending.clear();
            state.authenticating.clear();
            state.active.drain().collect()
        };
        for (source, client) in drained {
            client.protocol.disconnect();
            client.close(ConnectionClosed::ServerDisposed);
            tracing::debug!(%source, "Connection closed by server dispose");
        }
        tracing::info!(id = %self.id(), "Message server disposed");
    }
}

async fn run(
    server: Weak<ServerInner>,
    mut deliveries: BoxStream<'static, Delivery>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut sweep = tokio::time::interval(handshake_timeout.max(Duration::from_millis(10)));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let delivery = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = deliveries.next() => match next {
                Some(delivery) => Some(delivery),
                None => break,
            },
            _ = sweep.tick() => None,
        };
        let Some(server) = server.upgrade() else {
            break;
        };
        match delivery {
            Some(delivery) => server.handle(delivery),
            None => server.expire_pending(handshake_timeout),
        }
    }
}

impl ServerInner {
    /// Drop sources that said hello but never sent their identifier.
    fn expire_pending(&self, timeout: Duration) {
        let expired: Vec<(String, PendingClient)> = {
            let mut state = self.state.lock();
            let stale: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, pending)| pending.since.elapsed() >= timeout)
                .map(|(source, _)| source.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|source| state.pending.remove_entry(&source))
                .collect()
        };
        for (source, pending) in expired {
            tracing::warn!(
                %source,
                connection_id = pending.connection_id,
                ?timeout,
                "No identifier frame after hello, dropping pending connection"
            );
        }
    }

    fn handle(self: &Arc<Self>, delivery: Delivery) {
        let Delivery { envelope, sender } = delivery;
        match envelope.kind {
            MessageType::Hello => self.on_hello(envelope.source, sender.tab_id),
            MessageType::Message => self.on_message(envelope),
            MessageType::Disconnect => self.on_disconnect(&envelope),
            MessageType::Reconnect => {}
        }
    }

    fn on_hello(&self, source: String, tab_id: Option<TabId>) {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let protocol = Arc::new(Protocol::new(
            Arc::clone(&self.port),
            ConnectionIdentity::new(self.config.id.clone(), source.clone()),
            tab_id,
        ));

        let superseded = {
            let mut state = self.state.lock();
            state.authenticating.remove(&source);
            state.pending.insert(
                source.clone(),
                PendingClient {
                    connection_id,
                    since: Instant::now(),
                    tab_id,
                    protocol,
                },
            );
            state.active.remove(&source)
        };

        if let Some(previous) = superseded {
            previous.close(ConnectionClosed::Superseded);
            tracing::info!(
                %source,
                previous = previous.connection_id,
                connection_id,
                "Hello from connected source, superseding previous connection"
            );
        } else {
            tracing::debug!(%source, ?tab_id, connection_id, "Hello received");
        }
    }

    fn on_message(self: &Arc<Self>, envelope: Envelope) {
        let (pending, protocol) = {
            let mut state = self.state.lock();
            match state.pending.remove(&envelope.source) {
                Some(pending) => {
                    state.authenticating.insert(
                        envelope.source.clone(),
                        (pending.connection_id, Arc::clone(&pending.protocol)),
                    );
                    (Some(pending), None)
                }
                None => (
                    None,
                    state
                        .active
                        .get(&envelope.source)
                        .map(|client| Arc::clone(&client.protocol))
                        .or_else(|| {
                            state
                                .authenticating
                                .get(&envelope.source)
                                .map(|(_, protocol)| Arc::clone(protocol))
                        }),
                ),
            }
        };

        if let Some(pending) = pending {
            self.spawn_authentication(envelope, pending);
            return;
        }
        match protocol {
            Some(protocol) => protocol.deliver(envelope),
            None => {
                tracing::debug!(source = %envelope.source, "Dropping frame from unconnected source");
            }
        }
    }

    /// Check the identifier frame off the receive loop so a slow
    /// authenticator does not hold up other sources.
    fn spawn_authentication(self: &Arc<Self>, envelope: Envelope, pending: PendingClient) {
        let server = Arc::downgrade(self);
        let authenticator = Arc::clone(&self.authenticator);

        tokio::spawn(async move {
            let source = envelope.source;
            let verdict = match HandshakeMessage::decode(&envelope.body) {
                Ok(HandshakeMessage::Auth { auth }) => authenticator
                    .authenticate(&source, &auth)
                    .await
                    .map(|()| auth),
                Ok(other) => Err(format!("expected auth frame, got {}", other.tag())),
                Err(e) => Err(format!("malformed handshake frame: {e}")),
            };
            if let Some(server) = server.upgrade() {
                server.complete_handshake(source, pending, verdict);
            }
        });
    }

    /// Apply an authentication verdict if `pending` is still the source's
    /// current connection.
    fn complete_handshake(
        &self,
        source: String,
        pending: PendingClient,
        verdict: Result<String, String>,
    ) {
        if self.cancel.is_cancelled() {
            return;
        }

        let outcome = {
            let mut state = self.state.lock();
            let current = matches!(
                state.authenticating.get(&source),
                Some((id, _)) if *id == pending.connection_id
            );
            if !current {
                drop(state);
                tracing::debug!(
                    %source,
                    connection_id = pending.connection_id,
                    "Handshake outcome for replaced connection dropped"
                );
                return;
            }
            state.authenticating.remove(&source);
            verdict.map(|client_id| {
                let (closed_tx, closed_rx) = watch::channel(None);
                let previous = state.active.insert(
                    source.clone(),
                    ActiveClient {
                        connection_id: pending.connection_id,
                        protocol: Arc::clone(&pending.protocol),
                        closed: closed_tx,
                    },
                );
                let event = ClientConnectionEvent {
                    connection_id: pending.connection_id,
                    source: source.clone(),
                    client_id,
                    tab_id: pending.tab_id,
                    protocol: Arc::clone(&pending.protocol),
                    closed: closed_rx,
                };
                (event, previous)
            })
        };

        let (event, previous) = match outcome {
            Ok(accepted) => accepted,
            Err(reason) => {
                reject(&pending.protocol, reason);
                return;
            }
        };
        if let Some(previous) = previous {
            previous.close(ConnectionClosed::Superseded);
        }

        match HandshakeMessage::Ok.encode() {
            Ok(ack) => pending.protocol.send(ack.into()),
            Err(e) => tracing::warn!(%source, "Failed to encode acknowledgement: {e}"),
        }

        tracing::info!(
            %source,
            client_id = %event.client_id,
            tab_id = ?event.tab_id,
            connection_id = event.connection_id,
            "Client connected"
        );
        self.connections.retain(|connection| !connection.is_closed());
        self.connections.fire(event);
    }

    fn on_disconnect(&self, envelope: &Envelope) {
        let (active, pending, authenticating) = {
            let mut state = self.state.lock();
            (
                state.active.remove(&envelope.source),
                state.pending.remove(&envelope.source),
                state.authenticating.remove(&envelope.source),
            )
        };

        if let Some(client) = active {
            client.close(ConnectionClosed::Disconnected);
            tracing::info!(
                source = %envelope.source,
                connection_id = client.connection_id,
                "Client disconnected"
            );
        } else if pending.is_none() && authenticating.is_none() {
            tracing::debug!(source = %envelope.source, "Disconnect from unknown source ignored");
        }
    }
}

fn reject(protocol: &Protocol, reason: String) {
    tracing::warn!(source = %protocol.identity().target, %reason, "Handshake failed");
    match (HandshakeMessage::Error { reason }).encode() {
        Ok(body) => protocol.send(body.into()),
        Err(e) => tracing::warn!("Failed to encode handshake error: {e}"),
    }
}
