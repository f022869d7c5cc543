//! Handshake client: the initiating side of a connection.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use doomberg_ipc_core::{
    ConnectionIdentity, Delivery, Envelope, EnvelopeFilter, HandshakeError, HandshakeMessage,
    MessagePassingProtocol, MessagePort, MessageType, TransportError, from_message_emitter,
};
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::Protocol;

const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// This context's source identifier. Unique per context instance.
    pub source: String,
    /// Server context identifier.
    pub target: String,
    /// Identifier presented in the handshake.
    pub client_id: String,
    /// How long to wait for the server's acknowledgement.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

const fn default_ack_timeout_ms() -> u64 {
    DEFAULT_ACK_TIMEOUT_MS
}

impl ClientConfig {
    /// Config with a fresh `<client_id>-<uuid>` source.
    #[must_use]
    pub fn new(target: impl Into<String>, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            source: format!("{client_id}-{}", Uuid::new_v4()),
            target: target.into(),
            client_id,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
        }
    }

    /// Use a fixed source identifier, e.g. to resume as the same context.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Acknowledgement timeout as a [`Duration`].
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Client handshake state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Init,
    HelloSent,
    IdentifierSent,
    AwaitingAck,
    Ready,
    Rejected(String),
    Disconnected,
}

impl ClientState {
    const fn is_handshaking(&self) -> bool {
        matches!(
            self,
            Self::HelloSent | Self::IdentifierSent | Self::AwaitingAck
        )
    }

    const fn is_settled(&self) -> bool {
        matches!(self, Self::Ready | Self::Rejected(_) | Self::Disconnected)
    }
}

struct ClientInner {
    config: ClientConfig,
    port: Arc<dyn MessagePort>,
    protocol: Arc<Protocol>,
    state: watch::Sender<ClientState>,
    cancel: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connects to a [`MessageServer`](crate::MessageServer) and keeps the
/// connection alive across server restarts.
pub struct MessageClient {
    inner: Arc<ClientInner>,
}

impl MessageClient {
    /// Connect and wait for the server's acknowledgement.
    ///
    /// # Errors
    /// Returns error if the hello cannot be posted, the server rejects the
    /// client, or no acknowledgement arrives in time.
    pub async fn connect(
        port: Arc<dyn MessagePort>,
        config: ClientConfig,
    ) -> Result<Self, HandshakeError> {
        let deliveries = from_message_emitter(
            port.as_ref(),
            EnvelopeFilter::any().source(config.target.clone()),
        );
        let protocol = Arc::new(Protocol::new(
            Arc::clone(&port),
            ConnectionIdentity::new(config.source.clone(), config.target.clone()),
            None,
        ));
        let (state, _) = watch::channel(ClientState::Init);

        let inner = Arc::new(ClientInner {
            config,
            port,
            protocol,
            state,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run(Arc::downgrade(&inner), deliveries, inner.cancel.clone()));

        let client = Self { inner };
        client.inner.send_handshake()?;
        client.wait_ready().await?;
        Ok(client)
    }

    /// Protocol carrying application frames once the client is ready.
    #[must_use]
    pub fn protocol(&self) -> Arc<Protocol> {
        Arc::clone(&self.inner.protocol)
    }

    /// Source identifier this client sends as.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.inner.config.source
    }

    /// Current handshake state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.inner.state.borrow().clone()
    }

    /// Observe state transitions, including handshake replays.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Wait for the current handshake to settle.
    ///
    /// # Errors
    /// Returns error if the server rejects the client, the client is
    /// disconnected, or the acknowledgement timeout elapses.
    pub async fn wait_ready(&self) -> Result<(), HandshakeError> {
        let timeout = self.inner.config.ack_timeout();
        let mut rx = self.inner.state.subscribe();
        let settled = tokio::time::timeout(timeout, rx.wait_for(ClientState::is_settled)).await;
        let state = match settled {
            Err(_) => return Err(HandshakeError::Timeout(timeout)),
            Ok(Err(_)) => return Err(HandshakeError::Closed),
            Ok(Ok(state)) => state.clone(),
        };
        match state {
            ClientState::Ready => Ok(()),
            ClientState::Rejected(reason) => Err(HandshakeError::Rejected(reason)),
            _ => Err(HandshakeError::Closed),
        }
    }

    /// Tell the server this client is leaving and stop routing frames.
    pub fn disconnect(&self) {
        self.inner.protocol.disconnect();
        self.inner.protocol.mark_closed();
        self.inner.state.send_replace(ClientState::Disconnected);
        self.inner.cancel.cancel();
        tracing::info!(source = %self.source(), "Client disconnected");
    }
}

async fn run(
    client: Weak<ClientInner>,
    mut deliveries: BoxStream<'static, Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = deliveries.next() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let Some(client) = client.upgrade() else {
            break;
        };
        client.handle(delivery.envelope);
    }
}

impl ClientInner {
    /// Send hello followed by the identifier frame.
    fn send_handshake(&self) -> Result<(), TransportError> {
        let source = &self.config.source;
        let target = &self.config.target;

        self.state.send_replace(ClientState::HelloSent);
        self.protocol.reopen();
        self.port
            .post(Envelope::hello(source.clone(), target.clone()), None)?;

        let identifier = HandshakeMessage::Auth {
            auth: self.config.client_id.clone(),
        }
        .encode()?;
        self.state.send_replace(ClientState::IdentifierSent);
        self.port
            .post(Envelope::message(source.clone(), target.clone(), identifier), None)?;

        // The ack may already have been processed by the routing task.
        self.state.send_if_modified(|state| {
            if *state == ClientState::IdentifierSent {
                *state = ClientState::AwaitingAck;
                true
            } else {
                false
            }
        });
        tracing::debug!(%source, %target, "Handshake sent");
        Ok(())
    }

    fn handle(&self, envelope: Envelope) {
        let source = &self.config.source;
        match envelope.kind {
            MessageType::Reconnect => {
                tracing::info!(%source, server = %envelope.source, "Server restarted, replaying handshake");
                if let Err(e) = self.send_handshake() {
                    tracing::warn!(%source, "Handshake replay failed: {e}");
                }
            }
            MessageType::Message if envelope.target == *source => {
                let state = self.state.borrow().clone();
                if state.is_handshaking() {
                    self.on_handshake_reply(&envelope.body);
                } else if state == ClientState::Ready {
                    self.protocol.deliver(envelope);
                }
            }
            MessageType::Disconnect if envelope.target == *source => {
                self.protocol.deliver(envelope);
                self.state.send_replace(ClientState::Disconnected);
                tracing::info!(%source, "Server closed the connection");
            }
            _ => {}
        }
    }

    fn on_handshake_reply(&self, body: &[u8]) {
        let source = &self.config.source;
        match HandshakeMessage::decode(body) {
            Ok(HandshakeMessage::Ok) => {
                self.state.send_replace(ClientState::Ready);
                tracing::info!(%source, target = %self.config.target, "Connected");
            }
            Ok(HandshakeMessage::Error { reason }) => {
                tracing::warn!(%source, %reason, "Connection rejected");
                self.state.send_replace(ClientState::Rejected(reason));
            }
            Ok(other) => {
                tracing::debug!(%source, tag = other.tag(), "Unexpected handshake frame ignored");
            }
            Err(e) => {
                tracing::debug!(%source, "Non-handshake frame before acknowledgement ignored: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use doomberg_ipc_core::LocalBus;
    use tokio_test::assert_ok;

    use super::*;
    use crate::server::{Authenticator, MessageServer, ServerConfig};

    const WAIT: Duration = Duration::from_secs(1);

    fn quiet_server(bus: &LocalBus) -> MessageServer {
        let mut config = ServerConfig::new("background");
        config.announce_on_start = false;
        MessageServer::start(config, Arc::new(bus.port(None)))
    }

    fn client_config(client_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new("background", client_id);
        config.ack_timeout_ms = 500;
        config
    }

    #[test]
    fn config_generates_unique_sources() {
        let a = ClientConfig::new("background", "panel");
        let b = ClientConfig::new("background", "panel");
        assert!(a.source.starts_with("panel-"));
        assert_ne!(a.source, b.source);
        assert_eq!(a.ack_timeout(), Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS));

        let fixed = a.with_source("panel-main");
        assert_eq!(fixed.source, "panel-main");
    }

    #[test]
    fn config_deserializes_with_default_timeout() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"source":"content-1","target":"background","client_id":"widget"}"#,
        )
        .unwrap();
        assert_eq!(config.ack_timeout_ms, DEFAULT_ACK_TIMEOUT_MS);
    }

    #[tokio::test]
    async fn connects_and_exchanges_frames() {
        let bus = LocalBus::new();
        let server = quiet_server(&bus);
        let mut connections = server.on_did_client_connect();

        let client = MessageClient::connect(Arc::new(bus.port(Some(4))), client_config("chain"))
            .await
            .unwrap();
        assert_eq!(client.state(), ClientState::Ready);

        let event = tokio::time::timeout(WAIT, connections.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.client_id, "chain");
        assert_eq!(event.source, client.source());
        assert_eq!(event.tab_id, Some(4));

        let mut server_rx = event.protocol.on_message();
        let mut client_rx = client.protocol().on_message();

        client.protocol().send(Bytes::from_static(b"subscribe"));
        let got = tokio::time::timeout(WAIT, server_rx.next()).await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"subscribe")));

        event.protocol.send(Bytes::from_static(b"tick"));
        let got = tokio::time::timeout(WAIT, client_rx.next()).await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"tick")));
    }

    #[tokio::test]
    async fn rejection_surfaces_reason() {
        struct OnlyPanel;

        #[async_trait]
        impl Authenticator for OnlyPanel {
            async fn authenticate(&self, _source: &str, auth: &str) -> Result<(), String> {
                if auth == "panel" {
                    Ok(())
                } else {
                    Err("unknown client".to_string())
                }
            }
        }

        let bus = LocalBus::new();
        let mut config = ServerConfig::new("background");
        config.announce_on_start = false;
        let _server =
            MessageServer::with_authenticator(config, Arc::new(bus.port(None)), Arc::new(OnlyPanel));

        let result = MessageClient::connect(Arc::new(bus.port(None)), client_config("page")).await;
        match result {
            Err(HandshakeError::Rejected(reason)) => assert_eq!(reason, "unknown client"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("client should have been rejected"),
        }
    }

    #[tokio::test]
    async fn times_out_without_server() {
        let bus = LocalBus::new();
        // Keeps the bus populated so posting the hello succeeds.
        let _listener = bus.port(None).subscribe();

        let result = MessageClient::connect(Arc::new(bus.port(None)), client_config("lonely")).await;
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
    }

    #[tokio::test]
    async fn replays_handshake_when_server_restarts() {
        let bus = LocalBus::new();
        let server = quiet_server(&bus);
        let mut first_connections = server.on_did_client_connect();
        let client = MessageClient::connect(Arc::new(bus.port(None)), client_config("panel"))
            .await
            .unwrap();
        tokio::time::timeout(WAIT, first_connections.next())
            .await
            .unwrap()
            .unwrap();

        server.dispose();
        drop(server);

        // A fresh server announces itself on start.
        let restarted = MessageServer::start(ServerConfig::new("background"), Arc::new(bus.port(None)));
        let mut connections = restarted.on_did_client_connect();
        let event = tokio::time::timeout(WAIT, connections.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.source, client.source());
        assert_ok!(client.wait_ready().await);
        assert_eq!(client.state(), ClientState::Ready);

        // The replayed connection is live again for new disconnect listeners.
        assert!(!client.protocol().is_closed());
        let fired = tokio::time::timeout(
            Duration::from_millis(50),
            client.protocol().on_disconnect().next(),
        )
        .await;
        assert!(fired.is_err());

        client.protocol().send(Bytes::from_static(b"after restart"));
        let mut server_rx = event.protocol.on_message();
        let got = tokio::time::timeout(WAIT, server_rx.next()).await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"after restart")));
    }

    #[tokio::test]
    async fn disconnect_notifies_server() {
        let bus = LocalBus::new();
        let server = quiet_server(&bus);
        let mut connections = server.on_did_client_connect();
        let client = MessageClient::connect(Arc::new(bus.port(None)), client_config("panel"))
            .await
            .unwrap();
        let event = tokio::time::timeout(WAIT, connections.next())
            .await
            .unwrap()
            .unwrap();

        client.disconnect();

        let reason = tokio::time::timeout(WAIT, event.closed()).await.unwrap();
        assert_eq!(reason, crate::server::ConnectionClosed::Disconnected);
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.protocol().is_closed());
    }
}
