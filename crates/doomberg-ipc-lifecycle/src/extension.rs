//! Lifecycle source for clients of a [`MessageServer`], keyed by the tab
//! hosting them.

use std::{fmt, sync::Arc};

use doomberg_ipc_core::{Emitter, TabId};
use doomberg_ipc_transport::{ClientConnectionEvent, MessageServer};
use futures::{StreamExt, stream::BoxStream};

use crate::{
    manager::DisconnectReason,
    tracker::{ConnectEvent, LifecycleSource, LivenessLost},
};

/// Liveness key of an extension client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    /// Client hosted in a browser tab; lives as long as the tab.
    Tab(TabId),
    /// Client outside any tab (side panel, popup), keyed by its source.
    Source(String),
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tab(id) => write!(f, "tab:{id}"),
            Self::Source(source) => write!(f, "source:{source}"),
        }
    }
}

impl From<&ClientConnectionEvent> for ClientKey {
    fn from(event: &ClientConnectionEvent) -> Self {
        event
            .tab_id
            .map_or_else(|| Self::Source(event.source.clone()), Self::Tab)
    }
}

/// Browser tab notifications.
pub trait TabEvents: Send + Sync {
    /// Tab ids as their tabs are closed.
    fn on_removed(&self) -> BoxStream<'static, TabId>;
}

/// In-process [`TabEvents`], fed by whoever observes the browser.
#[derive(Clone, Default)]
pub struct TabEventEmitter {
    removed: Emitter<TabId>,
}

impl TabEventEmitter {
    /// Create an emitter with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report that `tab` was closed.
    pub fn tab_removed(&self, tab: TabId) {
        self.removed.fire(tab);
    }
}

impl TabEvents for TabEventEmitter {
    fn on_removed(&self) -> BoxStream<'static, TabId> {
        self.removed.event()
    }
}

/// Clients of a message server, torn down when their tab closes.
pub struct ExtensionClientSource {
    server: MessageServer,
    tabs: Arc<dyn TabEvents>,
}

impl ExtensionClientSource {
    /// Create a source over `server`, torn down by `tabs`.
    #[must_use]
    pub fn new(server: MessageServer, tabs: Arc<dyn TabEvents>) -> Self {
        Self { server, tabs }
    }
}

fn connect_event(
    server: &MessageServer,
    event: &ClientConnectionEvent,
) -> ConnectEvent<ClientKey> {
    let (disconnect_server, delete_server) = (server.clone(), server.clone());
    let (disconnect_source, delete_source) = (event.source.clone(), event.source.clone());
    let connection_id = event.connection_id;

    ConnectEvent {
        key: ClientKey::from(event),
        client_id: event.client_id.clone(),
        disconnect: Box::new(move || {
            disconnect_server.disconnect_client(&disconnect_source, connection_id);
        }),
        delete_client: Box::new(move || {
            delete_server.forget(&delete_source, connection_id);
        }),
        on_self_disconnect: Some(event.on_did_client_disconnect().map(|_| ()).boxed()),
    }
}

impl LifecycleSource<ClientKey> for ExtensionClientSource {
    fn on_connect(&self) -> BoxStream<'static, ConnectEvent<ClientKey>> {
        let server = self.server.clone();
        self.server
            .on_did_client_connect()
            .map(move |event| connect_event(&server, &event))
            .boxed()
    }

    fn on_disconnect(&self) -> BoxStream<'static, LivenessLost<ClientKey>> {
        self.tabs
            .on_removed()
            .map(|tab| LivenessLost {
                key: ClientKey::Tab(tab),
                reason: DisconnectReason::TabRemoved,
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use doomberg_ipc_core::{
        ConnectionIdentity, Delivery, EnvelopeFilter, LocalBus, MessageType, from_message_emitter,
    };
    use doomberg_ipc_transport::{ClientConfig, MessageClient, ServerConfig};

    use super::*;
    use crate::{manager::ClientLifecycleManager, tracker::LifecycleTracker};

    const WAIT: Duration = Duration::from_secs(1);

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn setup() -> (LocalBus, MessageServer, TabEventEmitter, LifecycleTracker<ClientKey>) {
        let bus = LocalBus::new();
        let mut config = ServerConfig::new("background");
        config.announce_on_start = false;
        let server = MessageServer::start(config, Arc::new(bus.port(None)));
        let tabs = TabEventEmitter::new();
        let source = ExtensionClientSource::new(server.clone(), Arc::new(tabs.clone()));
        let tracker = LifecycleTracker::spawn(ClientLifecycleManager::new(), &source);
        (bus, server, tabs, tracker)
    }

    async fn connect(bus: &LocalBus, tab: Option<TabId>, client_id: &str) -> MessageClient {
        let mut config = ClientConfig::new("background", client_id);
        config.ack_timeout_ms = 500;
        tokio_test::assert_ok!(MessageClient::connect(Arc::new(bus.port(tab)), config).await)
    }

    #[test]
    fn key_display_names_its_kind() {
        assert_eq!(ClientKey::Tab(7).to_string(), "tab:7");
        assert_eq!(ClientKey::Source("panel".into()).to_string(), "source:panel");
    }

    #[tokio::test]
    async fn closing_tab_tears_down_its_client_only() {
        let (bus, server, tabs, tracker) = setup();
        let seven = connect(&bus, Some(7), "chain").await;
        let _eight = connect(&bus, Some(8), "chain").await;
        let manager = tracker.manager().clone();
        eventually(|| manager.len() == 2).await;

        let mut to_seven = from_message_emitter(
            &bus.port(Some(7)),
            EnvelopeFilter::any()
                .kind(MessageType::Disconnect)
                .target(seven.source()),
        );
        tabs.tab_removed(7);

        eventually(|| !manager.contains(&ClientKey::Tab(7))).await;
        assert!(manager.contains(&ClientKey::Tab(8)));
        assert!(!server.is_connected(seven.source()));
        assert_eq!(server.client_count(), 1);

        let Delivery { envelope, .. } = tokio::time::timeout(WAIT, to_seven.next())
            .await
            .unwrap()
            .unwrap();
        assert!(ConnectionIdentity::new(seven.source(), "background").is_inbound(&envelope));
    }

    #[tokio::test]
    async fn new_client_in_same_tab_replaces_old_one() {
        let (bus, server, _tabs, tracker) = setup();
        let old = connect(&bus, Some(7), "chain").await;
        let manager = tracker.manager().clone();
        eventually(|| manager.len() == 1).await;
        let first_generation = manager.generation(&ClientKey::Tab(7));

        let new = connect(&bus, Some(7), "chain-reloaded").await;
        eventually(|| manager.client_id(&ClientKey::Tab(7)).as_deref() == Some("chain-reloaded"))
            .await;

        assert_eq!(manager.len(), 1);
        assert_ne!(manager.generation(&ClientKey::Tab(7)), first_generation);
        assert!(server.is_connected(new.source()));
        assert!(!server.is_connected(old.source()));
    }

    #[tokio::test]
    async fn client_disconnect_removes_record() {
        let (bus, server, _tabs, tracker) = setup();
        let panel = connect(&bus, None, "side-panel").await;
        let manager = tracker.manager().clone();
        let key = ClientKey::Source(panel.source().to_string());
        eventually(|| manager.contains(&key)).await;

        panel.disconnect();

        eventually(|| !manager.contains(&key)).await;
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn reconnect_with_same_source_keeps_single_record() {
        let (bus, server, _tabs, tracker) = setup();
        let port = Arc::new(bus.port(Some(5)));
        let mut config = ClientConfig::new("background", "orders").with_source("orders-5");
        config.ack_timeout_ms = 500;
        let _first = MessageClient::connect(port.clone(), config.clone()).await.unwrap();
        let manager = tracker.manager().clone();
        eventually(|| manager.len() == 1).await;
        let first_generation = manager.generation(&ClientKey::Tab(5));

        let _second = MessageClient::connect(port, config).await.unwrap();
        eventually(|| manager.generation(&ClientKey::Tab(5)) != first_generation).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.len(), 1);
        assert!(manager.contains(&ClientKey::Tab(5)));
        assert!(server.is_connected("orders-5"));
    }
}
