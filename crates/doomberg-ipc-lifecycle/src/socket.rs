//! Lifecycle source for socket clients, keyed by the id they present.

use doomberg_ipc_core::MessagePassingProtocol;
use doomberg_ipc_transport::{SocketConnectionEvent, SocketServer};
use futures::{StreamExt, stream::BoxStream};

use crate::tracker::{ConnectEvent, LifecycleSource, LivenessLost};

/// Clients of a [`SocketServer`]. A new connection presenting an id already
/// in use replaces the older one.
pub struct SocketClientSource {
    server: SocketServer,
}

impl SocketClientSource {
    /// Create a source over `server`.
    #[must_use]
    pub const fn new(server: SocketServer) -> Self {
        Self { server }
    }
}

fn connect_event(server: &SocketServer, event: SocketConnectionEvent) -> ConnectEvent<String> {
    let server = server.clone();
    let connection_id = event.connection_id;
    let protocol = event.protocol;

    ConnectEvent {
        key: event.client_id.clone(),
        client_id: event.client_id,
        on_self_disconnect: Some(protocol.on_disconnect()),
        disconnect: Box::new(move || protocol.disconnect()),
        delete_client: Box::new(move || {
            server.forget(connection_id);
        }),
    }
}

impl LifecycleSource<String> for SocketClientSource {
    fn on_connect(&self) -> BoxStream<'static, ConnectEvent<String>> {
        let server = self.server.clone();
        self.server
            .on_did_client_connect()
            .map(move |event| connect_event(&server, event))
            .boxed()
    }

    /// Sockets have no liveness signal besides their own connection.
    fn on_disconnect(&self) -> BoxStream<'static, LivenessLost<String>> {
        futures::stream::pending().boxed()
    }
}
