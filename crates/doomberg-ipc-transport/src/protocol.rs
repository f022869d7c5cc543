//! Message-passing protocol over a shared message port.

use std::sync::Arc;

use bytes::Bytes;
use doomberg_ipc_core::{
    BufferedEmitter, ConnectionIdentity, Envelope, MessagePassingProtocol, MessagePort,
    MessageType, TabId,
};
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// One end of a logical connection between two contexts.
///
/// Outbound frames are addressed from `identity.source` to
/// `identity.target`, posted straight to the peer's tab when known and
/// broadcast otherwise. Inbound frames are routed in by the server or
/// client that owns the connection.
pub struct Protocol {
    port: Arc<dyn MessagePort>,
    identity: ConnectionIdentity,
    tab: Option<TabId>,
    inbound: BufferedEmitter<Bytes>,
    /// Closed signal of the current handshake; replaced when it is replayed.
    closed: Mutex<CancellationToken>,
}

impl Protocol {
    /// Create a protocol end.
    #[must_use]
    pub fn new(port: Arc<dyn MessagePort>, identity: ConnectionIdentity, tab: Option<TabId>) -> Self {
        Self {
            port,
            identity,
            tab,
            inbound: BufferedEmitter::new(),
            closed: Mutex::new(CancellationToken::new()),
        }
    }

    /// Source/target pair this protocol sends with.
    #[must_use]
    pub const fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Tab the peer lives in, if it is tab-scoped.
    #[must_use]
    pub const fn tab(&self) -> Option<TabId> {
        self.tab
    }

    /// Whether the peer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.lock().is_cancelled()
    }

    fn post(&self, kind: MessageType, body: Vec<u8>) {
        let envelope = Envelope::new(
            kind,
            self.identity.source.clone(),
            self.identity.target.clone(),
            body,
        );
        if let Err(e) = self.port.post(envelope, self.tab) {
            tracing::warn!(
                source = %self.identity.source,
                target = %self.identity.target,
                ?kind,
                "Dropping frame: {e}"
            );
        }
    }

    /// Route an inbound envelope from the peer.
    pub(crate) fn deliver(&self, envelope: Envelope) {
        match envelope.kind {
            MessageType::Message => self.inbound.fire(Bytes::from(envelope.body)),
            MessageType::Disconnect => self.mark_closed(),
            MessageType::Hello | MessageType::Reconnect => {}
        }
    }

    /// Fire the disconnect signal without notifying the peer.
    pub(crate) fn mark_closed(&self) {
        self.closed.lock().cancel();
    }

    /// Start a fresh closed signal if the previous one already fired.
    ///
    /// Listeners from before keep the fired signal; later listeners wait
    /// on the new one.
    pub(crate) fn reopen(&self) {
        let mut closed = self.closed.lock();
        if closed.is_cancelled() {
            *closed = CancellationToken::new();
        }
    }
}

impl MessagePassingProtocol for Protocol {
    fn send(&self, buffer: Bytes) {
        self.post(MessageType::Message, buffer.to_vec());
    }

    fn on_message(&self) -> BoxStream<'static, Bytes> {
        self.inbound.event()
    }

    fn on_disconnect(&self) -> BoxStream<'static, ()> {
        let closed = self.closed.lock().clone();
        futures::stream::once(async move { closed.cancelled().await }).boxed()
    }

    fn disconnect(&self) {
        self.post(MessageType::Disconnect, Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use doomberg_ipc_core::LocalBus;

    use super::*;

    #[tokio::test]
    async fn send_addresses_peer_tab() {
        let bus = LocalBus::new();
        let background: Arc<dyn MessagePort> = Arc::new(bus.port(None));
        let tab7 = bus.port(Some(7));
        let tab8 = bus.port(Some(8));
        let mut rx7 = tab7.subscribe();
        let mut rx8 = tab8.subscribe();

        let protocol = Protocol::new(
            background,
            ConnectionIdentity::new("background", "content-7"),
            Some(7),
        );
        protocol.send(Bytes::from_static(b"quote"));

        let delivery = rx7.next().await.unwrap();
        assert_eq!(
            delivery.envelope,
            Envelope::message("background", "content-7", b"quote".to_vec())
        );
        let nothing = tokio::time::timeout(Duration::from_millis(50), rx8.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn inbound_frames_are_buffered_until_first_listener() {
        let bus = LocalBus::new();
        let protocol = Protocol::new(
            Arc::new(bus.port(None)),
            ConnectionIdentity::new("background", "panel"),
            None,
        );

        protocol.deliver(Envelope::message("panel", "background", vec![1]));
        protocol.deliver(Envelope::message("panel", "background", vec![2]));

        let mut messages = protocol.on_message();
        assert_eq!(messages.next().await, Some(Bytes::from_static(&[1])));
        assert_eq!(messages.next().await, Some(Bytes::from_static(&[2])));
    }

    #[tokio::test]
    async fn disconnect_frame_fires_for_late_listeners() {
        let bus = LocalBus::new();
        let protocol = Protocol::new(
            Arc::new(bus.port(None)),
            ConnectionIdentity::new("background", "panel"),
            None,
        );
        assert!(!protocol.is_closed());

        protocol.deliver(Envelope::disconnect("panel", "background"));
        assert!(protocol.is_closed());
        assert_eq!(protocol.on_disconnect().next().await, Some(()));
    }

    #[tokio::test]
    async fn reopen_gives_later_listeners_a_fresh_signal() {
        let bus = LocalBus::new();
        let protocol = Protocol::new(
            Arc::new(bus.port(None)),
            ConnectionIdentity::new("panel", "background"),
            None,
        );
        let mut before = protocol.on_disconnect();
        protocol.mark_closed();
        protocol.reopen();

        assert!(!protocol.is_closed());
        assert_eq!(before.next().await, Some(()));
        let mut after = protocol.on_disconnect();
        let after = tokio::time::timeout(Duration::from_millis(50), after.next()).await;
        assert!(after.is_err());

        protocol.mark_closed();
        assert!(protocol.is_closed());
    }

    #[test]
    fn failed_send_is_swallowed() {
        let bus = LocalBus::new();
        let protocol = Protocol::new(
            Arc::new(bus.port(None)),
            ConnectionIdentity::new("background", "panel"),
            Some(42),
        );
        // No listener anywhere: logged and dropped.
        protocol.send(Bytes::from_static(b"lost"));
        protocol.disconnect();
    }
}
