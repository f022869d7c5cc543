//! Core traits for message ports and protocols.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::envelope::{Delivery, Envelope, TabId};

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Port closed")]
    Closed,
    #[error("Receiving end does not exist (tab: {0:?})")]
    NoReceiver(Option<TabId>),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handshake error surfaced to whoever initiated the connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Connection rejected: {0}")]
    Rejected(String),
    #[error("No acknowledgement within {0:?}")]
    Timeout(Duration),
    #[error("Connection closed during handshake")]
    Closed,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Broadcast-style messaging primitive shared by every context.
///
/// Implementations must observe every envelope posted after
/// [`MessagePort::subscribe`] returns, and must not deliver a port's own
/// posts back to it.
pub trait MessagePort: Send + Sync {
    /// Post to the contexts of one tab, or broadcast when `tab` is `None`.
    ///
    /// # Errors
    /// Returns error if nothing can receive the envelope.
    fn post(&self, envelope: Envelope, tab: Option<TabId>) -> Result<(), TransportError>;

    /// Stream of envelopes delivered to this port.
    fn subscribe(&self) -> BoxStream<'static, Delivery>;
}

impl<T: MessagePort + ?Sized> MessagePort for Arc<T> {
    fn post(&self, envelope: Envelope, tab: Option<TabId>) -> Result<(), TransportError> {
        (**self).post(envelope, tab)
    }

    fn subscribe(&self) -> BoxStream<'static, Delivery> {
        (**self).subscribe()
    }
}

/// Message-passing contract consumed by the RPC layer above.
pub trait MessagePassingProtocol: Send + Sync {
    /// Send an opaque payload. Failures are logged, never returned.
    fn send(&self, buffer: Bytes);

    /// Inbound payloads from the peer.
    fn on_message(&self) -> BoxStream<'static, Bytes>;

    /// Yields once when the peer goes away, including for late listeners.
    fn on_disconnect(&self) -> BoxStream<'static, ()>;

    /// Notify the peer, best effort.
    fn disconnect(&self);
}
