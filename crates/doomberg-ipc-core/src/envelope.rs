//! Wire types exchanged between extension contexts.

use serde::{Deserialize, Serialize};

/// Browser tab identifier.
pub type TabId = i64;

/// Identifier of a port attached to a message bus.
pub type PortId = u64;

/// Target used by announcements that address every listening context.
pub const BROADCAST_TARGET: &str = "*";

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Opaque payload frame.
    #[serde(rename = "DOOMBERG_MESSAGE")]
    Message,
    /// Connection request from a client context.
    #[serde(rename = "DOOMBERG_HELLO")]
    Hello,
    /// Peer is going away.
    #[serde(rename = "DOOMBERG_DISCONNECT")]
    Disconnect,
    /// Server restarted; clients must replay their handshake.
    #[serde(rename = "ROBINDAHOOD_RECONNECT")]
    Reconnect,
}

/// Frame carried over the native messaging primitive.
///
/// `body` serializes as an array of byte values, which is what the
/// extension side hands to `runtime.sendMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Envelope {
    /// Create an envelope of any kind.
    #[must_use]
    pub fn new(
        kind: MessageType,
        source: impl Into<String>,
        target: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            source: source.into(),
            target: target.into(),
            body,
        }
    }

    /// Payload frame.
    #[must_use]
    pub fn message(source: impl Into<String>, target: impl Into<String>, body: Vec<u8>) -> Self {
        Self::new(MessageType::Message, source, target, body)
    }

    /// Hello frame. The body repeats the addressing as a handshake message.
    #[must_use]
    pub fn hello(source: impl Into<String>, target: impl Into<String>) -> Self {
        let (source, target) = (source.into(), target.into());
        let body = HandshakeMessage::Hello {
            source: source.clone(),
            target: target.clone(),
        }
        .encode()
        .unwrap_or_default();
        Self::new(MessageType::Hello, source, target, body)
    }

    /// Create a disconnect notice from `source` to `target`.
    #[must_use]
    pub fn disconnect(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(MessageType::Disconnect, source, target, Vec::new())
    }

    /// Reconnect announcement from `source` to every listening context.
    #[must_use]
    pub fn reconnect(source: impl Into<String>) -> Self {
        Self::new(MessageType::Reconnect, source, BROADCAST_TARGET, Vec::new())
    }
}

/// Messages used only while a connection is being established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    Hello { source: String, target: String },
    /// Client identifier frame; `auth` carries the client id.
    Auth { auth: String },
    Error { reason: String },
    Ok,
}

impl HandshakeMessage {
    /// Serialize to JSON bytes for an envelope body.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse an envelope body.
    ///
    /// # Errors
    /// Returns error if the body is not a handshake message.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Wire tag, for log lines.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Auth { .. } => "auth",
            Self::Error { .. } => "error",
            Self::Ok => "ok",
        }
    }
}

/// Who posted a message, as reported by the messaging primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    /// Tab hosting the sending context, if any.
    pub tab_id: Option<TabId>,
    /// Port the envelope was posted from.
    pub port_id: PortId,
}

/// An envelope together with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub envelope: Envelope,
    pub sender: SenderInfo,
}
