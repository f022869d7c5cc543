//! Connection addressing and envelope filtering.

use std::future;

use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};

use crate::{
    envelope::{Delivery, Envelope, MessageType},
    traits::MessagePort,
};

/// Addressing of one end of a logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionIdentity {
    /// This context.
    pub source: String,
    /// The peer context.
    pub target: String,
}

impl ConnectionIdentity {
    /// Create an identity sending as `source` to `target`.
    #[must_use]
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// The same connection seen from the peer.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self::new(self.target.clone(), self.source.clone())
    }

    /// Whether `envelope` was sent by the peer to this context.
    #[must_use]
    pub fn is_inbound(&self, envelope: &Envelope) -> bool {
        envelope.source == self.target && envelope.target == self.source
    }
}

/// Match on type tag and addressing; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeFilter {
    pub kind: Option<MessageType>,
    pub source: Option<String>,
    pub target: Option<String>,
}

impl EnvelopeFilter {
    /// Filter matching every envelope.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Only match envelopes of `kind`.
    #[must_use]
    pub const fn kind(mut self, kind: MessageType) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Only match envelopes from `source`.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Only match envelopes addressed to `target`.
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Whether `envelope` passes every set criterion.
    #[must_use]
    pub fn matches(&self, envelope: &Envelope) -> bool {
        self.kind.is_none_or(|kind| kind == envelope.kind)
            && self.source.as_ref().is_none_or(|s| *s == envelope.source)
            && self.target.as_ref().is_none_or(|t| *t == envelope.target)
    }
}

/// Adapt a message port into a filtered stream of deliveries.
///
/// The port is subscribed before this returns, so envelopes posted after
/// the call are never missed.
pub fn from_message_emitter(
    port: &dyn MessagePort,
    filter: EnvelopeFilter,
) -> BoxStream<'static, Delivery> {
    port.subscribe()
        .filter(move |delivery| future::ready(filter.matches(&delivery.envelope)))
        .boxed()
}
