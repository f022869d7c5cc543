//! Core abstractions for inter-context messaging.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` / `HandshakeMessage` - Wire types
//! - `MessagePort` - The shared broadcast primitive, with `LocalBus` as an
//!   in-process implementation
//! - `MessagePassingProtocol` - Contract consumed by the RPC layer
//! - `Emitter`, `BufferedEmitter`, `Disposable` - Event primitives

pub mod bus;
pub mod envelope;
pub mod event;
pub mod identity;
pub mod traits;

pub use bus::{BusPort, LocalBus};
pub use envelope::{
    BROADCAST_TARGET, Delivery, Envelope, HandshakeMessage, MessageType, SenderInfo, TabId,
};
pub use event::{BufferedEmitter, Disposable, Emitter, listen};
pub use identity::{ConnectionIdentity, EnvelopeFilter, from_message_emitter};
pub use traits::{HandshakeError, MessagePassingProtocol, MessagePort, TransportError};
