//! Client lifecycle tracking for the messaging layer.
//!
//! Provides:
//! - `ClientLifecycleManager` - One live client per key, generation-checked teardown
//! - `LifecycleTracker` - Feeds a manager from a `LifecycleSource`
//! - Sources for extension clients (keyed by tab) and socket clients (keyed by id)

pub mod extension;
pub mod manager;
pub mod socket;
pub mod tracker;

pub use extension::{ClientKey, ExtensionClientSource, TabEventEmitter, TabEvents};
pub use manager::{ClientLifecycleManager, DisconnectReason, Teardown};
pub use socket::SocketClientSource;
pub use tracker::{ConnectEvent, LifecycleSource, LifecycleTracker, LivenessLost};
