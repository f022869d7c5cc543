//! Drive a [`ClientLifecycleManager`] from connect/disconnect event sources.

use std::{fmt::Debug, hash::Hash};

use doomberg_ipc_core::Disposable;
use futures::{StreamExt, stream::BoxStream};

use crate::manager::{ClientLifecycleManager, DisconnectReason, Teardown};

/// A client claiming a liveness key.
pub struct ConnectEvent<K> {
    /// Liveness key the record is stored under.
    pub key: K,
    pub client_id: String,
    /// Tell the client it is being dropped.
    pub disconnect: Teardown,
    /// Release the transport-side state.
    pub delete_client: Teardown,
    /// Yields when the client's own connection ends.
    pub on_self_disconnect: Option<BoxStream<'static, ()>>,
}

/// The external liveness signal for a key fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessLost<K> {
    pub key: K,
    pub reason: DisconnectReason,
}

/// Capability a tracker composes over: where clients come from and when
/// their keys stop being alive.
pub trait LifecycleSource<K>: Send + Sync {
    fn on_connect(&self) -> BoxStream<'static, ConnectEvent<K>>;

    fn on_disconnect(&self) -> BoxStream<'static, LivenessLost<K>>;
}

/// Feeds a manager from a [`LifecycleSource`] until disposed.
pub struct LifecycleTracker<K> {
    manager: ClientLifecycleManager<K>,
    listener: Disposable,
}

impl<K> LifecycleTracker<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// Subscribe to `source` and start applying its events to `manager`.
    pub fn spawn<S>(manager: ClientLifecycleManager<K>, source: &S) -> Self
    where
        S: LifecycleSource<K> + ?Sized,
    {
        let mut connects = source.on_connect().fuse();
        let mut losses = source.on_disconnect().fuse();
        let listener = Disposable::new();
        let token = listener.token();
        let target = manager.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    Some(event) = connects.next() => {
                        target.handle_client_connect(
                            event.client_id,
                            event.key,
                            event.disconnect,
                            event.delete_client,
                            event.on_self_disconnect,
                        );
                    }
                    Some(lost) = losses.next() => {
                        target.handle_client_disconnect(&lost.key, lost.reason);
                    }
                    else => break,
                }
            }
        });

        Self { manager, listener }
    }

    /// Manager driven by this tracker.
    #[must_use]
    pub const fn manager(&self) -> &ClientLifecycleManager<K> {
        &self.manager
    }

    /// Stop tracking and tear down every client.
    pub fn dispose(&self) {
        self.listener.dispose();
        self.manager.dispose();
    }
}
