//! Client lifecycle manager: at most one live client per liveness key.

use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc};

use doomberg_ipc_core::{Disposable, listen};
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;

/// Why a client record was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A new connection claimed the same key.
    Superseded,
    /// The client's own connection went away.
    SelfDisconnected,
    /// The external liveness signal fired (e.g. the tab was closed).
    TabRemoved,
    /// Requested by the owner.
    Explicit,
    /// The manager was disposed.
    ManagerDisposed,
}

/// Callback run once when a record is torn down.
pub type Teardown = Box<dyn FnOnce() + Send>;

/// Live client owned by the manager.
struct ClientRecord {
    client_id: String,
    generation: u64,
    disconnect: Teardown,
    delete_client: Teardown,
    self_disconnect_listener: Option<Disposable>,
}

impl ClientRecord {
    /// Dispose the listener, then disconnect, then delete.
    fn teardown(self) {
        if let Some(listener) = self.self_disconnect_listener {
            listener.dispose();
        }
        (self.disconnect)();
        (self.delete_client)();
    }
}

struct Inner<K> {
    clients: HashMap<K, ClientRecord>,
    next_generation: u64,
    disposed: bool,
}

/// Tracks connected clients by an externally owned liveness key (tab id,
/// connection source).
///
/// Connecting on an occupied key tears the previous record down before the
/// new one becomes visible. Teardown callbacks run while the manager is
/// locked, so they must not call back into the manager.
pub struct ClientLifecycleManager<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> Clone for ClientLifecycleManager<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for ClientLifecycleManager<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ClientLifecycleManager<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// Create an empty lifecycle manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                clients: HashMap::new(),
                next_generation: 1,
                disposed: false,
            })),
        }
    }

    /// Install a client under `key`, tearing down whoever held it.
    ///
    /// `on_self_disconnect` yields when the client's own connection ends;
    /// the first item removes this record (and only this record).
    ///
    /// Returns the record's generation.
    pub fn handle_client_connect(
        &self,
        client_id: impl Into<String>,
        key: K,
        disconnect: impl FnOnce() + Send + 'static,
        delete_client: impl FnOnce() + Send + 'static,
        on_self_disconnect: Option<BoxStream<'static, ()>>,
    ) -> u64 {
        let client_id = client_id.into();
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let mut record = ClientRecord {
            client_id,
            generation,
            disconnect: Box::new(disconnect),
            delete_client: Box::new(delete_client),
            self_disconnect_listener: None,
        };

        if inner.disposed {
            drop(inner);
            tracing::warn!(?key, client_id = %record.client_id, "Manager disposed, dropping new client");
            record.teardown();
            return generation;
        }

        if let Some(previous) = inner.clients.remove(&key) {
            tracing::info!(
                ?key,
                previous = %previous.client_id,
                client_id = %record.client_id,
                "Key reclaimed, tearing down previous client"
            );
            previous.teardown();
        }

        record.self_disconnect_listener = on_self_disconnect.map(|signal| {
            let weak = Arc::downgrade(&self.inner);
            let key = key.clone();
            listen(signal.take(1), move |()| {
                if let Some(inner) = weak.upgrade() {
                    Self { inner }.cleanup_generation(
                        &key,
                        generation,
                        DisconnectReason::SelfDisconnected,
                    );
                }
            })
        });

        tracing::debug!(?key, client_id = %record.client_id, generation, "Client registered");
        inner.clients.insert(key, record);
        generation
    }

    /// Tear down the client under `key`, if any.
    ///
    /// Returns whether a record was removed. An absent key is a no-op.
    pub fn handle_client_disconnect(&self, key: &K, reason: DisconnectReason) -> bool {
        let mut inner = self.inner.lock();
        let Some(record) = inner.clients.remove(key) else {
            tracing::debug!(?key, ?reason, "Disconnect for unknown key ignored");
            return false;
        };
        tracing::info!(?key, client_id = %record.client_id, ?reason, "Client disconnected");
        record.teardown();
        true
    }

    /// Tear down the client under `key`, if any.
    pub fn cleanup_client(&self, key: &K) -> bool {
        self.handle_client_disconnect(key, DisconnectReason::Explicit)
    }

    /// Remove `key` only if it still holds `generation`.
    fn cleanup_generation(&self, key: &K, generation: u64, reason: DisconnectReason) -> bool {
        let mut inner = self.inner.lock();
        match inner.clients.get(key) {
            Some(record) if record.generation == generation => {}
            _ => {
                tracing::debug!(?key, generation, ?reason, "Stale disconnect ignored");
                return false;
            }
        }
        let Some(record) = inner.clients.remove(key) else {
            return false;
        };
        tracing::info!(?key, client_id = %record.client_id, ?reason, "Client disconnected");
        record.teardown();
        true
    }

    /// Tear down every record. Later connects are torn down immediately.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        let records: Vec<(K, ClientRecord)> = inner.clients.drain().collect();
        tracing::debug!(count = records.len(), "Disposing client lifecycle manager");
        for (key, record) in records {
            tracing::debug!(?key, client_id = %record.client_id, reason = ?DisconnectReason::ManagerDisposed, "Client torn down");
            record.teardown();
        }
    }

    /// Client id registered under `key`.
    #[must_use]
    pub fn client_id(&self, key: &K) -> Option<String> {
        self.inner
            .lock()
            .clients
            .get(key)
            .map(|record| record.client_id.clone())
    }

    /// Generation of the record under `key`.
    #[must_use]
    pub fn generation(&self, key: &K) -> Option<u64> {
        self.inner.lock().clients.get(key).map(|record| record.generation)
    }

    /// Whether a client is recorded under `key`.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().clients.contains_key(key)
    }

    /// Number of recorded clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Whether no clients are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().clients.is_empty()
    }

    /// Keys of every recorded client.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().clients.keys().cloned().collect()
    }

    /// Whether the manager has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }
}
