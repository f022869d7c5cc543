//! Event primitives: broadcast emitters, a backlog-replaying emitter and
//! disposable listeners.

use std::collections::VecDeque;

use futures::{Stream, StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_util::sync::CancellationToken;

/// Capacity of the broadcast channel behind each emitter.
const EVENT_CAPACITY: usize = 1024;

/// Maximum number of values a [`BufferedEmitter`] holds for its first listener.
const MAX_BACKLOG: usize = 1024;

fn live<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    BroadcastStream::new(rx)
        .filter_map(|res| async move {
            match res {
                Ok(value) => Some(value),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event listener lagged, values dropped");
                    None
                }
            }
        })
        .boxed()
}

/// Multi-listener event.
pub struct Emitter<T> {
    sender: broadcast::Sender<T>,
}

impl<T> Default for Emitter<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> Emitter<T>
where
    T: Clone + Send + 'static,
{
    /// Create an emitter with no listeners.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Deliver a value to every current listener.
    pub fn fire(&self, value: T) {
        let _ = self.sender.send(value);
    }

    /// Listen for values fired from now on.
    #[must_use]
    pub fn event(&self) -> BoxStream<'static, T> {
        live(self.sender.subscribe())
    }

    /// Whether anyone is currently listening.
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

/// Emitter that holds values until its first listener arrives.
///
/// The first listener receives the backlog followed by live values; later
/// listeners only see live values. Consumers typically subscribe after the
/// producer has already started firing (a connection event handed out
/// before anyone reads the connection's frames), so nothing fired in
/// between is lost.
pub struct BufferedEmitter<T> {
    backlog: Mutex<Option<VecDeque<T>>>,
    sender: broadcast::Sender<T>,
}

impl<T> Default for BufferedEmitter<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BufferedEmitter<T>
where
    T: Clone + Send + 'static,
{
    /// Create an emitter with an empty backlog.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backlog: Mutex::new(Some(VecDeque::with_capacity(8))),
            sender,
        }
    }

    /// Fire a value, buffering it if nobody has listened yet.
    pub fn fire(&self, value: T) {
        let mut backlog = self.backlog.lock();
        match backlog.as_mut() {
            Some(pending) => {
                if pending.len() >= MAX_BACKLOG {
                    pending.pop_front();
                    tracing::warn!(limit = MAX_BACKLOG, "event backlog full, dropping oldest");
                }
                pending.push_back(value);
            }
            None => {
                let _ = self.sender.send(value);
            }
        }
    }

    /// Drop backlog values that no longer satisfy `keep`. No-op once the
    /// first listener has subscribed.
    pub fn retain(&self, keep: impl Fn(&T) -> bool) {
        if let Some(pending) = self.backlog.lock().as_mut() {
            pending.retain(|value| keep(value));
        }
    }

    /// Stream that yields the backlog first (first listener only), then live values.
    #[must_use]
    pub fn event(&self) -> BoxStream<'static, T> {
        let mut backlog = self.backlog.lock();
        let rx = self.sender.subscribe();
        let pending = backlog.take().unwrap_or_default();
        drop(backlog);

        futures::stream::iter(pending).chain(live(rx)).boxed()
    }

    /// Number of values waiting for the first listener.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().as_ref().map_or(0, VecDeque::len)
    }
}

/// Handle to a listener or background task that can be torn down.
///
/// Disposing is idempotent, and dropping the handle disposes it.
#[derive(Debug, Default)]
#[must_use = "dropping a Disposable disposes it"]
pub struct Disposable {
    token: CancellationToken,
}

impl Disposable {
    /// Create a live handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when this handle is disposed.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the listener or task.
    pub fn dispose(&self) {
        self.token.cancel();
    }

    /// Whether [`Self::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Disposable {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Call `f` for every item of `stream` until it ends or the returned
/// handle is disposed.
pub fn listen<S, F>(stream: S, mut f: F) -> Disposable
where
    S: Stream + Send + 'static,
    S::Item: Send,
    F: FnMut(S::Item) + Send + 'static,
{
    let disposable = Disposable::new();
    let token = disposable.token();

    tokio::spawn(async move {
        tokio::pin!(stream);
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(item) => f(item),
                    None => break,
                },
            }
        }
    });

    disposable
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn emitter_delivers_to_every_listener() {
        let emitter = Emitter::new();
        let mut a = emitter.event();
        let mut b = emitter.event();
        assert!(emitter.has_listeners());

        emitter.fire(7);
        assert_eq!(a.next().await, Some(7));
        assert_eq!(b.next().await, Some(7));
    }

    #[tokio::test]
    async fn emitter_drops_values_without_listeners() {
        let emitter = Emitter::new();
        emitter.fire("early");
        let mut events = emitter.event();
        emitter.fire("late");
        assert_eq!(events.next().await, Some("late"));
    }

    #[tokio::test]
    async fn buffered_emitter_replays_backlog_to_first_listener() {
        let emitter = BufferedEmitter::new();
        emitter.fire(1);
        emitter.fire(2);
        assert_eq!(emitter.backlog_len(), 2);

        let mut first = emitter.event();
        let mut second = emitter.event();
        emitter.fire(3);

        assert_eq!(first.next().await, Some(1));
        assert_eq!(first.next().await, Some(2));
        assert_eq!(first.next().await, Some(3));
        assert_eq!(second.next().await, Some(3));
        assert_eq!(emitter.backlog_len(), 0);
    }

    #[tokio::test]
    async fn retain_prunes_backlog_before_first_listener() {
        let emitter = BufferedEmitter::new();
        for n in 1..=4 {
            emitter.fire(n);
        }
        emitter.retain(|n| n % 2 == 0);
        assert_eq!(emitter.backlog_len(), 2);

        let mut events = emitter.event();
        emitter.fire(5);
        emitter.retain(|_| false);

        assert_eq!(events.next().await, Some(2));
        assert_eq!(events.next().await, Some(4));
        assert_eq!(events.next().await, Some(5));
    }

    #[tokio::test]
    async fn listen_stops_after_dispose() {
        let emitter = Emitter::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let listener = listen(emitter.event(), move |n: usize| {
            counter.fetch_add(n, Ordering::SeqCst);
        });

        emitter.fire(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        listener.dispose();
        assert!(listener.is_disposed());
        tokio::time::sleep(Duration::from_millis(20)).await;
        emitter.fire(10);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
