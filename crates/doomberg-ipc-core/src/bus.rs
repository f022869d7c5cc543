//! In-process message bus standing in for the browser's messaging API.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{
    envelope::{Delivery, Envelope, PortId, SenderInfo, TabId},
    traits::{MessagePort, TransportError},
};

const BUS_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct Routed {
    delivery: Delivery,
    to: Option<TabId>,
}

/// Shared broadcast medium. Every attached port sees broadcasts from the
/// others; tab-addressed posts only reach ports living in that tab.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Routed>,
    next_port: Arc<AtomicU64>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            sender,
            next_port: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attach a context, optionally hosted in a tab.
    #[must_use]
    pub fn port(&self, tab: Option<TabId>) -> BusPort {
        BusPort {
            id: self.next_port.fetch_add(1, Ordering::Relaxed),
            tab,
            sender: self.sender.clone(),
        }
    }
}

/// One context's attachment to a [`LocalBus`].
#[derive(Clone)]
pub struct BusPort {
    id: PortId,
    tab: Option<TabId>,
    sender: broadcast::Sender<Routed>,
}

impl BusPort {
    /// Identifier of this port on its bus.
    #[must_use]
    pub const fn id(&self) -> PortId {
        self.id
    }

    /// Tab this port lives in, if any.
    #[must_use]
    pub const fn tab(&self) -> Option<TabId> {
        self.tab
    }
}

impl MessagePort for BusPort {
    fn post(&self, envelope: Envelope, tab: Option<TabId>) -> Result<(), TransportError> {
        let routed = Routed {
            delivery: Delivery {
                envelope,
                sender: SenderInfo {
                    tab_id: self.tab,
                    port_id: self.id,
                },
            },
            to: tab,
        };
        self.sender
            .send(routed)
            .map(|_| ())
            .map_err(|_| TransportError::NoReceiver(tab))
    }

    fn subscribe(&self) -> BoxStream<'static, Delivery> {
        let (own_id, own_tab) = (self.id, self.tab);
        BroadcastStream::new(self.sender.subscribe())
            .filter_map(move |res| async move {
                match res {
                    Ok(routed) => {
                        let from_self = routed.delivery.sender.port_id == own_id;
                        let addressed = routed.to.is_none() || routed.to == own_tab;
                        (!from_self && addressed).then_some(routed.delivery)
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(port = own_id, skipped, "bus port lagged");
                        None
                    }
                }
            })
            .boxed()
    }
}
