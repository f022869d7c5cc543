//! WebSocket bridge letting out-of-browser hosts join a [`LocalBus`].

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use doomberg_ipc_core::{Envelope, LocalBus, MessagePort, SenderInfo, TabId};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

/// Frame from a bridged host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    /// Post an envelope to one tab, or broadcast.
    Post {
        envelope: Envelope,
        #[serde(default)]
        tab: Option<TabId>,
    },
    /// Ping for keepalive.
    Ping,
}

/// Frame sent to a bridged host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Envelope delivered to the host's port.
    Delivery {
        envelope: Envelope,
        sender: SenderInfo,
    },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

/// Query parameters of the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct BridgeParams {
    /// Tab the host should appear to live in.
    pub tab: Option<TabId>,
}

/// WebSocket handler state.
#[derive(Clone)]
pub struct BridgeState {
    pub bus: LocalBus,
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<BridgeParams>,
    State(state): State<BridgeState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.tab))
}

async fn handle_socket(socket: WebSocket, state: BridgeState, tab: Option<TabId>) {
    let port = state.bus.port(tab);
    let mut deliveries = port.subscribe();
    let (mut sender, mut receiver) = socket.split();
    tracing::info!(port = port.id(), ?tab, "Bridge host attached");

    // Replies from the read loop, merged with bus deliveries below.
    let (tx, mut rx) = mpsc::unbounded_channel::<BridgeEvent>();

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                reply = rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
                delivery = deliveries.next() => match delivery {
                    Some(delivery) => BridgeEvent::Delivery {
                        envelope: delivery.envelope,
                        sender: delivery.sender,
                    },
                    None => break,
                },
            };
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize bridge event: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let request: BridgeRequest = match serde_json::from_str(&msg) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Invalid bridge frame: {e}");
                let _ = tx.send(BridgeEvent::Error {
                    message: format!("Invalid frame: {e}"),
                });
                continue;
            }
        };

        match request {
            BridgeRequest::Ping => {
                let _ = tx.send(BridgeEvent::Pong);
            }
            BridgeRequest::Post { envelope, tab } => {
                if let Err(e) = port.post(envelope, tab) {
                    let _ = tx.send(BridgeEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    send_task.abort();
    tracing::info!(port = port.id(), "Bridge host detached");
}

/// Create the bridge router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_bridge_router(bus.clone()));
/// ```
#[must_use]
pub fn create_bridge_router(bus: LocalBus) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(BridgeState { bus })
}
