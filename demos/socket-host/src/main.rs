//! Demo host wiring the messaging layer together.
//!
//! Run with: cargo run -p socket-host-demo
//!
//! Starts a `background` message server on an in-process bus, a TCP socket
//! server for external hosts, and a WebSocket bridge onto the bus. Every
//! connected client gets its messages echoed back.

use std::{net::SocketAddr, pin::pin, sync::Arc};

use anyhow::Context;
use doomberg_ipc_core::{LocalBus, MessagePassingProtocol};
use doomberg_ipc_lifecycle::{
    ClientLifecycleManager, ExtensionClientSource, LifecycleTracker, SocketClientSource,
    TabEventEmitter,
};
use doomberg_ipc_transport::{
    ClientConnectionEvent, MessageServer, ServerConfig, SocketConfig, SocketConnectionEvent,
    SocketServer, websocket::create_bridge_router,
};
use futures::StreamExt;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVER_ID: &str = "background";

/// Listen addresses, overridable from the environment.
struct HostConfig {
    socket_addr: SocketAddr,
    ws_addr: SocketAddr,
}

impl HostConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            socket_addr: env_addr("DOOMBERG_SOCKET_ADDR", "127.0.0.1:7878")?,
            ws_addr: env_addr("DOOMBERG_WS_ADDR", "127.0.0.1:7879")?,
        })
    }
}

fn env_addr(name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .with_context(|| format!("{name} is not a socket address: {raw}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = HostConfig::from_env()?;

    // In-process side: a message server on the bus, clients keyed by tab.
    let bus = LocalBus::new();
    let server = MessageServer::start(ServerConfig::new(SERVER_ID), Arc::new(bus.port(None)));
    let tabs = TabEventEmitter::new();
    let extension_clients = LifecycleTracker::spawn(
        ClientLifecycleManager::new(),
        &ExtensionClientSource::new(server.clone(), Arc::new(tabs.clone())),
    );
    let mut connections = server.on_did_client_connect();
    tokio::spawn(async move {
        while let Some(event) = connections.next().await {
            tokio::spawn(echo_extension_client(event));
        }
    });

    // External side: framed TCP, clients keyed by the id they present.
    let sockets = SocketServer::bind(SocketConfig::new(config.socket_addr))
        .await
        .context("failed to bind socket server")?;
    let socket_clients = LifecycleTracker::spawn(
        ClientLifecycleManager::new(),
        &SocketClientSource::new(sockets.clone()),
    );
    let mut socket_connections = sockets.on_did_client_connect();
    tokio::spawn(async move {
        while let Some(event) = socket_connections.next().await {
            tokio::spawn(echo_socket_client(event));
        }
    });

    let app = create_bridge_router(bus.clone()).layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(config.ws_addr)
        .await
        .context("failed to bind bridge listener")?;
    tracing::info!(
        socket = %sockets.local_addr(),
        bridge = %format!("ws://{}/ws", config.ws_addr),
        "Host ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("bridge server failed")?;

    tracing::info!("Shutting down");
    extension_clients.dispose();
    socket_clients.dispose();
    server.dispose();
    sockets.dispose();
    Ok(())
}

async fn echo_extension_client(event: ClientConnectionEvent) {
    let protocol = Arc::clone(&event.protocol);
    let mut messages = pin!(protocol.on_message().take_until(event.closed()));
    while let Some(message) = messages.next().await {
        tracing::debug!(source = %event.source, len = message.len(), "Echoing extension message");
        protocol.send(message);
    }
    tracing::debug!(source = %event.source, "Extension echo finished");
}

async fn echo_socket_client(event: SocketConnectionEvent) {
    let protocol = event.protocol;
    let closed = protocol.on_disconnect().into_future();
    let mut messages = pin!(protocol.on_message().take_until(closed));
    while let Some(message) = messages.next().await {
        tracing::debug!(client_id = %event.client_id, len = message.len(), "Echoing socket message");
        protocol.send(message);
    }
    tracing::debug!(client_id = %event.client_id, "Socket echo finished");
}
