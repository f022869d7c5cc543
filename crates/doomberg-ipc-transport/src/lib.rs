//! Transport layer for inter-context messaging.
//!
//! Provides:
//! - `Protocol` - Message passing over a shared message port
//! - `MessageServer` / `MessageClient` - Hello + identifier handshake
//! - Socket transport for host communication
//! - WebSocket bridge (feature: websocket)

pub mod client;
pub mod protocol;
pub mod server;
pub mod socket;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use client::{ClientConfig, ClientState, MessageClient};
pub use protocol::Protocol;
pub use server::{
    AcceptAll, Authenticator, ClientConnectionEvent, ConnectionClosed, ConnectionId,
    MessageServer, ServerConfig,
};
pub use socket::{
    DEFAULT_MAX_FRAME_LEN, SocketConfig, SocketConnectionEvent, SocketError, SocketProtocol, SocketServer,
    connect_socket,
};
