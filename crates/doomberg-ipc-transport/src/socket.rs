//! Socket transport for host communication.
//!
//! Frames are `kind: u8`, `len: u32` (big endian), then `len` payload
//! bytes. The first frame a client writes carries its UTF-8 client id.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use doomberg_ipc_core::{BufferedEmitter, MessagePassingProtocol};
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Socket error.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("Unknown frame kind {0}")]
    UnknownFrameKind(u8),
    #[error("Client id is not valid UTF-8")]
    InvalidClientId(#[from] std::string::FromUtf8Error),
    #[error("Expected client id frame")]
    MissingClientId,
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

/// Socket transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Address the server binds to.
    pub addr: SocketAddr,
    /// Largest payload accepted or sent, in bytes.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// How long a new connection may take to send its client id.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

const fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

const fn default_handshake_timeout_ms() -> u64 {
    5_000
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_frame_len: default_max_frame_len(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl SocketConfig {
    /// Create a config for `addr` with default limits.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            ..Self::default()
        }
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Regular = 1,
    Disconnect = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = SocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Regular),
            2 => Ok(Self::Disconnect),
            other => Err(SocketError::UnknownFrameKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    kind: FrameKind,
    payload: Bytes,
}

impl Frame {
    const fn regular(payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Regular,
            payload,
        }
    }

    const fn disconnect() -> Self {
        Self {
            kind: FrameKind::Disconnect,
            payload: Bytes::new(),
        }
    }

    fn encode(&self) -> Result<Bytes, SocketError> {
        let len = self.payload.len();
        let wire_len = u32::try_from(len).map_err(|_| SocketError::FrameTooLarge {
            len,
            max: u32::MAX as usize,
        })?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + len);
        buf.put_u8(self.kind as u8);
        buf.put_u32(wire_len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Read one frame. `Ok(None)` on a clean end of stream.
async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Frame>, SocketError>
where
    R: AsyncRead + Unpin,
{
    let kind = match reader.read_u8().await {
        Ok(kind) => kind,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let kind = FrameKind::try_from(kind)?;
    let len = reader.read_u32().await? as usize;
    if len > max_len {
        return Err(SocketError::FrameTooLarge { len, max: max_len });
    }
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        kind,
        payload: Bytes::from(payload),
    }))
}

struct Shared {
    inbound: BufferedEmitter<Bytes>,
    closed: CancellationToken,
}

/// [`MessagePassingProtocol`] over a byte stream.
pub struct SocketProtocol {
    tx: mpsc::UnboundedSender<Frame>,
    shared: Arc<Shared>,
    max_frame_len: usize,
    cancel: CancellationToken,
}

impl SocketProtocol {
    /// Start reader and writer tasks over `stream`.
    #[must_use]
    pub fn new<S>(stream: S, max_frame_len: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let shared = Arc::new(Shared {
            inbound: BufferedEmitter::new(),
            closed: CancellationToken::new(),
        });
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let is_disconnect = frame.kind == FrameKind::Disconnect;
                let encoded = match frame.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        tracing::warn!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&encoded).await {
                    tracing::warn!("Socket write failed, dropping frame: {e}");
                    break;
                }
                if is_disconnect {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let reader_shared = Arc::clone(&shared);
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    () = reader_cancel.cancelled() => break,
                    frame = read_frame(&mut reader, max_frame_len) => frame,
                };
                match frame {
                    Ok(Some(Frame {
                        kind: FrameKind::Regular,
                        payload,
                    })) => reader_shared.inbound.fire(payload),
                    Ok(Some(Frame {
                        kind: FrameKind::Disconnect,
                        ..
                    })) => {
                        tracing::debug!("Peer sent disconnect frame");
                        break;
                    }
                    Ok(None) => {
                        tracing::debug!("Socket closed by peer");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Socket read failed: {e}");
                        break;
                    }
                }
            }
            reader_shared.closed.cancel();
        });

        Self {
            tx,
            shared,
            max_frame_len,
            cancel,
        }
    }

    /// Accept side: read the client id frame, then start the protocol.
    ///
    /// # Errors
    /// Returns error if the first frame is missing, malformed or late.
    pub async fn accept<S>(
        mut stream: S,
        config: &SocketConfig,
    ) -> Result<(Self, String), SocketError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let timeout = config.handshake_timeout();
        let first = tokio::time::timeout(timeout, read_frame(&mut stream, config.max_frame_len))
            .await
            .map_err(|_| SocketError::HandshakeTimeout(timeout))??;
        let client_id = match first {
            Some(Frame {
                kind: FrameKind::Regular,
                payload,
            }) => String::from_utf8(payload.to_vec())?,
            _ => return Err(SocketError::MissingClientId),
        };
        Ok((Self::new(stream, config.max_frame_len), client_id))
    }

    /// Connect side: write the client id frame, then start the protocol.
    ///
    /// # Errors
    /// Returns error if the id frame cannot be written.
    pub async fn connect<S>(
        mut stream: S,
        client_id: &str,
        max_frame_len: usize,
    ) -> Result<Self, SocketError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let frame = Frame::regular(Bytes::copy_from_slice(client_id.as_bytes()));
        stream.write_all(&frame.encode()?).await?;
        Ok(Self::new(stream, max_frame_len))
    }

    /// Whether the peer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

impl Drop for SocketProtocol {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl MessagePassingProtocol for SocketProtocol {
    fn send(&self, buffer: Bytes) {
        if buffer.len() > self.max_frame_len {
            tracing::warn!(
                len = buffer.len(),
                max = self.max_frame_len,
                "Frame exceeds limit, dropping"
            );
            return;
        }
        if self.tx.send(Frame::regular(buffer)).is_err() {
            tracing::warn!("Socket writer gone, dropping frame");
        }
    }

    fn on_message(&self) -> BoxStream<'static, Bytes> {
        self.shared.inbound.event()
    }

    fn on_disconnect(&self) -> BoxStream<'static, ()> {
        let closed = self.shared.closed.clone();
        futures::stream::once(async move { closed.cancelled().await }).boxed()
    }

    fn disconnect(&self) {
        let _ = self.tx.send(Frame::disconnect());
    }
}

/// Connect to a [`SocketServer`].
///
/// # Errors
/// Returns error if the TCP connection or id frame fails.
pub async fn connect_socket(
    addr: SocketAddr,
    client_id: &str,
    max_frame_len: usize,
) -> Result<SocketProtocol, SocketError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    SocketProtocol::connect(stream, client_id, max_frame_len).await
}

/// Published once per accepted socket connection.
#[derive(Clone)]
pub struct SocketConnectionEvent {
    /// Server-assigned id, unique per accepted connection.
    pub connection_id: u64,
    /// Id the client presented in its first frame.
    pub client_id: String,
    pub peer_addr: SocketAddr,
    pub protocol: Arc<SocketProtocol>,
}

struct SocketServerInner {
    config: SocketConfig,
    local_addr: SocketAddr,
    connections: BufferedEmitter<SocketConnectionEvent>,
    clients: Mutex<HashMap<u64, SocketConnectionEvent>>,
    next_connection: AtomicU64,
    cancel: CancellationToken,
}

impl Drop for SocketServerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// TCP server speaking the socket framing.
#[derive(Clone)]
pub struct SocketServer {
    inner: Arc<SocketServerInner>,
}

impl SocketServer {
    /// Bind and start accepting.
    ///
    /// # Errors
    /// Returns error if the address cannot be bound.
    pub async fn bind(config: SocketConfig) -> Result<Self, SocketError> {
        let listener = TcpListener::bind(config.addr).await?;
        let local_addr = listener.local_addr()?;
        let inner = Arc::new(SocketServerInner {
            config,
            local_addr,
            connections: BufferedEmitter::new(),
            clients: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(accept_loop(
            Arc::downgrade(&inner),
            listener,
            inner.cancel.clone(),
        ));
        tracing::info!(%local_addr, "Socket server listening");
        Ok(Self { inner })
    }

    /// Address the server is listening on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Accepted connections. The first listener also receives earlier ones.
    #[must_use]
    pub fn on_did_client_connect(&self) -> BoxStream<'static, SocketConnectionEvent> {
        self.inner.connections.event()
    }

    /// Stop tracking a connection. Returns whether it was tracked.
    pub fn forget(&self, connection_id: u64) -> bool {
        self.inner.clients.lock().remove(&connection_id).is_some()
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Stop accepting and disconnect every tracked client.
    pub fn dispose(&self) {
        self.inner.cancel.cancel();
        let clients: Vec<SocketConnectionEvent> =
            self.inner.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.protocol.disconnect();
        }
        tracing::info!(local_addr = %self.inner.local_addr, "Socket server disposed");
    }
}

async fn accept_loop(server: Weak<SocketServerInner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Accept failed: {e}");
                continue;
            }
        };
        let Some(inner) = server.upgrade() else {
            break;
        };
        let _ = stream.set_nodelay(true);

        // Handshake off the accept loop so a slow client cannot stall others.
        tokio::spawn(async move {
            match SocketProtocol::accept(stream, &inner.config).await {
                Ok((protocol, client_id)) => {
                    let event = SocketConnectionEvent {
                        connection_id: inner.next_connection.fetch_add(1, Ordering::Relaxed),
                        client_id,
                        peer_addr,
                        protocol: Arc::new(protocol),
                    };
                    tracing::info!(
                        %peer_addr,
                        client_id = %event.client_id,
                        connection_id = event.connection_id,
                        "Socket client connected"
                    );
                    inner
                        .clients
                        .lock()
                        .insert(event.connection_id, event.clone());
                    inner
                        .connections
                        .retain(|connection| !connection.protocol.is_closed());
                    inner.connections.fire(event);
                }
                Err(e) => tracing::warn!(%peer_addr, "Socket handshake failed: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (a, b) = tokio::io::duplex(1024);
        let left = SocketProtocol::new(a, DEFAULT_MAX_FRAME_LEN);
        let right = SocketProtocol::new(b, DEFAULT_MAX_FRAME_LEN);
        let mut inbound = right.on_message();

        left.send(Bytes::from_static(b"one"));
        left.send(Bytes::new());
        left.send(Bytes::from_static(b"three"));

        let expected: [&[u8]; 3] = [b"one", b"", b"three"];
        for expected in expected {
            let got = tokio::time::timeout(WAIT, inbound.next()).await.unwrap();
            assert_eq!(got.as_deref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn disconnect_frame_closes_peer() {
        let (a, b) = tokio::io::duplex(1024);
        let left = SocketProtocol::new(a, DEFAULT_MAX_FRAME_LEN);
        let right = SocketProtocol::new(b, DEFAULT_MAX_FRAME_LEN);

        left.disconnect();

        let closed = tokio::time::timeout(WAIT, right.on_disconnect().next()).await;
        assert_eq!(closed.unwrap(), Some(()));
        assert!(right.is_closed());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::regular(Bytes::from(vec![0; 64])).encode().unwrap();
        a.write_all(&frame).await.unwrap();

        let err = read_frame(&mut b, 16).await.unwrap_err();
        assert!(matches!(err, SocketError::FrameTooLarge { len: 64, max: 16 }));
    }

    #[tokio::test]
    async fn send_drops_payload_over_limit() {
        let (a, b) = tokio::io::duplex(1024);
        let left = SocketProtocol::new(a, 8);
        let right = SocketProtocol::new(b, DEFAULT_MAX_FRAME_LEN);
        let mut inbound = right.on_message();

        left.send(Bytes::from(vec![7; 16]));
        left.send(Bytes::from_static(b"ok"));

        let got = tokio::time::timeout(WAIT, inbound.next()).await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"ok")));
        assert!(!right.is_closed());
        assert!(!left.is_closed());
    }

    #[tokio::test]
    async fn unknown_frame_kind_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[9, 0, 0, 0, 0]).await.unwrap();

        let err = read_frame(&mut b, 16).await.unwrap_err();
        assert!(matches!(err, SocketError::UnknownFrameKind(9)));
    }

    #[tokio::test]
    async fn server_accepts_client_and_echoes() {
        let server = SocketServer::bind(SocketConfig::default()).await.unwrap();
        let mut connections = server.on_did_client_connect();

        let client = connect_socket(server.local_addr(), "backtest-runner", DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        let event = tokio::time::timeout(WAIT, connections.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.client_id, "backtest-runner");
        assert_eq!(server.connection_count(), 1);

        let mut server_rx = event.protocol.on_message();
        let mut client_rx = client.on_message();
        client.send(Bytes::from_static(b"orders?"));
        let got = tokio::time::timeout(WAIT, server_rx.next()).await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"orders?")));

        event.protocol.send(Bytes::from_static(b"none"));
        let got = tokio::time::timeout(WAIT, client_rx.next()).await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"none")));

        assert!(server.forget(event.connection_id));
        assert!(!server.forget(event.connection_id));
    }

    #[tokio::test]
    async fn backlog_skips_clients_gone_before_first_listener() {
        let server = SocketServer::bind(SocketConfig::default()).await.unwrap();
        let gone = connect_socket(server.local_addr(), "gone", DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        tokio::time::timeout(WAIT, async {
            while server.connection_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        gone.disconnect();
        tokio::time::timeout(WAIT, async {
            while !server
                .inner
                .clients
                .lock()
                .values()
                .all(|c| c.protocol.is_closed())
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let _stays = connect_socket(server.local_addr(), "stays", DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        tokio::time::timeout(WAIT, async {
            while server.connection_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let mut connections = server.on_did_client_connect();
        let first = tokio::time::timeout(WAIT, connections.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.client_id, "stays");
    }

    #[tokio::test]
    async fn dispose_disconnects_clients() {
        let server = SocketServer::bind(SocketConfig::default()).await.unwrap();
        let mut connections = server.on_did_client_connect();
        let client = connect_socket(server.local_addr(), "runner", DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        tokio::time::timeout(WAIT, connections.next())
            .await
            .unwrap()
            .unwrap();

        server.dispose();

        let closed = tokio::time::timeout(WAIT, client.on_disconnect().next()).await;
        assert_eq!(closed.unwrap(), Some(()));
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: SocketConfig = serde_json::from_str(r#"{"addr":"127.0.0.1:7878"}"#).unwrap();
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
    }
}
