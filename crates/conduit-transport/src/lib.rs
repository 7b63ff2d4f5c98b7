// Byte-stream transports: TCP sockets and QUIC bidirectional streams.
use anyhow::{Context, Result, anyhow};
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1 << 48);

/// Transport-level configuration defaults.
///
/// ```
/// use conduit_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_frame_bytes > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
    pub max_streams: u16,
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_streams: 16,
            connect_timeout: Duration::from_secs(30),
            nodelay: true,
        }
    }
}

impl TransportConfig {
    fn quinn_transport_config(&self) -> quinn::TransportConfig {
        let mut config = quinn::TransportConfig::default();
        let streams = quinn::VarInt::from_u32(self.max_streams as u32);
        config.max_concurrent_bidi_streams(streams);
        config.max_concurrent_uni_streams(streams);
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Stable connection identifier used for tracing/logging.
pub struct ConnectionId(pub u64);

impl ConnectionId {
    fn next_local() -> Self {
        Self(NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
/// Metadata about a live transport connection. In-memory pipes have no peer address.
///
/// ```
/// use conduit_transport::{ConnectionId, ConnectionInfo};
/// use std::net::SocketAddr;
///
/// let info = ConnectionInfo {
///     id: ConnectionId(42),
///     peer_addr: Some("127.0.0.1:5671".parse::<SocketAddr>().expect("addr")),
/// };
/// assert_eq!(info.id.0, 42);
/// ```
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: Option<SocketAddr>,
}

/// An established duplex byte stream, split into owned halves.
///
/// QUIC streams keep their connection handle so the connection outlives the
/// stream halves.
pub struct TransportStream {
    pub info: ConnectionInfo,
    pub reader: BoxReader,
    pub writer: BoxWriter,
    _connection: Option<Connection>,
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl TransportStream {
    /// Wrap any duplex IO object, e.g. `tokio::io::duplex` in tests.
    ///
    /// ```
    /// use conduit_transport::TransportStream;
    ///
    /// let (client, _server) = tokio::io::duplex(1024);
    /// let stream = TransportStream::from_io(client);
    /// assert!(stream.info.peer_addr.is_none());
    /// ```
    pub fn from_io<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self {
            info: ConnectionInfo {
                id: ConnectionId::next_local(),
                peer_addr: None,
            },
            reader: Box::new(reader),
            writer: Box::new(writer),
            _connection: None,
        }
    }

    pub fn into_split(self) -> (BoxReader, BoxWriter) {
        (self.reader, self.writer)
    }
}

/// Plain TCP connector.
#[derive(Debug, Clone, Default)]
pub struct TcpClient {
    transport: TransportConfig,
}

impl TcpClient {
    pub fn new(transport: TransportConfig) -> Self {
        Self { transport }
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<TransportStream> {
        let stream = tokio::time::timeout(self.transport.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("TCP connect to {addr} timed out"))?
            .context("establish TCP connection")?;
        stream
            .set_nodelay(self.transport.nodelay)
            .context("set TCP_NODELAY")?;
        let info = ConnectionInfo {
            id: ConnectionId::next_local(),
            peer_addr: Some(stream.peer_addr().context("read TCP peer address")?),
        };
        tracing::debug!(connection_id = info.id.0, peer = %addr, "tcp connected");
        let (reader, writer) = stream.into_split();
        Ok(TransportStream {
            info,
            reader: Box::new(reader),
            writer: Box::new(writer),
            _connection: None,
        })
    }
}

/// QUIC server endpoint wrapper.
///
/// ```no_run
/// use conduit_transport::{QuicServer, TransportConfig};
/// use quinn::ServerConfig;
/// use std::net::SocketAddr;
///
/// fn server_config() -> ServerConfig {
///     // Provide a real TLS config when wiring this up in a service.
///     unimplemented!()
/// }
///
/// let bind: SocketAddr = "127.0.0.1:0".parse().expect("addr");
/// let transport = TransportConfig::default();
/// let _server = QuicServer::bind(bind, server_config(), transport).expect("bind");
/// ```
#[derive(Debug)]
pub struct QuicServer {
    endpoint: Endpoint,
}

impl QuicServer {
    pub fn bind(
        addr: SocketAddr,
        mut server_config: ServerConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config();
        server_config.transport_config(Arc::new(quinn_transport));
        let endpoint = Endpoint::server(server_config, addr).context("bind QUIC server")?;
        Ok(Self { endpoint })
    }

    pub async fn accept(&self) -> Result<QuicConnection> {
        let connecting = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow!("no incoming QUIC connections"))?;
        let connection = connecting.await.context("accept QUIC connection")?;
        QuicConnection::new(connection)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("read QUIC local address")
    }
}

/// QUIC client endpoint wrapper.
#[derive(Debug)]
pub struct QuicClient {
    endpoint: Endpoint,
    transport: TransportConfig,
}

impl QuicClient {
    pub fn bind(
        addr: SocketAddr,
        mut client_config: ClientConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config();
        client_config.transport_config(Arc::new(quinn_transport));
        let mut endpoint = Endpoint::client(addr).context("bind QUIC client")?;
        endpoint.set_default_client_config(client_config);
        Ok(Self {
            endpoint,
            transport,
        })
    }

    pub async fn connect(&self, addr: SocketAddr, server_name: &str) -> Result<QuicConnection> {
        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .context("initiate QUIC connection")?;
        let connection = tokio::time::timeout(self.transport.connect_timeout, connecting)
            .await
            .map_err(|_| anyhow!("QUIC connect to {addr} timed out"))?
            .context("establish QUIC connection")?;
        QuicConnection::new(connection)
    }
}

/// Active QUIC connection wrapper.
///
/// ```no_run
/// use conduit_transport::QuicConnection;
///
/// async fn open(connection: QuicConnection) -> anyhow::Result<()> {
///     let _stream = connection.open_stream().await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    info: ConnectionInfo,
}

impl QuicConnection {
    fn new(connection: Connection) -> Result<Self> {
        let id = u64::try_from(connection.stable_id()).context("stable id fits u64")?;
        let info = ConnectionInfo {
            id: ConnectionId(id),
            peer_addr: Some(connection.remote_address()),
        };
        Ok(Self {
            inner: connection,
            info,
        })
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Open the bidirectional stream that carries protocol frames.
    pub async fn open_stream(&self) -> Result<TransportStream> {
        let (send, recv) = self.inner.open_bi().await.context("open bidi stream")?;
        Ok(self.wrap(send, recv))
    }

    /// Accept the peer's frame stream.
    pub async fn accept_stream(&self) -> Result<TransportStream> {
        let (send, recv) = self.inner.accept_bi().await.context("accept bidi stream")?;
        Ok(self.wrap(send, recv))
    }

    fn wrap(&self, send: quinn::SendStream, recv: quinn::RecvStream) -> TransportStream {
        TransportStream {
            info: self.info.clone(),
            reader: Box::new(recv),
            writer: Box::new(send),
            _connection: Some(self.inner.clone()),
        }
    }
}
