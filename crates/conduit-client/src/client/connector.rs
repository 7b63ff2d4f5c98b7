//! Connectors produce one fresh byte stream per protocol connection.
//!
//! The client only needs a [`TransportStream`]; whether it is a TCP socket, a
//! QUIC bidirectional stream or an in-memory duplex is the connector's
//! business.
use crate::config::{ClientOptions, TransportType};
use crate::error::{ConduitError, ConduitResult};
use async_trait::async_trait;
use conduit_transport::{QuicClient, TcpClient, TransportConfig, TransportStream};
use std::net::SocketAddr;
use std::sync::Arc;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Host name announced in `Open` and used for token audiences.
    fn hostname(&self) -> &str;

    async fn connect(&self) -> ConduitResult<TransportStream>;
}

/// Plain TCP.
pub struct TcpConnector {
    client: TcpClient,
    addr: SocketAddr,
    hostname: String,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr, hostname: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            client: TcpClient::new(transport),
            addr,
            hostname: hostname.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn connect(&self) -> ConduitResult<TransportStream> {
        Ok(self.client.connect(self.addr).await?)
    }
}

/// Tunnels the protocol over one bidirectional stream of a new QUIC
/// connection.
pub struct QuicConnector {
    client: QuicClient,
    addr: SocketAddr,
    server_name: String,
}

impl QuicConnector {
    pub fn new(
        addr: SocketAddr,
        server_name: impl Into<String>,
        client_config: quinn::ClientConfig,
        transport: TransportConfig,
    ) -> ConduitResult<Self> {
        let bind: SocketAddr = if addr.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let client = QuicClient::bind(bind, client_config, transport)?;
        Ok(Self {
            client,
            addr,
            server_name: server_name.into(),
        })
    }
}

#[async_trait]
impl Connector for QuicConnector {
    fn hostname(&self) -> &str {
        &self.server_name
    }

    async fn connect(&self) -> ConduitResult<TransportStream> {
        let connection = self.client.connect(self.addr, &self.server_name).await?;
        tracing::debug!(connection_id = connection.info().id.0, peer = %self.addr, "quic connected");
        Ok(connection.open_stream().await?)
    }
}

/// Connector for `options.transport`. QUIC needs a TLS client config.
pub fn connector_for(
    options: &ClientOptions,
    addr: SocketAddr,
    hostname: &str,
    quic_config: Option<quinn::ClientConfig>,
) -> ConduitResult<Arc<dyn Connector>> {
    let transport = TransportConfig {
        max_frame_bytes: options.max_frame_bytes,
        ..TransportConfig::default()
    };
    match (options.transport, quic_config) {
        (TransportType::Tcp, _) => Ok(Arc::new(TcpConnector::new(addr, hostname, transport))),
        (TransportType::Quic, Some(config)) => Ok(Arc::new(QuicConnector::new(
            addr, hostname, config, transport,
        )?)),
        (TransportType::Quic, None) => Err(ConduitError::InvalidArgument(
            "QUIC transport needs a TLS client config".into(),
        )),
    }
}
