//! TCP transport implementation.
//!
//! Clients speak MQTT 3.1.1 directly over TCP. [`MqttConnection`] is generic
//! over the byte stream so the same session code runs over in-memory pipes.

use async_trait::async_trait;
use bytes::BytesMut;
use porchlight_protocol::{codec, packet_name, ConnAck, ConnectReturnCode, Packet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::traits::{ClientInfo, Connection, ConnectionId, Transport, TransportError};

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum packet size in bytes.
    pub max_packet_size: usize,
    /// How long a client has to send CONNECT.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_packet_size: codec::DEFAULT_MAX_PACKET_SIZE,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Settings applied to every accepted connection.
    pub connection: ConnectionConfig,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 2000)),
            connection: ConnectionConfig::default(),
        }
    }
}

/// TCP transport.
pub struct TcpTransport {
    listener: TcpListener,
    config: TcpConfig,
    authenticator: Arc<dyn Authenticator>,
}

impl TcpTransport {
    /// Create a new TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(
        config: TcpConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!(
            "TCP transport listening on {}",
            listener.local_addr().unwrap_or(config.bind_addr)
        );

        Ok(Self {
            listener,
            config,
            authenticator,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        debug!("Accepted TCP connection from {}", addr);

        let conn = MqttConnection::new(
            stream,
            Some(addr),
            self.config.connection.clone(),
            self.authenticator.clone(),
        );
        Ok(Box::new(conn))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// An MQTT connection over any byte stream.
pub struct MqttConnection<S = TcpStream> {
    id: ConnectionId,
    stream: S,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    config: ConnectionConfig,
    authenticator: Arc<dyn Authenticator>,
}

impl<S> MqttConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    /// Wrap an established byte stream.
    pub fn new(
        stream: S,
        remote_addr: Option<SocketAddr>,
        config: ConnectionConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
            remote_addr,
            is_open: true,
            read_buffer: BytesMut::with_capacity(4096),
            write_buffer: BytesMut::with_capacity(1024),
            config,
            authenticator,
        }
    }

    async fn refuse(&mut self, code: ConnectReturnCode) {
        if let Err(e) = self.send(Packet::ConnAck(ConnAck::new(code, false))).await {
            debug!(connection = %self.id, error = %e, "Failed to send refusing CONNACK");
        }
        if let Err(e) = self.close().await {
            debug!(connection = %self.id, error = %e, "Failed to close refused connection");
        }
    }
}

#[async_trait]
impl<S> Connection for MqttConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn handshake(&mut self) -> Result<ClientInfo, TransportError> {
        let first = tokio::time::timeout(self.config.handshake_timeout, self.recv())
            .await
            .map_err(|_| TransportError::Timeout)??;

        let connect = match first {
            Some(Packet::Connect(connect)) => connect,
            Some(other) => {
                let name = packet_name(&other);
                warn!(connection = %self.id, packet = name, "First packet was not CONNECT");
                self.close().await.ok();
                return Err(TransportError::UnexpectedPacket(name));
            }
            None => return Err(TransportError::ConnectionClosed),
        };

        if !self
            .authenticator
            .authenticate(&connect.client_id, connect.login.as_ref())
        {
            warn!(
                connection = %self.id,
                client = %connect.client_id,
                remote = ?self.remote_addr,
                "Authentication failed"
            );
            self.refuse(ConnectReturnCode::BadUserNamePassword).await;
            return Err(TransportError::AuthenticationFailed(connect.client_id));
        }

        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                self.refuse(ConnectReturnCode::BadClientId).await;
                return Err(TransportError::ClientIdRejected);
            }
            self.id.to_string()
        } else {
            connect.client_id
        };

        self.send(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)))
            .await?;

        debug!(connection = %self.id, client = %client_id, "Handshake complete");
        Ok(ClientInfo {
            client_id,
            keep_alive: Duration::from_secs(u64::from(connect.keep_alive)),
            clean_session: connect.clean_session,
            username: connect.login.map(|l| l.username),
        })
    }

    async fn recv(&mut self) -> Result<Option<Packet>, TransportError> {
        loop {
            if let Some(packet) =
                codec::decode_from(&mut self.read_buffer, self.config.max_packet_size)?
            {
                return Ok(Some(packet));
            }

            // read_buf is cancel safe: nothing is consumed unless it completes
            let read = self.stream.read_buf(&mut self.read_buffer).await?;
            if read == 0 {
                self.is_open = false;
                if self.read_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::ConnectionClosed);
            }
        }
    }

    async fn send(&mut self, packet: Packet) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        self.write_buffer.clear();
        codec::encode_into(&packet, &mut self.write_buffer)?;
        self.stream.write_all(&self.write_buffer).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;
        self.stream.shutdown().await.map_err(TransportError::Io)
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
