//! Physical connections and the protocol handshake
//!
//! A `RedisConnection` owns one transport (TCP, TLS, unix socket, or an
//! in-memory pipe for tests), a decode buffer, and the count of replies
//! still owed to callers. Writes define the required order of reads;
//! transport EOF, IO failure or protocol desync all transition the
//! connection to `Closed`, which is terminal: a closed connection is
//! discarded, never reused.

use crate::command::Command;
use crate::protocol::{RespDecoder, RespEncoder};
use bytes::{Buf, BytesMut};
use redlink_core::{
    config::{ConnectionConfig, ProtocolVersion, TlsConfig},
    error::{RedisError, RedisResult},
    types::Endpoint,
    value::Reply,
};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig as RustlsConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

const READ_BUFFER_CAPACITY: usize = 8192;

/// The underlying byte stream of a connection
pub enum Transport {
    /// Plain TCP stream
    Tcp(TcpStream),
    /// TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
    /// Unix domain socket
    #[cfg(unix)]
    Unix(UnixStream),
    /// In-memory pipe, used by tests
    Mem(DuplexStream),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Mem(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Mem(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Self::Mem(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Mem(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Ready,
    Closed,
}

/// A connection to one server endpoint
pub struct RedisConnection {
    transport: Transport,
    read_buffer: BytesMut,
    state: ConnectionState,
    pending: usize,
    protocol: ProtocolVersion,
    readonly: bool,
    config: ConnectionConfig,
}

impl RedisConnection {
    /// Connect to an endpoint and run the protocol handshake
    pub async fn connect(endpoint: &Endpoint, config: ConnectionConfig) -> RedisResult<Self> {
        Self::connect_inner(endpoint, config, false).await
    }

    /// Connect to a replica endpoint; the handshake additionally enables
    /// read-only command routing on the server side
    pub async fn connect_replica(
        endpoint: &Endpoint,
        config: ConnectionConfig,
    ) -> RedisResult<Self> {
        Self::connect_inner(endpoint, config, true).await
    }

    async fn connect_inner(
        endpoint: &Endpoint,
        config: ConnectionConfig,
        readonly: bool,
    ) -> RedisResult<Self> {
        let transport = match config.unix_socket.clone() {
            Some(path) => Self::unix_transport(&path, &config).await?,
            None => Self::tcp_transport(endpoint, &config).await?,
        };

        let mut conn = Self::from_transport(transport, config);
        conn.readonly = readonly;
        conn.handshake().await?;
        Ok(conn)
    }

    /// Wrap an already-open transport without running a handshake
    pub fn from_transport(transport: Transport, config: ConnectionConfig) -> Self {
        Self {
            transport,
            read_buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            state: ConnectionState::Ready,
            pending: 0,
            protocol: config.protocol_version,
            readonly: false,
            config,
        }
    }

    async fn tcp_transport(endpoint: &Endpoint, config: &ConnectionConfig) -> RedisResult<Transport> {
        let addr = endpoint.to_string();
        debug!("connecting to {addr}");

        let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| RedisError::Connect(format!("connect to {addr} timed out")))?
            .map_err(|e| RedisError::Connect(format!("failed to connect to {addr}: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| RedisError::Connect(format!("failed to set TCP_NODELAY: {e}")))?;

        if let Some(keepalive) = config.tcp_keepalive {
            let sock = socket2::SockRef::from(&stream);
            sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(keepalive))
                .map_err(|e| RedisError::Connect(format!("failed to set TCP keepalive: {e}")))?;
        }

        match &config.tls {
            Some(tls) => Self::tls_transport(stream, &endpoint.host, tls).await,
            None => Ok(Transport::Tcp(stream)),
        }
    }

    async fn tls_transport(
        stream: TcpStream,
        host: &str,
        tls: &TlsConfig,
    ) -> RedisResult<Transport> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = RustlsConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let name = tls
            .server_name
            .clone()
            .unwrap_or_else(|| host.to_string());
        let server_name = ServerName::try_from(name)
            .map_err(|e| RedisError::Config(format!("invalid TLS server name: {e}")))?;

        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| RedisError::Connect(format!("TLS handshake failed: {e}")))?;
        Ok(Transport::Tls(Box::new(stream)))
    }

    #[cfg(unix)]
    async fn unix_transport(
        path: &std::path::Path,
        config: &ConnectionConfig,
    ) -> RedisResult<Transport> {
        let stream = timeout(config.connect_timeout, UnixStream::connect(path))
            .await
            .map_err(|_| RedisError::Connect(format!("connect to {} timed out", path.display())))?
            .map_err(|e| {
                RedisError::Connect(format!("failed to connect to {}: {e}", path.display()))
            })?;
        Ok(Transport::Unix(stream))
    }

    #[cfg(not(unix))]
    async fn unix_transport(
        path: &std::path::Path,
        _config: &ConnectionConfig,
    ) -> RedisResult<Transport> {
        Err(RedisError::Config(format!(
            "unix socket {} not supported on this platform",
            path.display()
        )))
    }

    /// Version negotiation, authentication and session setup.
    ///
    /// Order follows the server's expectations: credentials first, then
    /// the protocol upgrade, then database selection and connection
    /// naming. An upgrade rejection is not an error; the connection
    /// stays on the baseline protocol.
    async fn handshake(&mut self) -> RedisResult<()> {
        if let Some(password) = self.config.password.clone() {
            let command = match self.config.username.clone() {
                Some(username) => Command::new("AUTH").arg(username).arg(password),
                None => Command::new("AUTH").arg(password),
            };
            let reply = self.execute(&command).await.map_err(|e| match e {
                RedisError::Server(msg) => RedisError::Auth(msg),
                other => other,
            })?;
            Self::expect_ok(&reply, "AUTH")?;
        }

        if self.config.protocol_version == ProtocolVersion::Resp3 {
            match self.execute(&Command::new("HELLO").arg(3i64)).await {
                Ok(_) => self.protocol = ProtocolVersion::Resp3,
                Err(RedisError::Server(_)) => {
                    debug!("server rejected protocol upgrade, staying on the baseline");
                    self.protocol = ProtocolVersion::Resp2;
                }
                Err(e) => return Err(e),
            }
        }

        if self.config.database != 0 {
            let command = Command::new("SELECT").arg(i64::from(self.config.database));
            let reply = self.execute(&command).await?;
            Self::expect_ok(&reply, "SELECT")?;
        }

        if let Some(name) = self.config.client_name.clone() {
            let command = Command::new("CLIENT").arg("SETNAME").arg(name);
            let reply = self.execute(&command).await?;
            Self::expect_ok(&reply, "CLIENT SETNAME")?;
        }

        if self.readonly {
            let reply = self.execute(&Command::new("READONLY")).await?;
            Self::expect_ok(&reply, "READONLY")?;
        }

        Ok(())
    }

    fn expect_ok(reply: &Reply, during: &str) -> RedisResult<()> {
        match reply {
            Reply::SimpleString(s) if s == "OK" => Ok(()),
            other => Err(RedisError::Protocol(format!(
                "unexpected {during} reply: {other:?}"
            ))),
        }
    }

    /// Write one encoded command; may be called repeatedly before any
    /// `receive` to pipeline requests.
    pub async fn send(&mut self, command: &Command) -> RedisResult<()> {
        self.ensure_open()?;
        let frame = RespEncoder::command_bytes(command);
        if let Err(e) = write_all_frame(&mut self.transport, &frame).await {
            self.state = ConnectionState::Closed;
            return Err(e);
        }
        self.pending += 1;
        Ok(())
    }

    /// Read the next reply from the stream, suspending until one whole
    /// frame has arrived. Replies come back strictly in the order their
    /// requests were sent.
    pub async fn receive(&mut self) -> RedisResult<Reply> {
        self.ensure_open()?;
        match read_reply(&mut self.transport, &mut self.read_buffer).await {
            Ok(reply) => {
                self.pending = self.pending.saturating_sub(1);
                Ok(reply)
            }
            Err(e) => {
                // decode desync and transport loss are both terminal
                self.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    /// Send one command and return its decoded reply; error replies are
    /// classified and surfaced as `Err`.
    pub async fn execute(&mut self, command: &Command) -> RedisResult<Reply> {
        self.send(command).await?;
        match self.receive().await? {
            Reply::Error(msg) => Err(RedisError::from_server_error(&msg)),
            reply => Ok(reply),
        }
    }

    /// Close the connection; idempotent
    pub async fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            let _ = self.transport.shutdown().await;
        }
    }

    /// Whether the connection has reached its terminal state
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Number of requests sent but not yet answered
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// The protocol version in effect after the handshake
    #[must_use]
    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    fn ensure_open(&self) -> RedisResult<()> {
        if self.is_closed() {
            return Err(RedisError::ConnectionLost(
                "connection is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Split into independent read and write halves for concurrent use
    /// by a dispatch task pair. The decode buffer moves with the reader.
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        let (read, write) = tokio::io::split(self.transport);
        (
            ConnectionReader {
                transport: read,
                buffer: self.read_buffer,
            },
            ConnectionWriter { transport: write },
        )
    }
}

/// Read half of a split connection
pub struct ConnectionReader {
    transport: ReadHalf<Transport>,
    buffer: BytesMut,
}

impl ConnectionReader {
    /// Read the next complete reply
    pub async fn read_reply(&mut self) -> RedisResult<Reply> {
        read_reply(&mut self.transport, &mut self.buffer).await
    }
}

/// Write half of a split connection
pub struct ConnectionWriter {
    transport: WriteHalf<Transport>,
}

impl ConnectionWriter {
    /// Write one already-encoded frame
    pub async fn write_frame(&mut self, frame: &[u8]) -> RedisResult<()> {
        write_all_frame(&mut self.transport, frame).await
    }

    /// Shut down the write direction
    pub async fn shutdown(&mut self) {
        let _ = self.transport.shutdown().await;
    }
}

async fn write_all_frame<W>(writer: &mut W, frame: &[u8]) -> RedisResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(frame)
        .await
        .map_err(|e| RedisError::ConnectionLost(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| RedisError::ConnectionLost(format!("flush failed: {e}")))?;
    Ok(())
}

async fn read_reply<R>(reader: &mut R, buffer: &mut BytesMut) -> RedisResult<Reply>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut cursor = Cursor::new(&buffer[..]);
        if let Some(reply) = RespDecoder::decode(&mut cursor)? {
            let consumed = cursor.position() as usize;
            buffer.advance(consumed);
            return Ok(reply);
        }

        let read = reader
            .read_buf(buffer)
            .await
            .map_err(|e| RedisError::ConnectionLost(format!("read failed: {e}")))?;
        if read == 0 {
            return Err(RedisError::ConnectionLost(
                "connection closed by server".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_pair(config: ConnectionConfig) -> (RedisConnection, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        (
            RedisConnection::from_transport(Transport::Mem(client), config),
            server,
        )
    }

    #[tokio::test]
    async fn test_send_receive_in_order() {
        let (mut conn, mut server) = mem_pair(ConnectionConfig::default());

        conn.send(&Command::new("SET").arg("foo").arg("bar"))
            .await
            .unwrap();
        conn.send(&Command::new("GET").arg("foo")).await.unwrap();
        assert_eq!(conn.pending(), 2);

        let mut request = vec![0u8; 128];
        let n = server.read(&mut request).await.unwrap();
        assert_eq!(
            &request[..n],
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n"
                .as_slice()
        );

        server.write_all(b"+OK\r\n$3\r\nbar\r\n").await.unwrap();

        assert_eq!(
            conn.receive().await.unwrap(),
            Reply::SimpleString("OK".to_string())
        );
        assert_eq!(conn.receive().await.unwrap(), Reply::from("bar"));
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_receive_across_partial_reads() {
        let (mut conn, mut server) = mem_pair(ConnectionConfig::default());
        conn.send(&Command::new("GET").arg("k")).await.unwrap();

        let reply = tokio::spawn(async move {
            let reply = conn.receive().await;
            (reply, conn)
        });

        server.write_all(b"$5\r\nhe").await.unwrap();
        tokio::task::yield_now().await;
        server.write_all(b"llo\r\n").await.unwrap();

        let (reply, _conn) = reply.await.unwrap();
        assert_eq!(reply.unwrap(), Reply::from("hello"));
    }

    #[tokio::test]
    async fn test_eof_is_connection_lost_and_terminal() {
        let (mut conn, server) = mem_pair(ConnectionConfig::default());
        conn.send(&Command::new("PING")).await.unwrap();
        drop(server);

        assert!(matches!(
            conn.receive().await,
            Err(RedisError::ConnectionLost(_))
        ));
        assert!(conn.is_closed());
        // closed is terminal for both directions
        assert!(matches!(
            conn.send(&Command::new("PING")).await,
            Err(RedisError::ConnectionLost(_))
        ));
        assert!(matches!(
            conn.receive().await,
            Err(RedisError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_protocol_desync_closes_connection() {
        let (mut conn, mut server) = mem_pair(ConnectionConfig::default());
        conn.send(&Command::new("PING")).await.unwrap();
        server.write_all(b"?bogus\r\n").await.unwrap();

        assert!(matches!(
            conn.receive().await,
            Err(RedisError::Protocol(_))
        ));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut conn, _server) = mem_pair(ConnectionConfig::default());
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_execute_classifies_error_replies() {
        let (mut conn, mut server) = mem_pair(ConnectionConfig::default());

        let task = tokio::spawn(async move {
            let result = conn.execute(&Command::new("GET").arg("k")).await;
            (result, conn)
        });

        let mut request = vec![0u8; 64];
        let _ = server.read(&mut request).await.unwrap();
        server
            .write_all(b"-MOVED 866 10.1.1.1:7001\r\n")
            .await
            .unwrap();

        let (result, _conn) = task.await.unwrap();
        assert!(matches!(result, Err(RedisError::Moved { slot: 866, .. })));
    }
}
