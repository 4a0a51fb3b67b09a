//! Backend connections: TCP connect, `PING` handshake, command round trips,
//! and buffered frame reads.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use resp_proto::{Decoder, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::types::{ClientConfig, Error, Role};

const READ_BUF_SIZE: usize = 16 * 1024;

/// One backend connection, dedicated to a single [`Role`] for its lifetime.
pub(crate) struct Connection {
    stream: TcpStream,
    decoder: Decoder,
    /// Frames decoded but not yet handed out.
    pending: VecDeque<Frame>,
    read_buf: Box<[u8; READ_BUF_SIZE]>,
    role: Role,
    addr: String,
}

fn open_error(role: Role, addr: &str, reason: impl Into<String>) -> Error {
    Error::Connection {
        role,
        addr: addr.to_string(),
        reason: reason.into(),
    }
}

impl Connection {
    /// Connect to `config.addr()` and verify the peer answers `PING`.
    ///
    /// Both steps share one `connect_timeout` deadline.
    pub(crate) async fn open(config: &ClientConfig, role: Role) -> Result<Self, Error> {
        let addr = config.addr();
        let deadline = Instant::now() + config.timing.connect_timeout;

        let stream = time::timeout_at(deadline, TcpStream::connect(&addr))
            .await
            .map_err(|_| open_error(role, &addr, "connect timed out"))?
            .map_err(|e| open_error(role, &addr, e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%role, "Failed to set TCP_NODELAY: {e}");
        }

        let mut conn = Self {
            stream,
            decoder: Decoder::new(),
            pending: VecDeque::new(),
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
            role,
            addr,
        };

        let reply = time::timeout_at(deadline, conn.request(&["PING"]))
            .await
            .map_err(|_| open_error(role, &conn.addr, "handshake timed out"))?
            .map_err(|e| open_error(role, &conn.addr, format!("handshake failed: {e}")))?;
        match reply {
            Frame::Error(message) => {
                return Err(open_error(
                    role,
                    &conn.addr,
                    format!("handshake rejected: {message}"),
                ));
            }
            ref pong if pong.as_str() == Some("PONG") => {}
            other => {
                return Err(open_error(
                    role,
                    &conn.addr,
                    format!("unexpected handshake reply: {other:?}"),
                ));
            }
        }

        tracing::debug!(%role, addr = %conn.addr, "Connection established");
        Ok(conn)
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    /// Write one command.
    pub(crate) async fn send<A: AsRef<[u8]>>(&mut self, args: &[A]) -> io::Result<()> {
        let data = resp_proto::encode_command(args);
        self.stream.write_all(&data).await
    }

    /// Read the next frame.
    ///
    /// Cancel safe: bytes already read are decoded into `pending` before the
    /// next await point, so dropping this future loses nothing.
    pub(crate) async fn read_frame(&mut self) -> io::Result<Frame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }

            let n = self.stream.read(self.read_buf.as_mut()).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                ));
            }

            let frames = self
                .decoder
                // n <= read_buf.len() is guaranteed by read()
                .decode(self.read_buf.get(..n).unwrap_or_default())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            self.pending.extend(frames);
        }
    }

    /// Send a command and read its reply.
    pub(crate) async fn request<A: AsRef<[u8]>>(&mut self, args: &[A]) -> io::Result<Frame> {
        self.send(args).await?;
        self.read_frame().await
    }

    /// [`request`](Self::request) bounded by `timeout`.
    ///
    /// A timed-out reply may still arrive later, so the caller must treat the
    /// connection as unusable afterwards.
    pub(crate) async fn request_timeout<A: AsRef<[u8]>>(
        &mut self,
        args: &[A],
        timeout: Duration,
    ) -> io::Result<Frame> {
        time::timeout(timeout, self.request(args))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no reply within {}ms", timeout.as_millis()),
                )
            })?
    }

    /// Shut down the write half so the server sees the connection close.
    pub(crate) async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(role = %self.role, "Shutdown failed: {e}");
        }
    }
}

/// Open the publish-path and receive-path connections, in that order.
///
/// The two handles are owned independently: if the receive path fails, the
/// already open publish path is dropped (closing its socket) on return.
pub(crate) async fn connect(config: &ClientConfig) -> Result<(Connection, Connection), Error> {
    let publisher = Connection::open(config, Role::Publish).await?;
    let receiver = Connection::open(config, Role::Receive).await?;
    Ok((publisher, receiver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, ClientConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = ClientConfig::new("127.0.0.1", port);
        config.timing.connect_timeout = Duration::from_millis(500);
        (listener, config)
    }

    #[tokio::test]
    async fn open_completes_ping_handshake() {
        let (listener, config) = listener().await;
        let server = tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = tcp.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
            tcp.write_all(b"+PONG\r\n").await.unwrap();
            tcp
        });

        let conn = Connection::open(&config, Role::Publish).await.unwrap();
        assert_eq!(conn.role(), Role::Publish);
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn open_rejects_error_handshake() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = tcp.read(&mut buf).await.unwrap();
            tcp.write_all(b"-NOAUTH Authentication required.\r\n")
                .await
                .unwrap();
            tcp
        });

        let err = Connection::open(&config, Role::Receive)
            .await
            .err()
            .unwrap();
        match err {
            Error::Connection { role, reason, .. } => {
                assert_eq!(role, Role::Receive);
                assert!(reason.contains("NOAUTH"), "{reason}");
            }
            other => panic!("expected Connection error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_times_out_without_handshake_reply() {
        let (listener, mut config) = listener().await;
        config.timing.connect_timeout = Duration::from_millis(100);
        let _server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(tcp);
        });

        let err = Connection::open(&config, Role::Publish)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("handshake timed out"), "{err}");
    }

    #[tokio::test]
    async fn read_frame_reassembles_split_frames() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = tcp.read(&mut buf).await.unwrap();
            tcp.write_all(b"+PONG\r\n*3\r\n$7\r\nmess").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tcp.write_all(b"age\r\n$1\r\nc\r\n$3\r\na:b\r\n:5\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut conn = Connection::open(&config, Role::Receive).await.unwrap();
        let frame = conn.read_frame().await.unwrap();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::bulk("message"),
                Frame::bulk("c"),
                Frame::bulk("a:b")
            ])
        );
        assert_eq!(conn.read_frame().await.unwrap(), Frame::Integer(5));
    }

    #[tokio::test]
    async fn read_frame_reports_closed_connection() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = tcp.read(&mut buf).await.unwrap();
            tcp.write_all(b"+PONG\r\n").await.unwrap();
        });

        let mut conn = Connection::open(&config, Role::Receive).await.unwrap();
        let err = conn.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
