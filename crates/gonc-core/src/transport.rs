//! Outbound connection establishment. Dialers handle the "how" of data
//! movement (plain TCP, connected UDP, or an SSH tunnel implemented in a
//! higher crate) independent of what happens over the connection.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpSocket, TcpStream, UdpSocket, lookup_host},
};
use tokio_util::sync::CancellationToken;

use gonc_types::{NcError, NetOp};

type Result<T> = gonc_types::NcResult<T>;

/// Byte streams usable by the forwarder.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> StreamIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased byte stream.
pub type BoxedStream = Box<dyn StreamIo>;

/// An established connection: a byte stream plus the peer address when one
/// is known.
pub struct Connection {
    stream: BoxedStream,
    peer: Option<SocketAddr>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

impl Connection {
    pub fn new<S>(stream: S, peer: Option<SocketAddr>) -> Self
    where
        S: StreamIo + 'static,
    {
        Connection {
            stream: Box::new(stream),
            peer,
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn peer_label(&self) -> String {
        match self.peer {
            Some(addr) => addr.to_string(),
            None => "unknown".to_string(),
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Build a `host:port` string, bracketing IPv6 hosts.
pub fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Opens outbound connections. Stateless dialers have a no-op `close`;
/// long-lived ones (the SSH dialer) release their transport there.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        token: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<Connection>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Plain TCP dialer, optionally binding a specific source port.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    pub timeout: Option<Duration>,
    /// Optional source-port binding (None = ephemeral).
    pub local_port: Option<u16>,
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        token: &CancellationToken,
        _network: &str,
        address: &str,
    ) -> Result<Connection> {
        let connect = async {
            match self.local_port {
                Some(port) => {
                    let remote = resolve(address).await?;
                    let socket = if remote.is_ipv4() {
                        TcpSocket::new_v4()?
                    } else {
                        TcpSocket::new_v6()?
                    };
                    socket.set_reuseaddr(true)?;
                    let local: SocketAddr = if remote.is_ipv4() {
                        SocketAddr::from(([0, 0, 0, 0], port))
                    } else {
                        SocketAddr::from(([0u16; 8], port))
                    };
                    socket.bind(local)?;
                    socket.connect(remote).await
                }
                None => TcpStream::connect(address).await,
            }
        };

        let stream = tokio::select! {
            _ = token.cancelled() => return Err(NcError::Cancelled),
            res = bounded(self.timeout, connect) => {
                res?.map_err(|err| NcError::network(NetOp::Dial, address, err))?
            }
        };
        stream.set_nodelay(true).ok();
        let peer = stream.peer_addr().ok();
        Ok(Connection::new(stream, peer))
    }
}

/// Connected-UDP dialer.
#[derive(Debug, Clone, Default)]
pub struct UdpDialer {
    pub timeout: Option<Duration>,
    pub local_port: Option<u16>,
}

#[async_trait]
impl Dialer for UdpDialer {
    async fn dial(
        &self,
        token: &CancellationToken,
        _network: &str,
        address: &str,
    ) -> Result<Connection> {
        let connect = async {
            let remote = resolve(address).await?;
            let local: SocketAddr = if remote.is_ipv4() {
                SocketAddr::from(([0, 0, 0, 0], self.local_port.unwrap_or(0)))
            } else {
                SocketAddr::from(([0u16; 8], self.local_port.unwrap_or(0)))
            };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(remote).await?;
            Ok::<_, io::Error>((socket, remote))
        };

        let (socket, remote) = tokio::select! {
            _ = token.cancelled() => return Err(NcError::Cancelled),
            res = bounded(self.timeout, connect) => {
                res?.map_err(|err| NcError::network(NetOp::Dial, address, err))?
            }
        };
        Ok(Connection::new(UdpStream::new(socket), Some(remote)))
    }
}

async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Result<io::Result<T>>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| NcError::Timeout),
        None => Ok(fut.await),
    }
}

async fn resolve(address: &str) -> io::Result<SocketAddr> {
    lookup_host(address).await?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {address}"))
    })
}

/// Byte-stream adapter over a connected UDP socket. Each write is one
/// datagram; reads may carry a buffered first datagram from [`accept_udp`].
pub struct UdpStream {
    socket: UdpSocket,
    initial: Option<Vec<u8>>,
}

impl UdpStream {
    pub fn new(socket: UdpSocket) -> Self {
        UdpStream {
            socket,
            initial: None,
        }
    }

    fn with_initial(socket: UdpSocket, initial: Vec<u8>) -> Self {
        let initial = if initial.is_empty() { None } else { Some(initial) };
        UdpStream { socket, initial }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(initial) = self.initial.take() {
            let n = initial.len().min(buf.remaining());
            buf.put_slice(&initial[..n]);
            return Poll::Ready(Ok(()));
        }
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Wait for the first datagram on a bound UDP socket, connect to the sender,
/// and surface the pair as a byte stream. Netcat-style UDP listen semantics:
/// the first client claims the socket.
pub async fn accept_udp(socket: UdpSocket) -> io::Result<(UdpStream, SocketAddr)> {
    let mut buf = vec![0u8; crate::pool::BUF_SIZE];
    let (n, peer) = socket.recv_from(&mut buf).await?;
    socket.connect(peer).await?;
    buf.truncate(n);
    Ok((UdpStream::with_initial(socket, buf), peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_dialer_round_trip() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            socket.write_all(b"pong").await.unwrap();
        });

        let dialer = TcpDialer::default();
        let token = CancellationToken::new();
        let mut conn = dialer.dial(&token, "tcp", &addr.to_string()).await.unwrap();
        assert_eq!(conn.peer(), Some(addr));
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_dialer_reports_refused_with_context() {
        let free = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = free.local_addr().unwrap();
        drop(free);

        let dialer = TcpDialer::default();
        let token = CancellationToken::new();
        let err = dialer
            .dial(&token, "tcp", &addr.to_string())
            .await
            .unwrap_err();
        match err {
            NcError::Network { op, addr: a, .. } => {
                assert_eq!(op, NetOp::Dial);
                assert_eq!(a, addr.to_string());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn udp_dialer_and_accept_round_trip() {
        let server_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();

        let dialer = UdpDialer::default();
        let token = CancellationToken::new();
        let mut conn = dialer
            .dial(&token, "udp", &server_addr.to_string())
            .await
            .unwrap();
        conn.write_all(b"ping").await.unwrap();

        let (mut stream, peer) = accept_udp(server_socket).await.unwrap();
        assert_eq!(peer.ip(), server_addr.ip());
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        stream.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn format_addr_brackets_ipv6() {
        assert_eq!(format_addr("example.com", 80), "example.com:80");
        assert_eq!(format_addr("::1", 80), "[::1]:80");
    }
}
