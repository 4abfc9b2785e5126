//! Listen mode: accept inbound TCP connections (one, or many with
//! keep-open) or claim a UDP socket, and run the behavior on each session.

use std::{sync::Arc, time::Duration};

use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    behavior::Behavior,
    session::{Session, SessionInput, SessionOutput},
};
use gonc_core::transport::{Connection, accept_udp};
use gonc_types::{Config, NcError, NetOp};

type Result<T> = gonc_types::NcResult<T>;

pub(crate) type SessionIo = (SessionInput, SessionOutput);
pub(crate) type IoFactory = Arc<dyn Fn() -> SessionIo + Send + Sync>;

pub struct ListenMode {
    pub(crate) port: u16,
    pub(crate) udp: bool,
    pub(crate) keep_open: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) behavior: Behavior,
    /// Test override for per-session I/O; the process's stdio when unset.
    pub(crate) io_factory: Option<IoFactory>,
}

impl ListenMode {
    pub fn from_config(cfg: &Config) -> Self {
        ListenMode {
            port: cfg.local_port.unwrap_or_default(),
            udp: cfg.udp,
            keep_open: cfg.keep_open,
            timeout: cfg.timeout,
            behavior: Behavior::from_config(cfg),
            io_factory: None,
        }
    }

    pub async fn run(self, token: &CancellationToken) -> Result<()> {
        if self.udp {
            return self.run_udp(token).await;
        }
        self.run_tcp(token).await
    }

    async fn run_tcp(self, token: &CancellationToken) -> Result<()> {
        let bind_addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|err| NcError::network(NetOp::Listen, &bind_addr, err))?;
        debug!(addr = %bind_addr, "listening (tcp)");

        let behavior = Arc::new(self.behavior);
        loop {
            let (socket, peer) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    accepted.map_err(|err| NcError::network(NetOp::Accept, &bind_addr, err))?
                }
            };
            debug!(%peer, "connection accepted");
            socket.set_nodelay(true).ok();
            let conn = Connection::new(socket, Some(peer));
            let io = session_io(&self.io_factory);

            if self.keep_open {
                let behavior = behavior.clone();
                let conn_token = token.child_token();
                let timeout = self.timeout;
                tokio::spawn(async move {
                    if let Err(err) = serve_conn(&conn_token, &behavior, conn, io, timeout).await {
                        warn!(error = %err, "connection handler failed");
                    }
                });
            } else {
                return serve_conn(token, &behavior, conn, io, self.timeout).await;
            }
        }
    }

    async fn run_udp(self, token: &CancellationToken) -> Result<()> {
        let bind_addr = format!("0.0.0.0:{}", self.port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|err| NcError::network(NetOp::Listen, &bind_addr, err))?;
        debug!(addr = %bind_addr, "listening (udp)");

        // The overall timeout covers waiting for the first datagram too.
        let accepted = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            res = async {
                match self.timeout {
                    Some(limit) => tokio::time::timeout(limit, accept_udp(socket))
                        .await
                        .map_err(|_| NcError::Timeout)?,
                    None => accept_udp(socket).await,
                }
                .map_err(|err| NcError::network(NetOp::Accept, &bind_addr, err))
            } => res?,
        };
        let (stream, peer) = accepted;
        debug!(%peer, "udp peer claimed the socket");

        let conn = Connection::new(stream, Some(peer));
        let io = session_io(&self.io_factory);
        serve_conn(token, &self.behavior, conn, io, self.timeout).await
    }
}

fn session_io(factory: &Option<IoFactory>) -> SessionIo {
    match factory {
        Some(factory) => factory(),
        None => (
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
        ),
    }
}

async fn serve_conn(
    token: &CancellationToken,
    behavior: &Behavior,
    conn: Connection,
    (stdin, stdout): SessionIo,
    timeout: Option<Duration>,
) -> Result<()> {
    let session = Session::new(conn, stdin, stdout);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, behavior.handle(token, session))
            .await
            .map_err(|_| NcError::Timeout)?,
        None => behavior.handle(token, session).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::{
        io::AsyncWriteExt,
        net::{TcpListener as ProbeListener, TcpStream},
    };

    fn silent_io() -> IoFactory {
        Arc::new(|| {
            (
                Box::new(tokio::io::empty()) as SessionInput,
                Box::new(tokio::io::sink()) as SessionOutput,
            )
        })
    }

    async fn free_port() -> u16 {
        let probe = ProbeListener::bind(("127.0.0.1", 0)).await.unwrap();
        probe.local_addr().unwrap().port()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn keep_open_serves_sequential_connections_until_cancelled() {
        let port = free_port().await;
        let mode = ListenMode {
            port,
            udp: false,
            keep_open: true,
            timeout: None,
            behavior: Behavior::Relay,
            io_factory: Some(silent_io()),
        };

        let token = CancellationToken::new();
        let run = {
            let token = token.clone();
            tokio::spawn(async move { mode.run(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            drop(client);
        }

        // Still accepting after three clients came and went.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!run.is_finished());

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("listen mode did not stop on cancellation")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_shot_returns_after_first_connection() {
        let port = free_port().await;
        let mode = ListenMode {
            port,
            udp: false,
            keep_open: false,
            timeout: None,
            behavior: Behavior::Relay,
            io_factory: Some(silent_io()),
        };

        let token = CancellationToken::new();
        let run = {
            let token = token.clone();
            tokio::spawn(async move { mode.run(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"one shot").await.unwrap();
        drop(client);

        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("listen mode did not return after the first connection")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn udp_session_ends_with_the_timeout() {
        let port = free_port().await;
        let mode = ListenMode {
            port,
            udp: true,
            keep_open: false,
            timeout: Some(Duration::from_millis(200)),
            behavior: Behavior::Relay,
            io_factory: Some(silent_io()),
        };

        let token = CancellationToken::new();
        let run = {
            let token = token.clone();
            tokio::spawn(async move { mode.run(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        client.connect(("127.0.0.1", port)).await.unwrap();
        client.send(b"ping").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("udp listen did not finish")
            .unwrap();
        // The relay keeps draining until the deadline fires.
        assert!(matches!(result, Err(NcError::Timeout)));
    }
}
