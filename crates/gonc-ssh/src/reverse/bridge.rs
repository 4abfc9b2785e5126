//! Per-connection bridging between an accepted remote channel and the
//! configured local service.

use std::time::{Duration, Instant};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::ReverseTunnel;
use crate::gateway::IncomingForward;
use gonc_core::{forward, metrics::Metrics, transport::format_addr};

const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

impl ReverseTunnel {
    pub(super) async fn bridge_connection(
        self,
        incoming: IncomingForward,
        cancel: CancellationToken,
    ) {
        let remote = incoming.origin_label();
        let target = format_addr(
            &self.inner.config.local_address,
            self.inner.config.local_port,
        );
        let stream = incoming.channel.into_stream();
        bridge_to_local(&cancel, stream, &target, &remote, &self.inner.metrics).await;
    }
}

/// Dial the local target and run the forwarder against the remote stream.
/// A failed local dial ends only this bridge; the tunnel keeps serving.
pub(super) async fn bridge_to_local<S>(
    cancel: &CancellationToken,
    remote_stream: S,
    target: &str,
    remote_label: &str,
    metrics: &Metrics,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let started = Instant::now();

    let local = match tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            error!(%target, error = %err, "reverse tunnel: local dial failed");
            metrics.record_error(format!("local dial {target}: {err}"));
            metrics.connection_closed();
            return;
        }
        Err(_) => {
            error!(%target, "reverse tunnel: local dial timed out");
            metrics.record_error(format!("local dial {target}: timed out"));
            metrics.connection_closed();
            return;
        }
    };
    local.set_nodelay(true).ok();

    info!("reverse tunnel: bridging {remote_label} <-> {target}");
    match forward::bridge(cancel, remote_stream, local).await {
        Ok((received, sent)) => {
            metrics.bytes_received(received);
            metrics.bytes_sent(sent);
            info!(
                "reverse tunnel: {remote_label} closed after {:?} (in={received} out={sent})",
                started.elapsed()
            );
        }
        Err(err) => {
            warn!(error = %err, "reverse tunnel: bridge ended with error");
            metrics.record_error(format!("bridge {remote_label}: {err}"));
        }
    }
    metrics.connection_closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, duplex},
        net::TcpListener,
    };

    async fn echo_server() -> (TcpListener, String) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        (listener, target)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bridges_remote_channel_to_local_echo() {
        let (listener, target) = echo_server().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (mut read, mut write) = socket.split();
            let _ = tokio::io::copy(&mut read, &mut write).await;
        });

        let metrics = Metrics::new();
        metrics.connection_opened();
        let (mut remote, stream) = duplex(256);
        let cancel = CancellationToken::new();
        let bridge = {
            let metrics = metrics.clone();
            let target = target.clone();
            tokio::spawn(async move {
                bridge_to_local(&cancel, stream, &target, "origin:1234", &metrics).await;
            })
        };

        remote.write_all(b"echo-test-data").await.unwrap();
        let mut buf = [0u8; 14];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo-test-data");
        drop(remote);

        bridge.await.unwrap();
        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_in, 14);
        assert_eq!(snap.bytes_out, 14);
        assert_eq!(snap.errors_total, 0);
        assert_eq!(snap.connections_active, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refused_local_target_fails_only_this_bridge() {
        let (listener, target) = echo_server().await;
        drop(listener);

        let metrics = Metrics::new();
        metrics.connection_opened();
        let (_remote, stream) = duplex(64);
        let cancel = CancellationToken::new();

        let started = Instant::now();
        bridge_to_local(&cancel, stream, &target, "origin:1234", &metrics).await;
        assert!(
            started.elapsed() < LOCAL_DIAL_TIMEOUT,
            "refused dial should fail fast, took {:?}",
            started.elapsed()
        );

        let snap = metrics.snapshot();
        assert_eq!(snap.errors_total, 1);
        assert!(
            snap.last_error_message
                .as_deref()
                .unwrap_or_default()
                .starts_with("local dial"),
        );
        assert_eq!(snap.connections_active, 0);
        assert_eq!(snap.bytes_in, 0);
    }
}
