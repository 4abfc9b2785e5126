//! Reverse tunneling: ask an SSH gateway to listen on a remote port and
//! bridge every inbound `forwarded-tcpip` channel back to a local service.
//!
//! The lifecycle is `start -> wait -> close`. Supporting logic is split
//! across sibling files: `listener` holds the accept-everything remote
//! listener handle, `bridge` the per-connection forwarding, and `health`
//! keepalive plus reconnection.

mod bridge;
mod health;
mod listener;

use std::{sync::Arc, time::Duration};

use russh::client;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};

use crate::{
    config::GatewayConfig,
    gateway::{self, GatewayConnection, GatewayHandler, IncomingForward},
};
use gonc_core::{metrics::Metrics, transport::format_addr};
use gonc_types::{NcError, SshOp, config::DEFAULT_GRACE_PERIOD};
use listener::RemoteListener;

type Result<T> = gonc_types::NcResult<T>;

/// Everything needed to expose a local service on a remote gateway.
#[derive(Debug, Clone)]
pub struct ReverseTunnelConfig {
    pub gateway: GatewayConfig,
    /// Address to bind on the gateway; empty lets the server decide.
    pub remote_bind_address: String,
    /// Port to bind on the gateway.
    pub remote_port: u16,
    /// Local service address, defaulted to 127.0.0.1 by [`ReverseTunnel::new`].
    pub local_address: String,
    pub local_port: u16,
    pub check_gateway_ports: bool,
    /// Keepalive period; `None` disables the probe task.
    pub keep_alive: Option<Duration>,
    pub auto_reconnect: bool,
}

struct Shared {
    client: Option<Arc<client::Handle<GatewayHandler>>>,
    listener: Option<RemoteListener>,
    cancel: Option<CancellationToken>,
    closed: bool,
}

struct Inner {
    config: ReverseTunnelConfig,
    metrics: Metrics,
    state: Mutex<Shared>,
    tasks: TaskTracker,
}

/// Forwards connections arriving on a remote SSH gateway to a local TCP
/// service; the ssh -R of this tool. Cheap to clone, every task shares the
/// same state.
#[derive(Clone)]
pub struct ReverseTunnel {
    inner: Arc<Inner>,
}

/// A freshly established gateway session with its remote forward in place.
struct Established {
    client: Arc<client::Handle<GatewayHandler>>,
    listener: RemoteListener,
    incoming: mpsc::UnboundedReceiver<IncomingForward>,
    closed: watch::Receiver<bool>,
}

impl ReverseTunnel {
    /// The metrics handle is optional; pass [`Metrics::disabled`] to opt out.
    pub fn new(mut config: ReverseTunnelConfig, metrics: Metrics) -> Self {
        if config.local_address.is_empty() {
            config.local_address = gonc_types::config::DEFAULT_LOCAL_ADDRESS.to_string();
        }
        ReverseTunnel {
            inner: Arc::new(Inner {
                config,
                metrics,
                state: Mutex::new(Shared {
                    client: None,
                    listener: None,
                    cancel: None,
                    closed: false,
                }),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &ReverseTunnelConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Connect to the gateway, request the remote listener, and spawn the
    /// long-lived activities: server-message drain, transport watcher,
    /// keepalive, and the accept loop.
    pub async fn start(&self, token: &CancellationToken) -> Result<()> {
        let cancel = token.child_token();

        let established = match self
            .establish(&cancel, self.inner.config.check_gateway_ports)
            .await
        {
            Ok(established) => established,
            Err(err) => {
                cancel.cancel();
                self.inner.tasks.close();
                return Err(err);
            }
        };
        let Established {
            client,
            listener,
            incoming,
            closed,
        } = established;

        let bound_port = listener.bind_port();
        {
            let mut shared = self.inner.state.lock().await;
            shared.client = Some(client.clone());
            shared.listener = Some(listener);
            shared.cancel = Some(cancel.clone());
        }

        let remote = format!("{}:{bound_port}", self.inner.config.remote_bind_address);
        let local = format_addr(
            &self.inner.config.local_address,
            self.inner.config.local_port,
        );
        info!(%remote, %local, "reverse tunnel established");

        self.inner
            .tasks
            .spawn(gateway::drain_server_messages(client, cancel.clone()));
        self.inner
            .tasks
            .spawn(self.clone().watch_transport(cancel.clone(), closed));
        if let Some(interval) = self.inner.config.keep_alive {
            self.inner
                .tasks
                .spawn(self.clone().keepalive_loop(interval, cancel.clone()));
        }
        self.inner.tasks.spawn(self.clone().accept_loop(incoming, cancel));
        self.inner.tasks.close();
        Ok(())
    }

    /// Block until every tunnel task has returned.
    pub async fn wait(&self) {
        self.inner.tasks.wait().await;
    }

    /// Idempotent teardown of listener, client, and in-flight bridges,
    /// bounded by the grace period.
    pub async fn close(&self) -> Result<()> {
        let cancel = {
            let mut shared = self.inner.state.lock().await;
            if shared.closed {
                return Ok(());
            }
            shared.closed = true;
            shared.cancel.take()
        };
        if let Some(cancel) = &cancel {
            cancel.cancel();
        }

        let mut errors: Vec<String> = Vec::new();

        let listener = { self.inner.state.lock().await.listener.take() };
        if let Some(listener) = listener {
            listener.close().await;
        }

        self.inner.tasks.close();
        if tokio::time::timeout(DEFAULT_GRACE_PERIOD, self.inner.tasks.wait())
            .await
            .is_err()
        {
            errors.push("timeout waiting for handlers to finish".to_string());
        }

        let client = { self.inner.state.lock().await.client.take() };
        if let Some(client) = client {
            if let Err(err) = client
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await
            {
                errors.push(format!("SSH close: {err}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NcError::other(format!(
                "reverse tunnel close: {}",
                errors.join("; ")
            )))
        }
    }

    /// Dial, authenticate, optionally probe GatewayPorts, claim the
    /// forwarded-tcpip channel stream, and request the remote forward.
    async fn establish(&self, cancel: &CancellationToken, check_gateway: bool) -> Result<Established> {
        let cfg = &self.inner.config;
        let connection = gateway::connect(cancel, &cfg.gateway, true).await?;
        let GatewayConnection {
            mut handle,
            sink,
            closed,
        } = connection;

        if check_gateway {
            self.validate_gateway_ports(&mut handle).await?;
        }

        // Claim the channel stream before the forward request so no inbound
        // channel can ever race an unregistered handler.
        let incoming = gateway::register_sink(&sink)?;

        let requested = cfg.remote_port as u32;
        let assigned = handle
            .tcpip_forward(cfg.remote_bind_address.clone(), requested)
            .await
            .map_err(|err| self.forward_error(err))?;
        let actual_port = if assigned != 0 { assigned } else { requested };

        let client = Arc::new(handle);
        let listener = RemoteListener::new(
            client.clone(),
            sink,
            cfg.remote_bind_address.clone(),
            actual_port,
        );
        Ok(Established {
            client,
            listener,
            incoming,
            closed,
        })
    }

    /// Best-effort check that the server allows non-loopback binds before
    /// committing to the real forward.
    async fn validate_gateway_ports(
        &self,
        handle: &mut client::Handle<GatewayHandler>,
    ) -> Result<()> {
        let gateway = &self.inner.config.gateway;
        match handle.tcpip_forward("0.0.0.0".to_string(), 0).await {
            Ok(test_port) => {
                let _ = handle
                    .cancel_tcpip_forward("0.0.0.0".to_string(), test_port)
                    .await;
                debug!("GatewayPorts validation passed");
                Ok(())
            }
            Err(err) => Err(NcError::ssh(
                SshOp::Forward,
                &gateway.host,
                gateway.port,
                format!(
                    "GatewayPorts appears disabled on {} - set \"GatewayPorts yes\" or \
                     \"GatewayPorts clientspecified\" in sshd_config: {err}",
                    gateway.host
                ),
            )),
        }
    }

    fn forward_error(&self, err: russh::Error) -> NcError {
        let gateway = &self.inner.config.gateway;
        match err {
            russh::Error::RequestDenied => NcError::ssh(
                SshOp::Forward,
                &gateway.host,
                gateway.port,
                "tcpip-forward request denied by peer",
            ),
            err => NcError::ssh(SshOp::Forward, &gateway.host, gateway.port, err),
        }
    }

    /// Accept inbound channels until cancellation or an unrecoverable
    /// listener loss, spawning one bridge per connection.
    async fn accept_loop(
        self,
        mut incoming: mpsc::UnboundedReceiver<IncomingForward>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = incoming.recv() => next,
            };
            match next {
                Some(incoming_forward) => {
                    debug!(origin = %incoming_forward.origin_label(), "reverse tunnel: connection");
                    self.inner.metrics.connection_opened();
                    self.inner
                        .tasks
                        .spawn(self.clone().bridge_connection(incoming_forward, cancel.clone()));
                }
                None => {
                    if cancel.is_cancelled() || self.is_closed().await {
                        break;
                    }
                    error!("reverse tunnel accept: remote listener closed");
                    self.inner.metrics.record_error("accept: remote listener closed");
                    if !self.inner.config.auto_reconnect {
                        break;
                    }
                    match self.reconnect(&cancel).await {
                        Ok(replacement) => incoming = replacement,
                        Err(err) => {
                            error!(error = %err, "reconnect failed, giving up");
                            break;
                        }
                    }
                }
            }
        }
        // Signal every sibling task when the loop exits.
        cancel.cancel();
    }

    async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(local_address: &str) -> ReverseTunnelConfig {
        ReverseTunnelConfig {
            gateway: GatewayConfig::new("user", "gw.example.com", 22),
            remote_bind_address: String::new(),
            remote_port: 8080,
            local_address: local_address.to_string(),
            local_port: 3000,
            check_gateway_ports: false,
            keep_alive: None,
            auto_reconnect: false,
        }
    }

    #[test]
    fn empty_local_address_defaults_to_loopback() {
        let rt = ReverseTunnel::new(test_config(""), Metrics::disabled());
        assert_eq!(rt.config().local_address, "127.0.0.1");
    }

    #[test]
    fn explicit_local_address_is_preserved() {
        let rt = ReverseTunnel::new(test_config("10.0.0.5"), Metrics::disabled());
        assert_eq!(rt.config().local_address, "10.0.0.5");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_is_idempotent_and_prompt() {
        let rt = ReverseTunnel::new(test_config(""), Metrics::new());
        let started = std::time::Instant::now();
        rt.close().await.unwrap();
        rt.close().await.unwrap();
        assert!(started.elapsed() < DEFAULT_GRACE_PERIOD);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_returns_after_close() {
        let rt = ReverseTunnel::new(test_config(""), Metrics::disabled());
        rt.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rt.wait())
            .await
            .expect("wait did not return");
    }
}
