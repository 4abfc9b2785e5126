//! Forward tunneling: an authenticated SSH client that opens
//! client-initiated `direct-tcpip` channels on demand, and the lazily
//! connecting dialer the connect and scan modes plug into.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use russh::{Disconnect, client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::GatewayConfig,
    gateway::{self, GatewayHandler},
};
use gonc_core::transport::{Connection, Dialer};
use gonc_types::{NcError, SshOp};

type Result<T> = gonc_types::NcResult<T>;

#[derive(Default)]
struct TunnelState {
    client: Option<Arc<client::Handle<GatewayHandler>>>,
    alive: Option<Arc<AtomicBool>>,
}

/// An SSH gateway used as a pivot: [`ForwardTunnel::dial`] opens a channel
/// to an address reachable from the gateway.
pub struct ForwardTunnel {
    config: GatewayConfig,
    state: Mutex<TunnelState>,
}

impl ForwardTunnel {
    pub fn new(config: GatewayConfig) -> Self {
        ForwardTunnel {
            config,
            state: Mutex::new(TunnelState::default()),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Dial the gateway and complete the handshake. A monitor task flips
    /// the alive flag when the underlying transport ends.
    pub async fn connect(&self, token: &CancellationToken) -> Result<()> {
        let connection = gateway::connect(token, &self.config, false).await?;
        let mut closed = connection.closed;

        let alive = Arc::new(AtomicBool::new(true));
        let monitor_flag = alive.clone();
        tokio::spawn(async move {
            let _ = closed.changed().await;
            monitor_flag.store(false, Ordering::SeqCst);
            debug!("ssh gateway transport ended");
        });

        let mut state = self.state.lock().expect("tunnel state poisoned");
        state.client = Some(Arc::new(connection.handle));
        state.alive = Some(alive);
        Ok(())
    }

    /// Open a connection to `address` through the tunnel.
    pub async fn dial(
        &self,
        _token: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<Connection> {
        if !network.is_empty() && network != "tcp" {
            return Err(NcError::other(format!(
                "network {network:?} is not supported through an SSH tunnel"
            )));
        }

        let client = {
            let state = self.state.lock().expect("tunnel state poisoned");
            match (&state.client, &state.alive) {
                (Some(client), Some(alive)) if alive.load(Ordering::SeqCst) => client.clone(),
                _ => return Err(NcError::NotConnected),
            }
        };

        let (host, port) = split_host_port(address)?;
        debug!(%address, "dialing through ssh tunnel");
        let channel = client
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1".to_string(), 0)
            .await
            .map_err(|err| NcError::ssh(SshOp::Channel, &self.config.host, self.config.port, err))?;
        Ok(Connection::new(channel.into_stream(), None))
    }

    pub fn is_alive(&self) -> bool {
        let state = self.state.lock().expect("tunnel state poisoned");
        state
            .alive
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Mark the tunnel dead and release the client.
    pub async fn close(&self) -> Result<()> {
        let client = {
            let mut state = self.state.lock().expect("tunnel state poisoned");
            if let Some(flag) = &state.alive {
                flag.store(false, Ordering::SeqCst);
            }
            state.client.take()
        };
        if let Some(client) = client {
            let _ = client
                .disconnect(Disconnect::ByApplication, "", "")
                .await;
        }
        Ok(())
    }
}

fn split_host_port(address: &str) -> Result<(String, u16)> {
    let (host, port_str) = address
        .rsplit_once(':')
        .ok_or_else(|| NcError::other(format!("address {address:?} is missing a port")))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let port = port_str
        .parse()
        .map_err(|_| NcError::other(format!("invalid port in address {address:?}")))?;
    Ok((host.to_string(), port))
}

/// Dialer that routes connections through a [`ForwardTunnel`]. The first
/// `dial` pays the handshake cost; the guard mutex keeps two first-callers
/// from both handshaking.
pub struct SshDialer {
    tunnel: ForwardTunnel,
    connected: tokio::sync::Mutex<bool>,
}

impl SshDialer {
    pub fn new(config: GatewayConfig) -> Self {
        SshDialer {
            tunnel: ForwardTunnel::new(config),
            connected: tokio::sync::Mutex::new(false),
        }
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(
        &self,
        token: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<Connection> {
        {
            let mut connected = self.connected.lock().await;
            if !*connected {
                let cfg = self.tunnel.config();
                info!(gateway = %cfg.address(), user = %cfg.user, "establishing SSH tunnel");
                self.tunnel.connect(token).await?;
                *connected = true;
                info!("SSH tunnel established");
            }
        }
        self.tunnel.dial(token, network, address).await
    }

    async fn close(&self) -> Result<()> {
        let mut connected = self.connected.lock().await;
        if *connected {
            *connected = false;
            return self.tunnel.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_before_connect_reports_not_connected() {
        let tunnel = ForwardTunnel::new(GatewayConfig::new("user", "gw", 22));
        let token = CancellationToken::new();
        let err = tunnel.dial(&token, "tcp", "db:5432").await.unwrap_err();
        assert!(matches!(err, NcError::NotConnected));
        assert!(!tunnel.is_alive());
    }

    #[tokio::test]
    async fn close_without_connect_is_fine() {
        let tunnel = ForwardTunnel::new(GatewayConfig::new("user", "gw", 22));
        tunnel.close().await.unwrap();
        assert!(!tunnel.is_alive());
    }

    #[test]
    fn split_host_port_handles_brackets() {
        assert_eq!(split_host_port("db:5432").unwrap(), ("db".to_string(), 5432));
        assert_eq!(
            split_host_port("[::1]:80").unwrap(),
            ("::1".to_string(), 80)
        );
        assert!(split_host_port("no-port").is_err());
    }
}
