//! The russh client plumbing shared by both tunnel directions: host-key
//! checking, pre-auth banner forwarding, the forwarded-tcpip channel sink,
//! and transport liveness signalling.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use russh::{
    Channel, ChannelMsg,
    client::{self, Msg, Session},
    keys::PublicKey,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    auth,
    config::GatewayConfig,
    hostkeys::{self, HostKeyPolicy},
};
use gonc_types::{NcError, SshOp};

type Result<T> = gonc_types::NcResult<T>;

/// Error type for the russh handler; unwraps to [`NcError`] at the seam.
#[derive(Debug, Error)]
#[error(transparent)]
pub(crate) struct HandlerError(pub(crate) NcError);

impl From<russh::Error> for HandlerError {
    fn from(err: russh::Error) -> Self {
        HandlerError(NcError::SshProtocol(Box::new(err)))
    }
}

/// An inbound `forwarded-tcpip` channel accepted by the demultiplexer,
/// with the origin parsed from the channel-open payload.
pub(crate) struct IncomingForward {
    pub channel: Channel<Msg>,
    pub origin: Option<SocketAddr>,
}

impl IncomingForward {
    pub(crate) fn origin_label(&self) -> String {
        match self.origin {
            Some(addr) => addr.to_string(),
            None => "unknown".to_string(),
        }
    }
}

/// Destination for accepted forwarded-tcpip channels. At most one receiver
/// may ever be registered per client; that mirrors registering the channel
/// handler exactly once, before anything else could claim it.
#[derive(Default)]
pub(crate) struct ChannelSink {
    sender: Option<mpsc::UnboundedSender<IncomingForward>>,
    registered: bool,
}

pub(crate) type SharedSink = Arc<Mutex<ChannelSink>>;

pub(crate) struct GatewayHandler {
    policy: HostKeyPolicy,
    host: String,
    port: u16,
    /// Forward pre-auth banner lines to the log; public services publish
    /// the assigned URL this way.
    forward_banner: bool,
    sink: SharedSink,
    liveness: watch::Sender<bool>,
}

impl client::Handler for GatewayHandler {
    type Error = HandlerError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let policy = self.policy.clone();
        let host = self.host.clone();
        let port = self.port;
        let key = server_public_key.clone();
        async move { hostkeys::verify(&policy, &host, port, &key).map_err(HandlerError) }
    }

    fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut Session,
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send {
        if self.forward_banner {
            for line in banner.lines() {
                let line = line.trim_end();
                if !line.is_empty() {
                    info!("{line}");
                }
            }
        }
        std::future::ready(Ok(()))
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send {
        // Parse the payload fields but never match on the bind address:
        // services like serveo.net echo back a different address than the
        // one requested, and only one remote forward is ever active.
        let origin = originator_address
            .parse()
            .ok()
            .map(|ip| SocketAddr::new(ip, originator_port as u16));

        let unrouted = {
            let sink = self.sink.lock().expect("channel sink poisoned");
            match &sink.sender {
                Some(sender) => match sender.send(IncomingForward { channel, origin }) {
                    Ok(()) => None,
                    Err(mpsc::error::SendError(rejected)) => Some(rejected.channel),
                },
                None => Some(channel),
            }
        };

        let bind = format!("{connected_address}:{connected_port}");
        async move {
            if let Some(channel) = unrouted {
                debug!(%bind, "forwarded-tcpip channel with no active forward; closing");
                let _ = channel.close().await;
            }
            Ok(())
        }
    }
}

impl Drop for GatewayHandler {
    fn drop(&mut self) {
        // The session task owns the handler; dropping it means the
        // transport ended.
        let _ = self.liveness.send(false);
    }
}

/// An authenticated gateway connection plus the shared pieces the tunnels
/// need: the channel sink and a liveness watch that fires when the
/// transport ends.
pub(crate) struct GatewayConnection {
    pub handle: client::Handle<GatewayHandler>,
    pub sink: SharedSink,
    pub closed: watch::Receiver<bool>,
}

/// Register the forwarded-tcpip receiver. Refuses a second registration for
/// the lifetime of the client.
pub(crate) fn register_sink(
    sink: &SharedSink,
) -> Result<mpsc::UnboundedReceiver<IncomingForward>> {
    let mut guard = sink.lock().expect("channel sink poisoned");
    if guard.registered {
        return Err(NcError::other("forwarded-tcpip handler already registered"));
    }
    let (tx, rx) = mpsc::unbounded_channel();
    guard.sender = Some(tx);
    guard.registered = true;
    Ok(rx)
}

/// Drop the sink's sender so a pending accept observes end-of-stream.
pub(crate) fn close_sink(sink: &SharedSink) {
    let mut guard = sink.lock().expect("channel sink poisoned");
    guard.sender = None;
}

/// Dial and authenticate the gateway. Cancellation and the configured
/// connect timeout both bound the attempt.
pub(crate) async fn connect(
    token: &CancellationToken,
    cfg: &GatewayConfig,
    forward_banner: bool,
) -> Result<GatewayConnection> {
    let methods = auth::build_auth_methods(cfg).await?;
    let policy = HostKeyPolicy::from_config(cfg)?;

    let (liveness, closed) = watch::channel(true);
    let sink: SharedSink = Arc::new(Mutex::new(ChannelSink::default()));
    let handler = GatewayHandler {
        policy,
        host: cfg.host.clone(),
        port: cfg.port,
        forward_banner,
        sink: sink.clone(),
        liveness,
    };

    let config = Arc::new(client::Config {
        ..Default::default()
    });

    debug!(address = %cfg.address(), user = %cfg.user, "dialing ssh gateway");
    let connecting = client::connect(config, (cfg.host.as_str(), cfg.port), handler);
    let mut handle = tokio::select! {
        _ = token.cancelled() => return Err(NcError::Cancelled),
        outcome = tokio::time::timeout(cfg.connect_timeout, connecting) => match outcome {
            Err(_) => {
                return Err(NcError::ssh(SshOp::Handshake, &cfg.host, cfg.port, NcError::Timeout));
            }
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => return Err(handshake_error(err, cfg)),
        },
    };

    auth::authenticate(&mut handle, cfg, methods).await?;

    Ok(GatewayConnection {
        handle,
        sink,
        closed,
    })
}

fn handshake_error(err: HandlerError, cfg: &GatewayConfig) -> NcError {
    match err.0 {
        // Already carries context from the host-key or auth layer.
        err @ (NcError::HostKeyMismatch(_) | NcError::Ssh { .. } | NcError::AuthFailed(_)) => err,
        other => NcError::ssh(SshOp::Handshake, &cfg.host, cfg.port, other),
    }
}

/// Open a session, request a shell, and copy its output to the log until it
/// closes. Some public services deliver the assigned URL only on this
/// stream after authentication. Exits quietly when the server refuses.
pub(crate) async fn drain_server_messages(
    client: Arc<client::Handle<GatewayHandler>>,
    cancel: CancellationToken,
) {
    let mut channel = match client.channel_open_session().await {
        Ok(channel) => channel,
        Err(err) => {
            debug!(error = %err, "session for server messages unavailable");
            return;
        }
    };
    // Best-effort; some services need a shell, others allow bare sessions.
    let _ = channel.request_shell(true).await;

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = channel.wait() => msg,
        };
        match msg {
            Some(ChannelMsg::Data { data }) => log_server_output(&data),
            Some(ChannelMsg::ExtendedData { data, .. }) => log_server_output(&data),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
}

fn log_server_output(data: &[u8]) {
    for line in String::from_utf8_lossy(data).lines() {
        let line = line.trim_end();
        if !line.is_empty() {
            info!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_registration_is_exclusive() {
        let sink: SharedSink = Arc::new(Mutex::new(ChannelSink::default()));
        let _rx = register_sink(&sink).unwrap();
        let err = register_sink(&sink).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn closing_the_sink_ends_the_stream() {
        let sink: SharedSink = Arc::new(Mutex::new(ChannelSink::default()));
        let mut rx = register_sink(&sink).unwrap();
        close_sink(&sink);
        assert!(rx.try_recv().is_err());
        // Re-registration stays refused for the client's lifetime.
        assert!(register_sink(&sink).is_err());
    }
}
