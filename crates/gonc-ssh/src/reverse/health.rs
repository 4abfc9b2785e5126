//! Keepalive probing and reconnection for the reverse tunnel.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Established, ReverseTunnel};
use crate::gateway::{self, IncomingForward};
use gonc_core::retry::{AttemptError, Backoff};
use gonc_types::{
    NcError,
    config::{DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BACKOFF_CAP},
};

type Result<T> = gonc_types::NcResult<T>;

impl ReverseTunnel {
    /// Close the listener when the token is cancelled or the transport
    /// ends, unblocking a pending accept either way.
    pub(super) async fn watch_transport(
        self,
        cancel: CancellationToken,
        mut closed: watch::Receiver<bool>,
    ) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = closed.changed() => {
                debug!("reverse tunnel: ssh transport ended");
            }
        }
        self.close_listener().await;
    }

    pub(super) async fn close_listener(&self) {
        let listener = { self.inner.state.lock().await.listener.take() };
        if let Some(listener) = listener {
            listener.close().await;
        }
    }

    /// Periodic `keepalive@openssh.com` probes. A failed probe closes the
    /// listener so the accept loop can run its reconnect path, then exits.
    pub(super) async fn keepalive_loop(self, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let client = { self.inner.state.lock().await.client.clone() };
            let Some(client) = client else { return };

            match client.send_keepalive(true).await {
                Ok(()) => {
                    self.inner.metrics.record_health_check();
                    debug!("ssh keepalive ok");
                }
                Err(err) => {
                    error!(error = %err, "ssh keepalive failed");
                    self.inner.metrics.record_error(format!("keepalive: {err}"));
                    self.close_listener().await;
                    return;
                }
            }
        }
    }

    /// Tear down the dead session and re-establish the tunnel with
    /// exponential backoff. Only the accept loop calls this.
    pub(super) async fn reconnect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<IncomingForward>> {
        info!("reverse tunnel: reconnecting");
        self.inner.metrics.tunnel_reconnect();

        let (listener, client) = {
            let mut shared = self.inner.state.lock().await;
            (shared.listener.take(), shared.client.take())
        };
        if let Some(listener) = listener {
            listener.close().await;
        }
        if let Some(client) = client {
            let _ = client
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
        }

        let backoff = Backoff {
            initial_delay: Duration::from_secs(1),
            max_delay: DEFAULT_RECONNECT_BACKOFF_CAP,
            multiplier: 2.0,
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            jitter: false,
        };
        let established = backoff
            .run(cancel, |attempt| {
                let tunnel = self.clone();
                let cancel = cancel.clone();
                async move {
                    match tunnel.establish(&cancel, false).await {
                        Ok(established) => Ok(established),
                        Err(err) => {
                            error!(
                                attempt,
                                max = DEFAULT_RECONNECT_ATTEMPTS,
                                error = %err,
                                "reconnect attempt failed"
                            );
                            tunnel
                                .inner
                                .metrics
                                .record_error(format!("reconnect attempt {attempt}: {err}"));
                            Err(AttemptError::Transient(err))
                        }
                    }
                }
            })
            .await?;

        let Established {
            client,
            listener,
            incoming,
            closed,
        } = established;

        {
            let mut shared = self.inner.state.lock().await;
            if shared.closed {
                drop(shared);
                listener.close().await;
                let _ = client
                    .disconnect(russh::Disconnect::ByApplication, "", "")
                    .await;
                return Err(NcError::TunnelClosed);
            }
            shared.client = Some(client.clone());
            shared.listener = Some(listener);
        }

        info!("reverse tunnel: reconnected");
        self.inner
            .tasks
            .spawn(gateway::drain_server_messages(client.clone(), cancel.clone()));
        self.inner
            .tasks
            .spawn(self.clone().watch_transport(cancel.clone(), closed));
        if let Some(interval) = self.inner.config.keep_alive {
            self.inner
                .tasks
                .spawn(self.clone().keepalive_loop(interval, cancel.clone()));
        }
        Ok(incoming)
    }
}
