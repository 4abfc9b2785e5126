//! Handle for the remote listener backing a reverse tunnel.
//!
//! russh matches inbound `forwarded-tcpip` channels in the client handler,
//! so the "listener" here is control state: the channel sink feeding the
//! accept loop plus the bookkeeping needed to cancel the forward. Closing
//! it drops the sink's sender, which a pending accept observes as
//! end-of-stream, mirroring how closing a socket listener unblocks accept.

use std::sync::Arc;

use russh::client;
use tracing::debug;

use crate::gateway::{self, GatewayHandler, SharedSink};

pub(crate) struct RemoteListener {
    client: Arc<client::Handle<GatewayHandler>>,
    sink: SharedSink,
    bind_address: String,
    bind_port: u32,
}

impl RemoteListener {
    pub(crate) fn new(
        client: Arc<client::Handle<GatewayHandler>>,
        sink: SharedSink,
        bind_address: String,
        bind_port: u32,
    ) -> Self {
        RemoteListener {
            client,
            sink,
            bind_address,
            bind_port,
        }
    }

    /// The port actually bound on the gateway (server-assigned when the
    /// request asked for 0).
    pub(crate) fn bind_port(&self) -> u32 {
        self.bind_port
    }

    /// Cancel the remote forward and unblock a pending accept.
    pub(crate) async fn close(&self) {
        gateway::close_sink(&self.sink);
        // Best-effort; the connection may already be gone.
        if let Err(err) = self
            .client
            .cancel_tcpip_forward(self.bind_address.clone(), self.bind_port)
            .await
        {
            debug!(error = %err, "cancel-tcpip-forward failed");
        }
    }
}
