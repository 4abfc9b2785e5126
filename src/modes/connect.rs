//! Connect mode: dial a remote address and run the behavior on the
//! resulting connection. The default client mode.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{build_dialer, ensure_numeric_host};
use crate::{
    behavior::Behavior,
    session::{Session, SessionInput, SessionOutput},
};
use gonc_core::transport::{Dialer, format_addr};
use gonc_types::{Config, NcError};

type Result<T> = gonc_types::NcResult<T>;

pub struct ConnectMode {
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) behavior: Behavior,
    pub(crate) network: &'static str,
    pub(crate) address: String,
    /// Test override; the process's stdin when unset.
    pub(crate) stdin: Option<SessionInput>,
    /// Test override; the process's stdout when unset.
    pub(crate) stdout: Option<SessionOutput>,
}

impl ConnectMode {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        ensure_numeric_host(cfg)?;
        Ok(ConnectMode {
            dialer: build_dialer(cfg),
            behavior: Behavior::from_config(cfg),
            network: if cfg.udp { "udp" } else { "tcp" },
            address: format_addr(&cfg.host, cfg.port.unwrap_or_default()),
            stdin: None,
            stdout: None,
        })
    }

    /// Dial, hand the session to the behavior, and close the transport on
    /// the way out.
    pub async fn run(self, token: &CancellationToken) -> Result<()> {
        let ConnectMode {
            dialer,
            behavior,
            network,
            address,
            stdin,
            stdout,
        } = self;

        debug!(%address, network, "connecting");
        let outcome = async {
            let conn = dialer
                .dial(token, network, &address)
                .await
                .map_err(|err| NcError::other(format!("connect to {address}: {err}")))?;
            debug!(peer = %conn.peer_label(), "connected");

            let session = Session::new(
                conn,
                stdin.unwrap_or_else(|| Box::new(tokio::io::stdin())),
                stdout.unwrap_or_else(|| Box::new(tokio::io::stdout())),
            );
            behavior.handle(token, session).await
        }
        .await;

        let _ = dialer.close().await;
        outcome
    }
}
