//! Gateway connection parameters shared by the forward and reverse tunnels.

use std::{path::PathBuf, time::Duration};

use gonc_core::transport::format_addr;
use gonc_types::config::{DEFAULT_CONN_TIMEOUT, DEFAULT_SSH_PORT};

/// Everything needed to dial and authenticate against an SSH gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    /// Explicit private key file.
    pub key_path: Option<PathBuf>,
    /// Prompt interactively for a password.
    pub prompt_password: bool,
    pub use_agent: bool,
    pub strict_host_key: bool,
    pub known_hosts_path: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Append keyboard-interactive auth answering every challenge with an
    /// empty string. Public tunnel services (serveo.net, localhost.run)
    /// advertise `publickey` but actually authenticate this way.
    pub allow_keyboard_interactive: bool,
}

impl GatewayConfig {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        GatewayConfig {
            user: user.into(),
            host: host.into(),
            port: if port == 0 { DEFAULT_SSH_PORT } else { port },
            key_path: None,
            prompt_password: false,
            use_agent: false,
            strict_host_key: false,
            known_hosts_path: None,
            connect_timeout: DEFAULT_CONN_TIMEOUT,
            allow_keyboard_interactive: false,
        }
    }

    pub fn address(&self) -> String {
        format_addr(&self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_port_defaults_to_22() {
        let cfg = GatewayConfig::new("deploy", "gw.internal", 0);
        assert_eq!(cfg.port, 22);
        assert_eq!(cfg.address(), "gw.internal:22");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(30));
    }
}
