//! Mode orchestration: composing a dialer and a behavior into one of the
//! four operational modes and running it under the root cancellation token.

mod connect;
mod listen;
mod reverse;
mod scan;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use connect::ConnectMode;
pub use listen::ListenMode;
pub use reverse::ReverseTunnelMode;
pub use scan::ScanMode;

use gonc_core::transport::{Dialer, TcpDialer, UdpDialer};
use gonc_ssh::{GatewayConfig, SshDialer};
use gonc_types::{Config, NcError};

type Result<T> = gonc_types::NcResult<T>;

/// A complete operational mode owning its lifecycle from connection
/// establishment to teardown.
pub enum Mode {
    Connect(ConnectMode),
    Listen(ListenMode),
    Scan(ScanMode),
    Reverse(ReverseTunnelMode),
}

impl Mode {
    pub async fn run(self, token: &CancellationToken) -> Result<()> {
        match self {
            Mode::Connect(mode) => mode.run(token).await,
            Mode::Listen(mode) => mode.run(token).await,
            Mode::Scan(mode) => mode.run(token).await,
            Mode::Reverse(mode) => mode.run(token).await,
        }
    }
}

/// Single dispatch point from a validated configuration to a mode.
pub fn build(cfg: &Config) -> Result<Mode> {
    if cfg.reverse_tunnel.is_some() {
        return Ok(Mode::Reverse(ReverseTunnelMode::from_config(cfg)?));
    }
    if cfg.listen {
        return Ok(Mode::Listen(ListenMode::from_config(cfg)));
    }
    if cfg.zero_io {
        return Ok(Mode::Scan(ScanMode::from_config(cfg)?));
    }
    Ok(Mode::Connect(ConnectMode::from_config(cfg)?))
}

/// The transport for connect and scan modes: SSH when a forward tunnel is
/// configured, otherwise plain UDP or TCP.
fn build_dialer(cfg: &Config) -> Arc<dyn Dialer> {
    if let Some(tunnel) = &cfg.tunnel {
        return Arc::new(SshDialer::new(gateway_config(cfg, tunnel)));
    }
    if cfg.udp {
        return Arc::new(UdpDialer {
            timeout: cfg.timeout,
            local_port: local_port_for_connect(cfg),
        });
    }
    Arc::new(TcpDialer {
        timeout: cfg.timeout,
        local_port: local_port_for_connect(cfg),
    })
}

fn gateway_config(cfg: &Config, spec: &gonc_types::TunnelSpec) -> GatewayConfig {
    let mut gateway = GatewayConfig::new(spec.user.clone(), spec.host.clone(), spec.port);
    gateway.key_path = cfg.ssh_key_path.clone();
    gateway.prompt_password = cfg.ssh_password;
    gateway.use_agent = cfg.use_ssh_agent;
    gateway.strict_host_key = cfg.strict_host_key;
    gateway.known_hosts_path = cfg.known_hosts_path.clone();
    gateway
}

/// `-p` binds the source port in connect mode; in listen mode it is the
/// listening port instead.
fn local_port_for_connect(cfg: &Config) -> Option<u16> {
    if cfg.listen { None } else { cfg.local_port }
}

/// With `-n`, only numeric hosts are allowed.
fn ensure_numeric_host(cfg: &Config) -> Result<()> {
    if cfg.no_dns && cfg.host.parse::<std::net::IpAddr>().is_err() {
        return Err(NcError::other(format!(
            "cannot parse {:?} as an IP address (DNS disabled with -n)",
            cfg.host
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gonc_types::TunnelSpec;

    fn connect_cfg() -> Config {
        Config {
            host: "example.com".into(),
            port: Some(80),
            ..Config::default()
        }
    }

    #[test]
    fn dispatches_to_the_expected_mode() {
        assert!(matches!(build(&connect_cfg()).unwrap(), Mode::Connect(_)));

        let cfg = Config {
            listen: true,
            local_port: Some(8080),
            ..Config::default()
        };
        assert!(matches!(build(&cfg).unwrap(), Mode::Listen(_)));

        let cfg = Config {
            zero_io: true,
            ..connect_cfg()
        };
        assert!(matches!(build(&cfg).unwrap(), Mode::Scan(_)));

        let cfg = Config {
            listen: true,
            local_port: Some(3000),
            reverse_tunnel: Some(TunnelSpec::parse("user@gw").unwrap()),
            remote_port: Some(9000),
            ..Config::default()
        };
        assert!(matches!(build(&cfg).unwrap(), Mode::Reverse(_)));
    }

    #[test]
    fn no_dns_rejects_hostnames() {
        let cfg = Config {
            no_dns: true,
            ..connect_cfg()
        };
        assert!(build(&cfg).is_err());

        let cfg = Config {
            no_dns: true,
            host: "127.0.0.1".into(),
            port: Some(80),
            ..Config::default()
        };
        assert!(build(&cfg).is_ok());
    }

    #[test]
    fn source_port_only_applies_to_connect() {
        let cfg = Config {
            local_port: Some(4000),
            ..connect_cfg()
        };
        assert_eq!(local_port_for_connect(&cfg), Some(4000));

        let cfg = Config {
            listen: true,
            local_port: Some(4000),
            ..Config::default()
        };
        assert_eq!(local_port_for_connect(&cfg), None);
    }
}
