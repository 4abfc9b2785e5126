//! Reverse-tunnel mode: expose the local service on a remote SSH gateway
//! and block until cancellation or tunnel shutdown.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use gonc_core::metrics::Metrics;
use gonc_ssh::{GatewayConfig, ReverseTunnel, ReverseTunnelConfig};
use gonc_types::{Config, NcError};

type Result<T> = gonc_types::NcResult<T>;

pub struct ReverseTunnelMode {
    config: ReverseTunnelConfig,
}

impl ReverseTunnelMode {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let spec = cfg
            .reverse_tunnel
            .as_ref()
            .ok_or_else(|| NcError::other("reverse tunnel mode without a tunnel spec"))?;
        let local_port = cfg
            .local_port
            .ok_or_else(|| NcError::other("reverse tunnel mode without a local port"))?;
        let remote_port = cfg
            .remote_port
            .ok_or_else(|| NcError::other("reverse tunnel mode without a remote port"))?;

        let mut gateway = GatewayConfig::new(spec.user.clone(), spec.host.clone(), spec.port);
        gateway.key_path = cfg.ssh_key_path.clone();
        gateway.prompt_password = cfg.ssh_password;
        gateway.use_agent = cfg.use_ssh_agent;
        gateway.strict_host_key = cfg.strict_host_key;
        gateway.known_hosts_path = cfg.known_hosts_path.clone();
        // Required for anonymous public services (serveo.net, localhost.run).
        gateway.allow_keyboard_interactive = true;

        Ok(ReverseTunnelMode {
            config: ReverseTunnelConfig {
                gateway,
                remote_bind_address: cfg.remote_bind_address.clone(),
                remote_port,
                local_address: String::new(),
                local_port,
                check_gateway_ports: cfg.check_gateway_ports,
                keep_alive: (cfg.keep_alive_secs > 0)
                    .then(|| Duration::from_secs(cfg.keep_alive_secs)),
                auto_reconnect: cfg.auto_reconnect,
            },
        })
    }

    pub async fn run(self, token: &CancellationToken) -> Result<()> {
        let gateway = &self.config.gateway;
        debug!(
            gateway = %gateway.address(),
            user = %gateway.user,
            remote_port = self.config.remote_port,
            local_port = self.config.local_port,
            "establishing reverse tunnel"
        );

        let tunnel = ReverseTunnel::new(self.config, Metrics::new());
        tunnel
            .start(token)
            .await
            .map_err(|err| NcError::other(format!("reverse tunnel: {err}")))?;

        tunnel.wait().await;
        let outcome = tunnel.close().await;

        if let Ok(json) = serde_json::to_string(&tunnel.metrics().snapshot()) {
            debug!(metrics = %json, "session metrics");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gonc_types::TunnelSpec;

    #[test]
    fn builds_the_tunnel_config_from_flags() {
        let cfg = Config {
            listen: true,
            local_port: Some(3000),
            reverse_tunnel: Some(TunnelSpec::parse("deploy@gw:2222").unwrap()),
            remote_port: Some(9000),
            remote_bind_address: "0.0.0.0".into(),
            keep_alive_secs: 15,
            auto_reconnect: true,
            ..Config::default()
        };
        let mode = ReverseTunnelMode::from_config(&cfg).unwrap();
        assert_eq!(mode.config.gateway.host, "gw");
        assert_eq!(mode.config.gateway.port, 2222);
        assert!(mode.config.gateway.allow_keyboard_interactive);
        assert_eq!(mode.config.remote_port, 9000);
        assert_eq!(mode.config.local_port, 3000);
        assert_eq!(mode.config.keep_alive, Some(Duration::from_secs(15)));
        assert!(mode.config.auto_reconnect);
    }

    #[test]
    fn zero_keepalive_disables_the_probe() {
        let cfg = Config {
            listen: true,
            local_port: Some(8080),
            reverse_tunnel: Some(TunnelSpec::parse("gw").unwrap()),
            remote_port: Some(8080),
            keep_alive_secs: 0,
            ..Config::default()
        };
        let mode = ReverseTunnelMode::from_config(&cfg).unwrap();
        assert_eq!(mode.config.keep_alive, None);
    }
}
