//! Scan mode: probe a set of TCP ports on a target host and report which
//! are open, either directly or through a forward SSH tunnel.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{build_dialer, ensure_numeric_host};
use gonc_core::{scan::scan_ports, transport::Dialer};
use gonc_types::{Config, NcError, config::DEFAULT_SCAN_TIMEOUT};

type Result<T> = gonc_types::NcResult<T>;

pub struct ScanMode {
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) host: String,
    pub(crate) ports: Vec<u16>,
    pub(crate) timeout: Duration,
    pub(crate) verbose: u8,
}

impl ScanMode {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        ensure_numeric_host(cfg)?;

        let mut ports = cfg.all_ports();
        if ports.is_empty() {
            if let Some(port) = cfg.port {
                ports.push(port);
            }
        }

        Ok(ScanMode {
            dialer: build_dialer(cfg),
            host: cfg.host.clone(),
            ports,
            timeout: cfg.timeout.unwrap_or(DEFAULT_SCAN_TIMEOUT),
            verbose: cfg.verbose,
        })
    }

    pub async fn run(self, token: &CancellationToken) -> Result<()> {
        if self.ports.is_empty() {
            let _ = self.dialer.close().await;
            return Err(NcError::other("no ports specified for scanning"));
        }

        debug!(host = %self.host, ports = self.ports.len(), "scanning");
        let results = scan_ports(token, self.dialer.clone(), &self.host, &self.ports, self.timeout).await;
        let _ = self.dialer.close().await;

        let mut open = 0usize;
        for result in &results {
            if result.open {
                open += 1;
                info!("{} {}/tcp open", self.host, result.port);
            } else if self.verbose >= 2 {
                let reason = result
                    .error
                    .as_ref()
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "closed".to_string());
                debug!("{} {}/tcp closed - {reason}", self.host, result.port);
            }
        }
        if open == 0 && self.verbose >= 1 {
            info!("no open ports found on {}", self.host);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gonc_core::transport::TcpDialer;
    use tokio::net::TcpListener;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scans_mixed_open_and_closed_ports() {
        let l1 = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let l2 = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let p1 = l1.local_addr().unwrap().port();
        let p2 = l2.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                match l1.accept().await {
                    Ok((socket, _)) => drop(socket),
                    Err(_) => return,
                }
            }
        });
        tokio::spawn(async move {
            loop {
                match l2.accept().await {
                    Ok((socket, _)) => drop(socket),
                    Err(_) => return,
                }
            }
        });

        let mode = ScanMode {
            dialer: Arc::new(TcpDialer::default()),
            host: "127.0.0.1".into(),
            ports: vec![p1, 1, p2],
            timeout: Duration::from_secs(1),
            verbose: 0,
        };
        let token = CancellationToken::new();
        mode.run(&token).await.unwrap();
    }

    #[tokio::test]
    async fn empty_port_list_is_an_error() {
        let mode = ScanMode {
            dialer: Arc::new(TcpDialer::default()),
            host: "127.0.0.1".into(),
            ports: Vec::new(),
            timeout: Duration::from_secs(1),
            verbose: 0,
        };
        let token = CancellationToken::new();
        let err = mode.run(&token).await.unwrap_err();
        assert!(err.to_string().contains("no ports specified"));
    }
}
