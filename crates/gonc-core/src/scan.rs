//! Concurrent TCP port probing over a pluggable dialer, bounded by a
//! semaphore so large ranges cannot exhaust local resources.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::transport::{Dialer, format_addr};
use gonc_types::{NcError, config::MAX_CONCURRENT_SCANS};

/// Whether a single port accepted a connection.
#[derive(Debug)]
pub struct ScanResult {
    pub port: u16,
    pub open: bool,
    pub error: Option<NcError>,
}

/// Probe every port concurrently and return results in input order. All
/// probes are awaited, so partial results never occur; the dialer decides
/// whether probes go direct or through an SSH tunnel.
pub async fn scan_ports(
    token: &CancellationToken,
    dialer: Arc<dyn Dialer>,
    host: &str,
    ports: &[u16],
    timeout: Duration,
) -> Vec<ScanResult> {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SCANS));
    let mut probes = JoinSet::new();

    for (idx, &port) in ports.iter().enumerate() {
        let semaphore = semaphore.clone();
        let dialer = dialer.clone();
        let probe_token = token.child_token();
        let address = format_addr(host, port);
        probes.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (idx, closed(port, NcError::Cancelled));
                }
            };

            let outcome = tokio::select! {
                _ = probe_token.cancelled() => Err(NcError::Cancelled),
                res = tokio::time::timeout(timeout, dialer.dial(&probe_token, "tcp", &address)) => {
                    match res {
                        Ok(dialed) => dialed,
                        Err(_) => Err(NcError::Timeout),
                    }
                }
            };

            match outcome {
                Ok(conn) => {
                    drop(conn);
                    (
                        idx,
                        ScanResult {
                            port,
                            open: true,
                            error: None,
                        },
                    )
                }
                Err(err) => (idx, closed(port, err)),
            }
        });
    }

    let mut results: Vec<ScanResult> = ports
        .iter()
        .map(|&port| closed(port, NcError::Cancelled))
        .collect();
    while let Some(joined) = probes.join_next().await {
        if let Ok((idx, result)) = joined {
            results[idx] = result;
        }
    }
    results
}

fn closed(port: u16, err: NcError) -> ScanResult {
    ScanResult {
        port,
        open: false,
        error: Some(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpDialer;
    use std::time::Instant;
    use tokio::net::TcpListener;

    async fn listener_port(listener: &TcpListener) -> u16 {
        listener.local_addr().unwrap().port()
    }

    async fn accept_all(listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => drop(socket),
                Err(_) => return,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_open_and_closed_ports_in_input_order() {
        let l1 = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let l2 = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let p1 = listener_port(&l1).await;
        let p2 = listener_port(&l2).await;
        tokio::spawn(accept_all(l1));
        tokio::spawn(accept_all(l2));

        // Port 1 is essentially never listening on loopback.
        let ports = vec![p1, 1, p2];
        let token = CancellationToken::new();
        let results = scan_ports(
            &token,
            Arc::new(TcpDialer::default()),
            "127.0.0.1",
            &ports,
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].port, p1);
        assert!(results[0].open);
        assert!(results[0].error.is_none());
        assert_eq!(results[1].port, 1);
        assert!(!results[1].open);
        assert!(results[1].error.is_some());
        assert_eq!(results[2].port, p2);
        assert!(results[2].open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bounded_concurrency_still_finishes_quickly() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let open_port = listener_port(&listener).await;
        tokio::spawn(accept_all(listener));

        // Loopback refusals are immediate, so even several hundred probes
        // through the 100-permit semaphore finish well inside the bound.
        let ports: Vec<u16> = std::iter::repeat_n(open_port, 250).collect();
        let token = CancellationToken::new();
        let started = Instant::now();
        let results = scan_ports(
            &token,
            Arc::new(TcpDialer::default()),
            "127.0.0.1",
            &ports,
            Duration::from_secs(1),
        )
        .await;
        assert!(results.iter().all(|r| r.open));
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "scan took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_port_list_yields_no_results() {
        let token = CancellationToken::new();
        let results = scan_ports(
            &token,
            Arc::new(TcpDialer::default()),
            "127.0.0.1",
            &[],
            Duration::from_millis(100),
        )
        .await;
        assert!(results.is_empty());
    }
}
