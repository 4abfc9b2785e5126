//! Lightweight runtime metrics for a gonc session.
//!
//! Counter updates are lock-free atomics; only the timestamped fields take a
//! short lock. A disabled collector is a valid no-op handle, so callers never
//! need to branch on whether metrics are enabled.

use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

/// Metrics handle. Cheap to clone; the disabled form (also the default)
/// turns every method into a no-op.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    started: Instant,
    connections_active: AtomicI64,
    connections_total: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    tunnel_reconnects: AtomicU64,
    errors_total: AtomicU64,
    slow: RwLock<Timestamped>,
}

#[derive(Default)]
struct Timestamped {
    last_health_check: Option<SystemTime>,
    last_error: Option<SystemTime>,
    last_error_message: Option<String>,
}

/// Point-in-time view of all metrics. Timestamps are unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub uptime_secs: u64,
    pub connections_active: i64,
    pub connections_total: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub tunnel_reconnects: u64,
    pub errors_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
}

impl Metrics {
    /// A live collector with the start time set to now.
    pub fn new() -> Self {
        Metrics {
            inner: Some(Arc::new(Inner {
                started: Instant::now(),
                connections_active: AtomicI64::new(0),
                connections_total: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                tunnel_reconnects: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                slow: RwLock::new(Timestamped::default()),
            })),
        }
    }

    /// A no-op handle.
    pub fn disabled() -> Self {
        Metrics { inner: None }
    }

    pub fn connection_opened(&self) {
        if let Some(inner) = &self.inner {
            inner.connections_active.fetch_add(1, Ordering::Relaxed);
            inner.connections_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_closed(&self) {
        if let Some(inner) = &self.inner {
            inner.connections_active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn bytes_received(&self, n: u64) {
        if let Some(inner) = &self.inner {
            inner.bytes_in.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn bytes_sent(&self, n: u64) {
        if let Some(inner) = &self.inner {
            inner.bytes_out.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn tunnel_reconnect(&self) {
        if let Some(inner) = &self.inner {
            inner.tunnel_reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self, message: impl Into<String>) {
        if let Some(inner) = &self.inner {
            inner.errors_total.fetch_add(1, Ordering::Relaxed);
            let mut slow = inner.slow.write().expect("metrics lock poisoned");
            slow.last_error = Some(SystemTime::now());
            slow.last_error_message = Some(message.into());
        }
    }

    pub fn record_health_check(&self) {
        if let Some(inner) = &self.inner {
            let mut slow = inner.slow.write().expect("metrics lock poisoned");
            slow.last_health_check = Some(SystemTime::now());
        }
    }

    pub fn active_connections(&self) -> i64 {
        self.inner
            .as_ref()
            .map(|i| i.connections_active.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|i| i.connections_total.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total_bytes_in(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|i| i.bytes_in.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total_bytes_out(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|i| i.bytes_out.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn error_count(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|i| i.errors_total.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// A copy of all current metrics; all-zero for a disabled handle.
    pub fn snapshot(&self) -> Snapshot {
        let Some(inner) = &self.inner else {
            return Snapshot::default();
        };
        let slow = inner.slow.read().expect("metrics lock poisoned");
        Snapshot {
            uptime_secs: inner.started.elapsed().as_secs(),
            connections_active: inner.connections_active.load(Ordering::Relaxed),
            connections_total: inner.connections_total.load(Ordering::Relaxed),
            bytes_in: inner.bytes_in.load(Ordering::Relaxed),
            bytes_out: inner.bytes_out.load(Ordering::Relaxed),
            tunnel_reconnects: inner.tunnel_reconnects.load(Ordering::Relaxed),
            errors_total: inner.errors_total.load(Ordering::Relaxed),
            last_health_check: slow.last_health_check.map(unix_secs),
            last_error: slow.last_error.map(unix_secs),
            last_error_message: slow.last_error_message.clone(),
        }
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        m.bytes_received(100);
        m.bytes_sent(40);
        m.tunnel_reconnect();
        m.record_error("dial refused");
        m.record_health_check();

        let snap = m.snapshot();
        assert_eq!(snap.connections_active, 1);
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.bytes_in, 100);
        assert_eq!(snap.bytes_out, 40);
        assert_eq!(snap.tunnel_reconnects, 1);
        assert_eq!(snap.errors_total, 1);
        assert_eq!(snap.last_error_message.as_deref(), Some("dial refused"));
        assert!(snap.last_health_check.is_some());
    }

    #[test]
    fn disabled_handle_is_a_noop() {
        let m = Metrics::disabled();
        m.connection_opened();
        m.connection_closed();
        m.bytes_received(1);
        m.bytes_sent(1);
        m.tunnel_reconnect();
        m.record_error("ignored");
        m.record_health_check();

        assert_eq!(m.active_connections(), 0);
        assert_eq!(m.total_connections(), 0);
        assert_eq!(m.error_count(), 0);
        assert_eq!(m.snapshot(), Snapshot::default());
    }

    #[test]
    fn default_handle_is_disabled() {
        let m = Metrics::default();
        m.record_error("ignored");
        assert_eq!(m.snapshot(), Snapshot::default());
    }

    #[test]
    fn snapshot_serializes_flat() {
        let m = Metrics::new();
        m.bytes_received(7);
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["bytes_in"], 7);
        assert!(json.get("last_error").is_none());
    }

    #[test]
    fn concurrent_updates_are_consistent() {
        let m = Metrics::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.connection_opened();
                        m.bytes_received(1);
                        m.connection_closed();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(m.active_connections(), 0);
        assert_eq!(m.total_connections(), 8000);
        assert_eq!(m.total_bytes_in(), 8000);
    }
}
