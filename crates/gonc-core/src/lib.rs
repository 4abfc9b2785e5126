//! Engine primitives shared by every gonc mode: the full-duplex forwarder,
//! resilience helpers (backoff, circuit breaker), the metrics collector, the
//! concurrent port scanner, and the plain TCP/UDP transports.

pub mod forward;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod scan;
pub mod transport;
