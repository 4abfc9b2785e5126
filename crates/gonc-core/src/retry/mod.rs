//! Resilience primitives: exponential backoff with jitter and a circuit
//! breaker gating a callable.

mod backoff;
mod circuit;

pub use backoff::{AttemptError, Backoff};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, State};
