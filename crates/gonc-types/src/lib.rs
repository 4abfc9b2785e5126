//! Shared configuration and error types used across gonc.
//!
//! These are intentionally dependency-light so they can be reused by CLI
//! parsing, the mode dispatcher, and the tunnel runtimes without pulling in
//! protocol implementations.

pub mod config;
pub mod error;

pub use config::{Config, PortRange, TunnelSpec};
pub use error::{ConfigError, NcError, NcResult, NetOp, SshOp};
