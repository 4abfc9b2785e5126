//! SSH transport for gonc, built on `russh`.
//!
//! [`ForwardTunnel`] opens client-initiated `direct-tcpip` channels through
//! an authenticated gateway (ssh -L style pivoting); [`ReverseTunnel`] asks
//! the gateway to listen on a remote port and bridges every inbound channel
//! back to a local service (ssh -R), including the accept-everything channel
//! demultiplexer needed for public tunnel services.

mod auth;
pub mod config;
pub mod forward;
mod gateway;
mod hostkeys;
pub mod reverse;

pub use auth::default_username;
pub use config::GatewayConfig;
pub use forward::{ForwardTunnel, SshDialer};
pub use reverse::{ReverseTunnel, ReverseTunnelConfig};
