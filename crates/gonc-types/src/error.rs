use std::{fmt, io, time::Duration};

use thiserror::Error;

/// Network operation names carried by [`NcError::Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetOp {
    Dial,
    Listen,
    Accept,
    Read,
    Write,
}

impl fmt::Display for NetOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetOp::Dial => "dial",
            NetOp::Listen => "listen",
            NetOp::Accept => "accept",
            NetOp::Read => "read",
            NetOp::Write => "write",
        };
        f.write_str(s)
    }
}

/// SSH operation names carried by [`NcError::Ssh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshOp {
    Handshake,
    Auth,
    Hostkey,
    Channel,
    Forward,
}

impl fmt::Display for SshOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SshOp::Handshake => "handshake",
            SshOp::Auth => "auth",
            SshOp::Hostkey => "hostkey",
            SshOp::Channel => "channel",
            SshOp::Forward => "forward",
        };
        f.write_str(s)
    }
}

/// An invalid configuration value with an optional user-facing hint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ConfigError {
    /// Config field (flag name without leading dashes).
    pub field: &'static str,
    /// The offending value, when one was supplied.
    pub value: Option<String>,
    /// Human-readable explanation.
    pub message: String,
    /// Suggestion for the user.
    pub hint: Option<String>,
}

impl ConfigError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            value: None,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_value(mut self, value: impl fmt::Display) -> Self {
        self.value = Some(value.to_string());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config: --{}", self.field)?;
        if let Some(value) = &self.value {
            write!(f, "={value}")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {hint}")?;
        }
        Ok(())
    }
}

/// Error taxonomy for the whole tool.
///
/// Structured variants carry operation and address context; the unit-like
/// variants are sentinels meant for `matches!` checks without string
/// comparison.
#[derive(Debug, Error)]
pub enum NcError {
    /// Invalid configuration; surfaces the formatted hint to the user.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A network operation failed.
    #[error("{op} {addr}: {source}")]
    Network {
        op: NetOp,
        addr: String,
        retryable: bool,
        #[source]
        source: io::Error,
    },

    /// An SSH operation failed, with gateway context.
    #[error("ssh {op} {host}:{port}: {source}")]
    Ssh {
        op: SshOp,
        host: String,
        port: u16,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An SSH protocol failure without operation context.
    #[error("ssh: {0}")]
    SshProtocol(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The tunnel has been closed.
    #[error("tunnel is closed")]
    TunnelClosed,

    /// Operation attempted before the transport was connected.
    #[error("not connected")]
    NotConnected,

    /// The circuit breaker is rejecting calls.
    #[error("circuit open: {failures} consecutive failures, retry in {}s", .retry_in.as_secs())]
    CircuitOpen { failures: u32, retry_in: Duration },

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Authentication was rejected or could not be attempted.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The gateway presented a key that contradicts the known-hosts file.
    #[error("host key mismatch: {0}")]
    HostKeyMismatch(String),

    /// The retry budget of a backoff runner was exhausted.
    #[error("max retries ({attempts}) exceeded: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<NcError>,
    },

    /// A backoff sleep was interrupted by cancellation.
    #[error("retry cancelled: {source}")]
    RetryCancelled {
        #[source]
        source: Box<NcError>,
    },

    /// The governing cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// An I/O failure without address context.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Result type alias used across the workspace.
pub type NcResult<T> = Result<T, NcError>;

impl NcError {
    /// Create a [`NcError::Network`], deriving retryability from the cause.
    pub fn network(op: NetOp, addr: &str, source: io::Error) -> Self {
        let retryable = classify_retryable(&source);
        NcError::Network {
            op,
            addr: addr.to_string(),
            retryable,
            source,
        }
    }

    /// Create a [`NcError::Ssh`] with gateway context.
    pub fn ssh(
        op: SshOp,
        host: &str,
        port: u16,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        NcError::Ssh {
            op,
            host: host.to_string(),
            port,
            source: source.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        NcError::Other(message.into())
    }

    /// Whether retrying the failed operation may help.
    pub fn is_retryable(&self) -> bool {
        match self {
            NcError::Network { retryable, .. } => *retryable,
            NcError::Timeout => true,
            NcError::Io(err) => classify_retryable(err),
            _ => false,
        }
    }
}

/// Transient failures worth retrying, by [`io::ErrorKind`].
fn classify_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_formats_field_value_and_hint() {
        let err = ConfigError::new("remote-port", "out of range 1-65535")
            .with_value(0)
            .with_hint("e.g.: gonc -p 3000 -R serveo.net --remote-port 80");
        let text = err.to_string();
        assert!(text.starts_with("config: --remote-port=0: out of range"));
        assert!(text.contains("\n  hint: e.g.: gonc -p 3000"));
    }

    #[test]
    fn network_error_reports_retryability() {
        let err = NcError::network(
            NetOp::Dial,
            "example.com:80",
            io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        );
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "dial example.com:80: reset");

        let err = NcError::network(
            NetOp::Dial,
            "example.com:80",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn ssh_error_carries_host_context() {
        let err = NcError::ssh(SshOp::Handshake, "bastion", 2222, "kex failure");
        assert_eq!(err.to_string(), "ssh handshake bastion:2222: kex failure");
    }

    #[test]
    fn sentinels_match_without_strings() {
        let err: NcError = NcError::NotConnected;
        assert!(matches!(err, NcError::NotConnected));
        let err = NcError::CircuitOpen {
            failures: 5,
            retry_in: Duration::from_secs(12),
        };
        assert!(matches!(err, NcError::CircuitOpen { .. }));
        assert!(err.to_string().contains("retry in 12s"));
    }
}
