//! Runtime configuration for a single gonc session, plus parsers for port
//! specs and tunnel specs and the validation rules tying the flags together.

use std::{env, fmt, path::PathBuf, time::Duration};

use crate::error::{ConfigError, NcError, NcResult};

// Tuneable defaults, kept together so they are easy to audit and reuse
// across CLI flags and environment loading.

/// Standard SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Address used for local service binding.
pub const DEFAULT_LOCAL_ADDRESS: &str = "127.0.0.1";
/// SSH keepalive interval in seconds.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;
/// Per-port timeout for scanning.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(3);
/// Upper bound on simultaneous scan probes.
pub const MAX_CONCURRENT_SCANS: usize = 100;
/// TCP/SSH connection timeout.
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(30);
/// Retry budget after a tunnel disconnect.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;
/// Cap on the exponential backoff between reconnection attempts.
pub const DEFAULT_RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);
/// How long teardown waits for in-flight handlers to finish.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// An inclusive start-end port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Parse `"80"` or `"80-90"`, enforcing `1 <= start <= end <= 65535`.
    pub fn parse(spec: &str) -> NcResult<Self> {
        if let Some((lo, hi)) = spec.split_once('-') {
            let start: u32 = lo
                .parse()
                .map_err(|_| NcError::other(format!("invalid port range start {lo:?}")))?;
            let end: u32 = hi
                .parse()
                .map_err(|_| NcError::other(format!("invalid port range end {hi:?}")))?;
            if start < 1 || end > 65535 || start > end {
                return Err(NcError::other(format!("invalid port range {start}-{end}")));
            }
            return Ok(PortRange {
                start: start as u16,
                end: end as u16,
            });
        }

        let port: u32 = spec
            .parse()
            .map_err(|_| NcError::other(format!("invalid port {spec:?}")))?;
        if !(1..=65535).contains(&port) {
            return Err(NcError::other(format!("port {port} out of range 1-65535")));
        }
        Ok(PortRange {
            start: port as u16,
            end: port as u16,
        })
    }

    /// Every port in the range, in order.
    pub fn expand(&self) -> std::ops::RangeInclusive<u16> {
        self.start..=self.end
    }

    /// Number of ports covered by the range (always at least 1).
    pub fn count(&self) -> usize {
        (self.end - self.start) as usize + 1
    }
}

/// A parsed `[user@]host[:port]` gateway spec. The port defaults to 22; an
/// empty user is legal and resolved to the OS username later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl TunnelSpec {
    pub fn parse(spec: &str) -> NcResult<Self> {
        let invalid =
            || NcError::other(format!("invalid tunnel spec {spec:?} - expected [user@]host[:port]"));

        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) => {
                if user.is_empty() {
                    return Err(invalid());
                }
                (user.to_string(), rest)
            }
            None => (String::new(), spec),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) => {
                let port: u32 = port_str
                    .parse()
                    .map_err(|_| NcError::other(format!("invalid tunnel port {port_str:?}")))?;
                if !(1..=65535).contains(&port) {
                    return Err(NcError::other(format!("invalid tunnel port {port_str:?}")));
                }
                (host, port as u16)
            }
            None => (rest, DEFAULT_SSH_PORT),
        };

        if host.is_empty() || host.contains('@') || host.contains(':') {
            return Err(invalid());
        }

        Ok(TunnelSpec {
            user,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.user.is_empty() {
            write!(f, "{}@", self.user)?;
        }
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Every tuneable for a single gonc session. Immutable after [`Config::validate`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    // Connection
    pub host: String,
    /// Primary destination port.
    pub port: Option<u16>,
    /// All destination port specs (scanning).
    pub ports: Vec<PortRange>,
    /// `-p`: local bind port.
    pub local_port: Option<u16>,
    pub listen: bool,
    pub udp: bool,
    pub timeout: Option<Duration>,
    pub keep_open: bool,
    pub no_dns: bool,

    // Forward SSH tunnel
    pub tunnel: Option<TunnelSpec>,
    pub ssh_key_path: Option<PathBuf>,
    /// `--ssh-password`: prompt interactively.
    pub ssh_password: bool,
    pub use_ssh_agent: bool,
    pub strict_host_key: bool,
    pub known_hosts_path: Option<PathBuf>,
    pub tunnel_local_port: Option<u16>,

    // Reverse SSH tunnel
    pub reverse_tunnel: Option<TunnelSpec>,
    /// Port to bind on the remote gateway.
    pub remote_port: Option<u16>,
    /// Remote bind address; empty string lets the server decide.
    pub remote_bind_address: String,
    pub check_gateway_ports: bool,
    /// Keepalive interval in seconds (0 disables).
    pub keep_alive_secs: u64,
    pub auto_reconnect: bool,

    // Execution
    /// `-e`: program path.
    pub execute: Option<String>,
    /// `-c`: shell command.
    pub command: Option<String>,

    // Output / diagnostics
    pub verbose: u8,
    pub zero_io: bool,
    /// Validate the configuration and exit without executing.
    pub dry_run: bool,
}

impl Config {
    /// Flatten every [`PortRange`] into a single ordered list.
    pub fn all_ports(&self) -> Vec<u16> {
        self.ports.iter().flat_map(|pr| pr.expand()).collect()
    }

    /// Check that the configuration is internally consistent. Errors carry
    /// the offending field plus a hint where one helps.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen {
            if self.local_port.is_none() {
                return Err(ConfigError::new("port", "required in listen mode")
                    .with_hint("specify a port with -p <port>, e.g.: gonc -l -p 8080"));
            }
            if self.zero_io {
                return Err(ConfigError::new(
                    "zero-io",
                    "listen mode and zero-I/O mode are mutually exclusive",
                )
                .with_hint("use -z without -l for port scanning"));
            }
            if self.tunnel.is_some() {
                return Err(ConfigError::new(
                    "tunnel",
                    "listen mode through a forward SSH tunnel (-T) is not supported",
                )
                .with_hint("use -R for reverse tunnels instead"));
            }
        } else {
            if self.host.is_empty() && self.reverse_tunnel.is_none() {
                return Err(ConfigError::new("host", "hostname is required")
                    .with_hint("usage: gonc [options] <host> <port>"));
            }
            if self.port.is_none() && self.ports.is_empty() && self.reverse_tunnel.is_none() {
                return Err(ConfigError::new("port", "destination port is required")
                    .with_hint("usage: gonc <host> <port>, e.g.: gonc example.com 80"));
            }
        }

        if let Some(reverse) = &self.reverse_tunnel {
            if !self.listen {
                // -R implies -l in the CLI layer; arriving here without it
                // means a collaborator broke that contract.
                return Err(ConfigError::new(
                    "reverse-tunnel",
                    "reverse tunnel requires listen mode",
                )
                .with_hint("-R implies -l automatically; this is an internal error"));
            }
            match self.remote_port {
                None => {
                    return Err(ConfigError::new("remote-port", "required with -R")
                        .with_hint("e.g.: gonc -p 3000 -R serveo.net --remote-port 80"));
                }
                Some(0) => {
                    return Err(ConfigError::new("remote-port", "out of range 1-65535")
                        .with_value(0));
                }
                Some(_) => {}
            }
            if reverse.host.is_empty() {
                return Err(ConfigError::new("reverse-tunnel", "tunnel host is required")
                    .with_hint("e.g.: gonc -R user@gateway --remote-port 9000 -p 8080"));
            }
            if self.tunnel.is_some() {
                return Err(ConfigError::new("tunnel", "-T and -R are mutually exclusive")
                    .with_hint("use either forward tunnel (-T) or reverse tunnel (-R)"));
            }
            if self.udp {
                return Err(ConfigError::new("udp", "reverse tunnel does not support UDP"));
            }
        }

        if self.execute.is_some() && self.command.is_some() {
            return Err(ConfigError::new("exec", "-e and -c are mutually exclusive")
                .with_hint("use -e for a program or -c for a shell command, not both"));
        }

        if self.udp && self.tunnel.is_some() {
            return Err(ConfigError::new(
                "udp",
                "UDP is not supported through SSH tunnels",
            ));
        }

        if let Some(tunnel) = &self.tunnel {
            if tunnel.host.is_empty() {
                return Err(ConfigError::new("tunnel", "tunnel host is required")
                    .with_hint("e.g.: gonc -T user@gateway host port"));
            }
        }

        Ok(())
    }
}

// Environment variable overlay.
//
// Every supported variable uses the GONC_ prefix. Booleans accept
// "1" | "true" | "yes" (case-insensitive); invalid integers are ignored.
// This runs BEFORE CLI flags are applied so that flags take precedence.

/// Overlay `GONC_*` environment variables onto `cfg`. Only set variables
/// override the existing value.
pub fn load_from_env(cfg: &mut Config) {
    if let Some(v) = env_str("GONC_HOST") {
        cfg.host = v;
    }
    if let Some(v) = env_port("GONC_PORT") {
        cfg.local_port = Some(v);
    }
    if env_bool("GONC_LISTEN") {
        cfg.listen = true;
    }
    if env_bool("GONC_UDP") {
        cfg.udp = true;
    }
    if env_bool("GONC_NO_DNS") {
        cfg.no_dns = true;
    }
    if env_bool("GONC_KEEP_OPEN") {
        cfg.keep_open = true;
    }
    if let Some(v) = env_u64("GONC_TIMEOUT") {
        if v > 0 {
            cfg.timeout = Some(Duration::from_secs(v));
        }
    }

    // SSH tunnel
    if let Some(v) = env_str("GONC_TUNNEL") {
        if let Ok(spec) = TunnelSpec::parse(&v) {
            cfg.tunnel = Some(spec);
        }
    }
    if let Some(v) = env_str("GONC_SSH_KEY") {
        cfg.ssh_key_path = Some(PathBuf::from(v));
    }
    if env_bool("GONC_SSH_PASSWORD") {
        cfg.ssh_password = true;
    }
    if env_bool("GONC_SSH_AGENT") {
        cfg.use_ssh_agent = true;
    }
    if env_bool("GONC_STRICT_HOSTKEY") {
        cfg.strict_host_key = true;
    }
    if let Some(v) = env_str("GONC_KNOWN_HOSTS") {
        cfg.known_hosts_path = Some(PathBuf::from(v));
    }

    // Reverse tunnel
    if let Some(v) = env_str("GONC_REVERSE_TUNNEL") {
        if let Ok(spec) = TunnelSpec::parse(&v) {
            cfg.reverse_tunnel = Some(spec);
        }
    }
    if let Some(v) = env_port("GONC_REMOTE_PORT") {
        cfg.remote_port = Some(v);
    }
    if let Some(v) = env_str("GONC_REMOTE_BIND_ADDRESS") {
        cfg.remote_bind_address = v;
    }
    if let Some(v) = env_u64("GONC_KEEP_ALIVE") {
        if v > 0 {
            cfg.keep_alive_secs = v;
        }
    }
    if env_bool("GONC_AUTO_RECONNECT") {
        cfg.auto_reconnect = true;
    }

    // Output
    if let Some(v) = env_u64("GONC_VERBOSE") {
        if v > 0 {
            cfg.verbose = v.min(u8::MAX as u64) as u8;
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => None,
    }
}

fn env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => false,
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok()?.parse().ok()
}

fn env_port(key: &str) -> Option<u16> {
    match env_u64(key)? {
        0 => None,
        v if v <= 65535 => Some(v as u16),
        _ => None,
    }
}
