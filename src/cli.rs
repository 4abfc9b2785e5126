//! CLI surface and the translation from flags plus `GONC_*` environment
//! variables into a validated [`Config`]. Precedence is CLI > environment >
//! defaults: the environment overlay runs first and explicit flags override.

use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, CommandFactory, Parser};

use gonc_types::{
    Config, NcError, PortRange, TunnelSpec,
    config::{DEFAULT_KEEPALIVE_SECS, load_from_env},
};

type Result<T> = gonc_types::NcResult<T>;

const AFTER_HELP: &str = "\
Environment Variables:
  GONC_HOST, GONC_PORT, GONC_LISTEN, GONC_UDP, GONC_VERBOSE
  GONC_TUNNEL, GONC_SSH_KEY, GONC_SSH_AGENT, GONC_STRICT_HOSTKEY
  GONC_REVERSE_TUNNEL, GONC_REMOTE_PORT, GONC_AUTO_RECONNECT

  Precedence: CLI flags > Environment > Defaults

Examples:
  gonc example.com 80                         TCP connect
  gonc -l -p 8080                             Listen on 8080
  gonc -vz host.example.com 20-25 80 443      Port scan
  gonc -T admin@bastion db-internal 5432      SSH forward tunnel
  echo \"hello\" | gonc host.example.com 9000   Pipe data

  # Reverse tunnel - expose local port 8080 on gateway port 9000
  gonc -p 8080 -R user@gateway --remote-port 9000

  # Expose local port 3000 via serveo.net (developer tunnel)
  gonc -p 3000 -R serveo.net --remote-port 80

  # Validate configuration without executing
  gonc --dry-run -p 3000 -R serveo.net --remote-port 80";

/// Cross-platform netcat with native SSH forward and reverse tunneling.
#[derive(Debug, Parser)]
#[command(
    name = "gonc",
    version,
    about = "Network connectivity tool with native SSH tunneling",
    after_help = AFTER_HELP
)]
pub struct Args {
    /// Destination host (omitted in reverse-tunnel mode)
    #[arg(value_name = "HOST")]
    pub host: Option<String>,
    /// Destination port(s): single values or ranges like 20-25
    #[arg(value_name = "PORT")]
    pub ports: Vec<String>,

    /// Listen mode
    #[arg(short, long, help_heading = "Connection")]
    pub listen: bool,
    /// Local port number
    #[arg(short = 'p', long = "port", value_name = "PORT", help_heading = "Connection")]
    pub port: Option<u16>,
    /// UDP mode
    #[arg(short, long, help_heading = "Connection")]
    pub udp: bool,
    /// Numeric-only, no DNS resolution
    #[arg(short = 'n', long = "no-dns", help_heading = "Connection")]
    pub no_dns: bool,
    /// Accept multiple connections (with -l)
    #[arg(short, long, help_heading = "Connection")]
    pub keep_open: bool,
    /// Zero-I/O mode (port scanning)
    #[arg(short = 'z', long = "zero-io", help_heading = "Connection")]
    pub zero_io: bool,
    /// Timeout in seconds
    #[arg(short = 'w', long = "timeout", value_name = "SECONDS", help_heading = "Connection")]
    pub timeout: Option<u64>,

    /// Execute program after connect
    #[arg(short, long, value_name = "PROGRAM", help_heading = "Execution")]
    pub exec: Option<String>,
    /// Execute shell command after connect
    #[arg(short, long, value_name = "COMMAND", help_heading = "Execution")]
    pub command: Option<String>,

    /// SSH tunnel via [user@]host[:port]
    #[arg(short = 'T', long = "tunnel", value_name = "SPEC", help_heading = "SSH Tunnel")]
    pub tunnel: Option<String>,
    /// SSH private key file
    #[arg(long = "ssh-key", value_name = "FILE", help_heading = "SSH Tunnel")]
    pub ssh_key: Option<PathBuf>,
    /// Prompt for SSH password
    #[arg(long = "ssh-password", help_heading = "SSH Tunnel")]
    pub ssh_password: bool,
    /// Use SSH agent
    #[arg(long = "ssh-agent", help_heading = "SSH Tunnel")]
    pub ssh_agent: bool,
    /// Verify SSH host keys
    #[arg(long = "strict-hostkey", help_heading = "SSH Tunnel")]
    pub strict_hostkey: bool,
    /// Custom known_hosts path
    #[arg(long = "known-hosts", value_name = "FILE", help_heading = "SSH Tunnel")]
    pub known_hosts: Option<PathBuf>,
    /// Local tunnel port (auto if 0)
    #[arg(long = "tunnel-local-port", value_name = "PORT", help_heading = "SSH Tunnel")]
    pub tunnel_local_port: Option<u16>,

    /// Reverse SSH tunnel via [user@]host[:port]
    #[arg(short = 'R', long = "reverse-tunnel", value_name = "SPEC", help_heading = "Reverse Tunnel")]
    pub reverse_tunnel: Option<String>,
    /// Port to bind on remote gateway (for -R)
    #[arg(long = "remote-port", value_name = "PORT", help_heading = "Reverse Tunnel")]
    pub remote_port: Option<u16>,
    /// Remote bind address (for -R)
    #[arg(long = "remote-bind-address", value_name = "ADDR", help_heading = "Reverse Tunnel")]
    pub remote_bind_address: Option<String>,
    /// Verify GatewayPorts before tunneling
    #[arg(long = "gateway-ports-check", help_heading = "Reverse Tunnel")]
    pub gateway_ports_check: bool,
    /// SSH keepalive interval in seconds (0 to disable) [default: 30]
    #[arg(long = "keep-alive", value_name = "SECONDS", help_heading = "Reverse Tunnel")]
    pub keep_alive: Option<u64>,
    /// Auto-reconnect on tunnel drop
    #[arg(long = "auto-reconnect", help_heading = "Reverse Tunnel")]
    pub auto_reconnect: bool,

    /// Increase verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,
    /// Validate config and exit without executing
    #[arg(long = "dry-run", help_heading = "Output")]
    pub dry_run: bool,
}

pub fn print_usage() {
    let _ = Args::command().print_help();
}

/// Build and validate the session configuration from parsed flags, with the
/// environment overlay applied underneath.
pub fn build_config(args: Args) -> Result<Config> {
    let mut cfg = Config::default();
    load_from_env(&mut cfg);

    if args.listen {
        cfg.listen = true;
    }
    if let Some(port) = args.port {
        cfg.local_port = Some(port);
    }
    if args.udp {
        cfg.udp = true;
    }
    if args.no_dns {
        cfg.no_dns = true;
    }
    if args.keep_open {
        cfg.keep_open = true;
    }
    if args.zero_io {
        cfg.zero_io = true;
    }
    if let Some(secs) = args.timeout {
        if secs > 0 {
            cfg.timeout = Some(Duration::from_secs(secs));
        }
    }

    if let Some(program) = args.exec {
        cfg.execute = Some(program);
    }
    if let Some(command) = args.command {
        cfg.command = Some(command);
    }

    if let Some(path) = args.ssh_key {
        cfg.ssh_key_path = Some(path);
    }
    if args.ssh_password {
        cfg.ssh_password = true;
    }
    if args.ssh_agent {
        cfg.use_ssh_agent = true;
    }
    if args.strict_hostkey {
        cfg.strict_host_key = true;
    }
    if let Some(path) = args.known_hosts {
        cfg.known_hosts_path = Some(path);
    }
    if let Some(port) = args.tunnel_local_port {
        cfg.tunnel_local_port = Some(port);
    }

    if let Some(port) = args.remote_port {
        cfg.remote_port = Some(port);
    }
    if let Some(addr) = args.remote_bind_address {
        cfg.remote_bind_address = addr;
    }
    match args.keep_alive {
        Some(secs) => cfg.keep_alive_secs = secs,
        None => {
            if cfg.keep_alive_secs == 0 {
                cfg.keep_alive_secs = DEFAULT_KEEPALIVE_SECS;
            }
        }
    }
    if args.auto_reconnect {
        cfg.auto_reconnect = true;
    }

    if args.verbose > 0 {
        cfg.verbose = args.verbose;
    }
    if args.dry_run {
        cfg.dry_run = true;
    }

    // Reverse tunnel first: -R implies listen mode and lifts the hostname
    // requirement before positional parsing runs.
    if let Some(raw) = &args.reverse_tunnel {
        let spec = TunnelSpec::parse(raw)
            .map_err(|err| NcError::other(format!("reverse tunnel: {err}")))?;
        cfg.reverse_tunnel = Some(spec);
    }
    if let Some(spec) = &mut cfg.reverse_tunnel {
        if spec.user.is_empty() {
            spec.user = gonc_ssh::default_username();
        }
        cfg.listen = true;
        if cfg.local_port.is_none() {
            cfg.local_port = cfg.remote_port;
        }
    }

    parse_positional(&mut cfg, args.host.as_deref(), &args.ports)?;

    if let Some(raw) = &args.tunnel {
        let spec =
            TunnelSpec::parse(raw).map_err(|err| NcError::other(format!("tunnel: {err}")))?;
        cfg.tunnel = Some(spec);
    }
    if let Some(spec) = &mut cfg.tunnel {
        if spec.user.is_empty() {
            spec.user = gonc_ssh::default_username();
        }
    }

    cfg.validate()?;
    Ok(cfg)
}

fn parse_positional(cfg: &mut Config, host: Option<&str>, ports: &[String]) -> Result<()> {
    if cfg.listen {
        match (host, ports.len()) {
            (None, _) => {}
            (Some(h), 0) => cfg.host = h.to_string(),
            (Some(h), 1) => {
                cfg.host = h.to_string();
                let range = PortRange::parse(&ports[0])
                    .map_err(|err| NcError::other(format!("port: {err}")))?;
                cfg.port = Some(range.start);
            }
            _ => return Err(NcError::other("too many arguments for listen mode")),
        }
        return Ok(());
    }

    // Connect / scan mode: host port [port ...]
    let Some(h) = host else {
        return Err(NcError::other("hostname required (use --help for usage)"));
    };
    cfg.host = h.to_string();

    if ports.is_empty() {
        return Err(NcError::other("port required"));
    }
    for spec in ports {
        let range = PortRange::parse(spec)
            .map_err(|err| NcError::other(format!("port {spec:?}: {err}")))?;
        cfg.ports.push(range);
    }
    if let Some(first) = cfg.ports.first() {
        cfg.port = Some(first.start);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["gonc"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).expect("argument parsing failed")
    }

    #[test]
    fn plain_connect_arguments() {
        let cfg = build_config(parse(&["example.com", "80"])).unwrap();
        assert_eq!(cfg.host, "example.com");
        assert_eq!(cfg.port, Some(80));
        assert!(!cfg.listen);
    }

    #[test]
    fn multiple_port_specs_for_scanning() {
        let cfg = build_config(parse(&["-z", "host.example.com", "20-25", "80", "443"])).unwrap();
        assert!(cfg.zero_io);
        assert_eq!(cfg.all_ports(), vec![20, 21, 22, 23, 24, 25, 80, 443]);
        assert_eq!(cfg.port, Some(20));
    }

    #[test]
    fn reverse_tunnel_implies_listen_and_defaults_local_port() {
        let cfg = build_config(parse(&["-R", "serveo.net", "--remote-port", "80"])).unwrap();
        assert!(cfg.listen);
        assert_eq!(cfg.local_port, Some(80));
        let spec = cfg.reverse_tunnel.unwrap();
        assert_eq!(spec.host, "serveo.net");
        assert_eq!(spec.port, 22);
        assert!(!spec.user.is_empty(), "user defaults to the OS username");
        assert_eq!(cfg.keep_alive_secs, 30);
    }

    #[test]
    fn explicit_local_port_wins_over_remote_port_default() {
        let cfg = build_config(parse(&[
            "-p", "3000", "-R", "user@gateway", "--remote-port", "9000",
        ]))
        .unwrap();
        assert_eq!(cfg.local_port, Some(3000));
        assert_eq!(cfg.remote_port, Some(9000));
        assert_eq!(cfg.reverse_tunnel.unwrap().user, "user");
    }

    #[test]
    fn forward_tunnel_spec_is_parsed() {
        let cfg = build_config(parse(&["-T", "admin@bastion:2222", "db-internal", "5432"])).unwrap();
        let spec = cfg.tunnel.unwrap();
        assert_eq!(spec.user, "admin");
        assert_eq!(spec.host, "bastion");
        assert_eq!(spec.port, 2222);
        assert_eq!(cfg.host, "db-internal");
        assert_eq!(cfg.port, Some(5432));
    }

    #[test]
    fn listen_without_port_fails_validation() {
        let err = build_config(parse(&["-l"])).unwrap_err();
        assert!(err.to_string().contains("--port"));
    }

    #[test]
    fn listen_mode_rejects_extra_positionals() {
        let err = build_config(parse(&["-l", "-p", "8080", "host", "80", "81"])).unwrap_err();
        assert!(err.to_string().contains("too many arguments"));
    }

    #[test]
    fn connect_requires_positional_port() {
        let err = build_config(parse(&["example.com"])).unwrap_err();
        assert!(err.to_string().contains("port required"));
    }

    #[test]
    fn timeout_flag_maps_to_duration() {
        let cfg = build_config(parse(&["-w", "7", "example.com", "80"])).unwrap();
        assert_eq!(cfg.timeout, Some(Duration::from_secs(7)));
    }

    #[test]
    fn keep_alive_zero_disables() {
        let cfg = build_config(parse(&[
            "-R", "serveo.net", "--remote-port", "80", "--keep-alive", "0",
        ]))
        .unwrap();
        assert_eq!(cfg.keep_alive_secs, 0);
    }

    #[test]
    fn verbosity_is_counted() {
        let cfg = build_config(parse(&["-vvz", "example.com", "80"])).unwrap();
        assert_eq!(cfg.verbose, 2);
        assert!(cfg.zero_io);
    }
}
