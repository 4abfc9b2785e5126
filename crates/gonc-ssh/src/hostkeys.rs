//! Host-key verification policy: accept-all when strict checking is off,
//! otherwise the conventional `known_hosts` file.

use std::path::PathBuf;

use russh::keys::{self, HashAlg, PublicKey};
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use gonc_types::{NcError, SshOp};

type Result<T> = gonc_types::NcResult<T>;

#[derive(Debug, Clone)]
pub(crate) enum HostKeyPolicy {
    /// Accept any key the gateway presents. Insecure; the user opted out.
    AcceptAll,
    /// Verify against a known-hosts file.
    KnownHosts { path: PathBuf },
}

impl HostKeyPolicy {
    pub(crate) fn from_config(cfg: &GatewayConfig) -> Result<Self> {
        if !cfg.strict_host_key {
            warn!("host key verification disabled; use --strict-hostkey to enable it");
            return Ok(HostKeyPolicy::AcceptAll);
        }
        let path = match &cfg.known_hosts_path {
            Some(path) => path.clone(),
            None => dirs::home_dir()
                .ok_or_else(|| NcError::other("locating home directory for known_hosts"))?
                .join(".ssh")
                .join("known_hosts"),
        };
        Ok(HostKeyPolicy::KnownHosts { path })
    }
}

/// Check a presented server key against the policy. A changed key is
/// reported as [`NcError::HostKeyMismatch`]; an unknown host fails with an
/// instruction to add the key.
pub(crate) fn verify(
    policy: &HostKeyPolicy,
    host: &str,
    port: u16,
    key: &PublicKey,
) -> Result<bool> {
    match policy {
        HostKeyPolicy::AcceptAll => {
            debug!(%host, port, "accepting host key without verification");
            Ok(true)
        }
        HostKeyPolicy::KnownHosts { path } => {
            match keys::check_known_hosts_path(host, port, key, path) {
                Ok(true) => {
                    debug!(%host, port, "host key verified against {}", path.display());
                    Ok(true)
                }
                Ok(false) => Err(NcError::ssh(
                    SshOp::Hostkey,
                    host,
                    port,
                    format!(
                        "no entry in {}; presented key is {}",
                        path.display(),
                        key.fingerprint(HashAlg::Sha256)
                    ),
                )),
                Err(keys::Error::KeyChanged { line }) => Err(NcError::HostKeyMismatch(format!(
                    "{host}:{port} presented {} which contradicts {} line {line}",
                    key.fingerprint(HashAlg::Sha256),
                    path.display()
                ))),
                Err(err) => Err(NcError::ssh(SshOp::Hostkey, host, port, err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relaxed_config_accepts_everything() {
        let cfg = GatewayConfig::new("user", "gw", 22);
        let policy = HostKeyPolicy::from_config(&cfg).unwrap();
        assert!(matches!(policy, HostKeyPolicy::AcceptAll));
    }

    #[test]
    fn strict_config_uses_supplied_known_hosts_path() {
        let mut cfg = GatewayConfig::new("user", "gw", 22);
        cfg.strict_host_key = true;
        cfg.known_hosts_path = Some(PathBuf::from("/tmp/kh"));
        let policy = HostKeyPolicy::from_config(&cfg).unwrap();
        match policy {
            HostKeyPolicy::KnownHosts { path } => assert_eq!(path, PathBuf::from("/tmp/kh")),
            other => panic!("unexpected policy: {other:?}"),
        }
    }
}
