//! SSH authentication: building the ordered method list and driving the
//! attempts against the gateway.
//!
//! The build order is contractually fixed because many servers only try
//! methods in the order the client advertises: explicit key, agent,
//! interactive password, default probing, then the keyboard-interactive
//! fallback required by anonymous public tunnel services.

use std::{path::Path, sync::Arc};

use russh::{
    MethodSet,
    client::{AuthResult, KeyboardInteractiveAuthResponse},
    keys::{self, HashAlg, PrivateKeyWithHashAlg},
};
use secrecy::{ExposeSecret, SecretString};
use tokio::task;
use tracing::{debug, info, warn};

use crate::{config::GatewayConfig, gateway::GatewayHandler};
use gonc_types::{NcError, SshOp};

type Result<T> = gonc_types::NcResult<T>;
type SessionHandle = russh::client::Handle<GatewayHandler>;

/// One authentication attempt, in advertisement order.
pub(crate) enum AuthMethod {
    Key(Arc<keys::PrivateKey>),
    Agent,
    Password(SecretString),
    /// Keyboard-interactive answering every challenge with an empty string.
    KeyboardInteractiveEmpty,
}

impl AuthMethod {
    fn label(&self) -> &'static str {
        match self {
            AuthMethod::Key(_) => "publickey",
            AuthMethod::Agent => "agent",
            AuthMethod::Password(_) => "password",
            AuthMethod::KeyboardInteractiveEmpty => "keyboard-interactive",
        }
    }
}

/// Assemble the ordered list of authentication methods for `cfg`. Fails
/// when nothing is available, naming the flags that would fix it.
pub(crate) async fn build_auth_methods(cfg: &GatewayConfig) -> Result<Vec<AuthMethod>> {
    let mut methods = Vec::new();

    if let Some(path) = &cfg.key_path {
        let key = load_private_key(path, true).await?;
        methods.push(AuthMethod::Key(Arc::new(key)));
    }

    if cfg.use_agent {
        probe_agent().await?;
        methods.push(AuthMethod::Agent);
    }

    if cfg.prompt_password {
        let password = prompt_secret("SSH password: ".to_string()).await?;
        methods.push(AuthMethod::Password(password));
    }

    if methods.is_empty() {
        methods = default_methods().await;
    }

    if cfg.allow_keyboard_interactive {
        methods.push(AuthMethod::KeyboardInteractiveEmpty);
    }

    if methods.is_empty() {
        return Err(NcError::AuthFailed(
            "no SSH authentication methods available - use --ssh-key, --ssh-password, or --ssh-agent"
                .to_string(),
        ));
    }

    Ok(methods)
}

/// Try each method in order until the gateway accepts one.
pub(crate) async fn authenticate(
    handle: &mut SessionHandle,
    cfg: &GatewayConfig,
    methods: Vec<AuthMethod>,
) -> Result<()> {
    let rsa_hint = handle.best_supported_rsa_hash().await.unwrap_or(None).flatten();

    for method in methods {
        let label = method.label();
        let outcome = match method {
            AuthMethod::Key(key) => {
                let hash_alg = if matches!(key.algorithm(), keys::Algorithm::Rsa { .. }) {
                    rsa_hint
                } else {
                    None
                };
                handle
                    .authenticate_publickey(
                        cfg.user.clone(),
                        PrivateKeyWithHashAlg::new(key, hash_alg),
                    )
                    .await
                    .map_err(|err| auth_err(cfg, err))
            }
            AuthMethod::Agent => authenticate_via_agent(handle, &cfg.user, rsa_hint).await,
            AuthMethod::Password(password) => handle
                .authenticate_password(cfg.user.clone(), password.expose_secret().to_string())
                .await
                .map_err(|err| auth_err(cfg, err)),
            AuthMethod::KeyboardInteractiveEmpty => {
                authenticate_keyboard_interactive(handle, cfg).await
            }
        };

        match outcome {
            Ok(result) if result.success() => {
                info!(method = label, "authentication succeeded");
                return Ok(());
            }
            Ok(_) => warn!(method = label, "authentication rejected by gateway"),
            Err(err) => warn!(method = label, error = %err, "authentication attempt failed"),
        }
    }

    Err(NcError::AuthFailed(
        "all authentication methods were rejected by the gateway".to_string(),
    ))
}

fn auth_err(cfg: &GatewayConfig, err: russh::Error) -> NcError {
    NcError::ssh(SshOp::Auth, &cfg.host, cfg.port, err)
}

async fn load_private_key(path: &Path, prompt_if_encrypted: bool) -> Result<keys::PrivateKey> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| NcError::AuthFailed(format!("reading key {}: {err}", path.display())))?;
    match keys::decode_secret_key(&data, None) {
        Ok(key) => Ok(key),
        Err(keys::Error::KeyIsEncrypted) if prompt_if_encrypted => {
            let passphrase =
                prompt_secret(format!("Enter passphrase for {}: ", path.display())).await?;
            keys::decode_secret_key(&data, Some(passphrase.expose_secret())).map_err(|err| {
                NcError::AuthFailed(format!("decrypting key {}: {err}", path.display()))
            })
        }
        Err(err) => Err(NcError::AuthFailed(format!(
            "parsing key {}: {err}",
            path.display()
        ))),
    }
}

/// Default probing when no method was configured: the agent when reachable,
/// then the common key files that exist and parse without a passphrase.
async fn default_methods() -> Vec<AuthMethod> {
    let mut out = Vec::new();
    if probe_agent().await.is_ok() {
        out.push(AuthMethod::Agent);
    }
    if let Some(home) = dirs::home_dir() {
        for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
            let path = home.join(".ssh").join(name);
            if !path.exists() {
                continue;
            }
            if let Ok(key) = load_private_key(&path, false).await {
                out.push(AuthMethod::Key(Arc::new(key)));
            }
        }
    }
    out
}

/// Prompt on the controlling terminal with echo disabled.
async fn prompt_secret(prompt: String) -> Result<SecretString> {
    task::spawn_blocking(move || {
        rpassword::prompt_password(prompt)
            .map(|s| SecretString::new(s.into_boxed_str()))
            .map_err(|err| NcError::AuthFailed(format!("reading secret: {err}")))
    })
    .await
    .map_err(|err| NcError::other(format!("prompt task failed: {err}")))?
}

/// Check that an SSH agent endpoint is reachable before advertising it.
async fn probe_agent() -> Result<()> {
    #[cfg(unix)]
    {
        let sock = std::env::var("SSH_AUTH_SOCK").map_err(|_| {
            NcError::AuthFailed("SSH agent not available (SSH_AUTH_SOCK not set)".to_string())
        })?;
        tokio::net::UnixStream::connect(&sock)
            .await
            .map_err(|err| NcError::AuthFailed(format!("connecting to SSH agent: {err}")))?;
        Ok(())
    }
    #[cfg(windows)]
    {
        let pipe = agent_pipe_path();
        tokio::net::windows::named_pipe::ClientOptions::new()
            .open(&pipe)
            .map_err(|err| {
                NcError::AuthFailed(format!("connecting to Windows SSH agent at {pipe}: {err}"))
            })?;
        Ok(())
    }
    #[cfg(not(any(unix, windows)))]
    {
        Err(NcError::AuthFailed(
            "SSH agent is not supported on this platform".to_string(),
        ))
    }
}

#[cfg(windows)]
fn agent_pipe_path() -> String {
    std::env::var("SSH_AUTH_SOCK").unwrap_or_else(|_| r"\\.\pipe\openssh-ssh-agent".to_string())
}

async fn authenticate_via_agent(
    handle: &mut SessionHandle,
    user: &str,
    rsa_hint: Option<HashAlg>,
) -> Result<AuthResult> {
    #[cfg(unix)]
    let stream = {
        let sock = std::env::var("SSH_AUTH_SOCK").map_err(|_| {
            NcError::AuthFailed("SSH agent not available (SSH_AUTH_SOCK not set)".to_string())
        })?;
        tokio::net::UnixStream::connect(&sock)
            .await
            .map_err(|err| NcError::AuthFailed(format!("connecting to SSH agent: {err}")))?
    };
    #[cfg(windows)]
    let stream = {
        let pipe = agent_pipe_path();
        tokio::net::windows::named_pipe::ClientOptions::new()
            .open(&pipe)
            .map_err(|err| {
                NcError::AuthFailed(format!("connecting to Windows SSH agent at {pipe}: {err}"))
            })?
    };
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (handle, user, rsa_hint);
        return Ok(AuthResult::Failure {
            remaining_methods: MethodSet::empty(),
            partial_success: false,
        });
    }

    #[cfg(any(unix, windows))]
    {
        let mut agent = keys::agent::client::AgentClient::connect(stream);
        let mut identities = agent
            .request_identities()
            .await
            .map_err(|err| NcError::AuthFailed(format!("listing agent identities: {err}")))?;
        if identities.is_empty() {
            return Err(NcError::AuthFailed("SSH agent has no loaded keys".to_string()));
        }
        debug!(count = identities.len(), "attempting agent authentication");

        for key in identities.drain(..) {
            let hash_alg = match key.algorithm() {
                keys::Algorithm::Rsa { .. } => rsa_hint,
                _ => None,
            };
            match handle
                .authenticate_publickey_with(user.to_string(), key, hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(result),
                Ok(_) => continue,
                Err(err) => warn!(error = %err, "agent authentication attempt failed"),
            }
        }

        Ok(AuthResult::Failure {
            remaining_methods: MethodSet::empty(),
            partial_success: false,
        })
    }
}

async fn authenticate_keyboard_interactive(
    handle: &mut SessionHandle,
    cfg: &GatewayConfig,
) -> Result<AuthResult> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(cfg.user.clone(), Option::<String>::None)
        .await
        .map_err(|err| auth_err(cfg, err))?;

    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(AuthResult::Success),
            KeyboardInteractiveAuthResponse::Failure {
                remaining_methods,
                partial_success,
            } => {
                return Ok(AuthResult::Failure {
                    remaining_methods,
                    partial_success,
                });
            }
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                // Empty answer for each challenge, the anonymous-service flow.
                let answers = vec![String::new(); prompts.len()];
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(|err| auth_err(cfg, err))?;
            }
        }
    }
}

/// The current OS username, matching the ssh command's default when no
/// `user@` prefix is given. Windows `DOMAIN\user` values are stripped to
/// the bare user; environment variables are the fallback.
pub fn default_username() -> String {
    let name = whoami::username();
    let name = match name.rsplit_once('\\') {
        Some((_, bare)) => bare.to_string(),
        None => name,
    };
    if !name.is_empty() {
        return name;
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}
