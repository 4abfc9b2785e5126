//! What happens over an established connection: relay bytes to the local
//! I/O endpoints, or wire the socket to a child process's stdio.

use std::{process::Stdio, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, WriteHalf},
    process::Command,
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::Session;
use gonc_core::{forward, pool, transport::Connection};
use gonc_types::NcError;

type Result<T> = gonc_types::NcResult<T>;

/// Per-connection behavior, chosen once from the configuration.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Copy between the connection and the session's stdin/stdout.
    Relay,
    /// Execute a program (`-e`) or shell command (`-c`) with its stdio
    /// bound to the connection.
    Exec {
        program: Option<String>,
        command: Option<String>,
    },
}

impl Behavior {
    pub fn from_config(cfg: &gonc_types::Config) -> Behavior {
        if cfg.execute.is_some() || cfg.command.is_some() {
            Behavior::Exec {
                program: cfg.execute.clone(),
                command: cfg.command.clone(),
            }
        } else {
            Behavior::Relay
        }
    }

    /// Run the behavior until the connection is done or the token fires.
    pub async fn handle(&self, token: &CancellationToken, session: Session) -> Result<()> {
        match self {
            Behavior::Relay => {
                forward::relay(token, session.conn, session.stdin, session.stdout).await
            }
            Behavior::Exec { program, command } => {
                run_exec(token, session.conn, program.as_deref(), command.as_deref()).await
            }
        }
    }
}

async fn run_exec(
    token: &CancellationToken,
    conn: Connection,
    program: Option<&str>,
    command: Option<&str>,
) -> Result<()> {
    let mut cmd = if let Some(command) = command {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd.exe");
            cmd.arg("/C");
            cmd
        } else {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c");
            cmd
        };
        cmd.arg(command);
        cmd
    } else if let Some(program) = program {
        Command::new(program)
    } else {
        return Err(NcError::other("no command specified for exec mode"));
    };

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(?cmd, "exec");
    let mut child = cmd
        .spawn()
        .map_err(|err| NcError::other(format!("exec: {err}")))?;
    let mut child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| NcError::other("child stdin unavailable"))?;
    let child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| NcError::other("child stdout unavailable"))?;
    let child_stderr = child
        .stderr
        .take()
        .ok_or_else(|| NcError::other("child stderr unavailable"))?;

    let (mut conn_read, conn_write) = tokio::io::split(conn);
    let shared_write = Arc::new(Mutex::new(conn_write));

    // conn -> child stdin, stopped explicitly once the child exits.
    let input_cancel = token.child_token();
    let input_task = {
        let cancel = input_cancel.clone();
        tokio::spawn(async move {
            let mut buf = pool::buffer();
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = conn_read.read(&mut buf) => match res {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    },
                };
                if child_stdin.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            // Dropping stdin delivers EOF to the child.
            let _ = child_stdin.shutdown().await;
        })
    };
    // child stdout/stderr -> conn; these end at EOF when the child exits.
    let stdout_task = tokio::spawn(pump_to_conn(child_stdout, shared_write.clone()));
    let stderr_task = tokio::spawn(pump_to_conn(child_stderr, shared_write.clone()));

    let exited = tokio::select! {
        _ = token.cancelled() => None,
        status = child.wait() => Some(status),
    };
    let Some(status) = exited else {
        let _ = child.kill().await;
        input_cancel.cancel();
        input_task.abort();
        stdout_task.abort();
        stderr_task.abort();
        return Err(NcError::Cancelled);
    };
    let status = status.map_err(|err| NcError::other(format!("waiting for child: {err}")))?;

    input_cancel.cancel();
    let _ = input_task.await;
    // Let the output pumps flush whatever the child wrote before exiting.
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    {
        let mut writer = shared_write.lock().await;
        let _ = writer.shutdown().await;
    }

    if !status.success() {
        return Err(NcError::other(format!("child exited with {status}")));
    }
    Ok(())
}

async fn pump_to_conn<R>(mut reader: R, writer: Arc<Mutex<WriteHalf<Connection>>>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = pool::buffer();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let mut writer = writer.lock().await;
        if writer.write_all(&buf[..n]).await.is_err() {
            return;
        }
        let _ = writer.flush().await;
    }
}
