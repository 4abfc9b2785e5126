//! A session binds an established connection to its I/O endpoints.
//! Behaviors operate on sessions rather than raw sockets, so tests can
//! substitute buffers for the process's standard streams.

use tokio::io::{AsyncRead, AsyncWrite};

use gonc_core::transport::Connection;

pub type SessionInput = Box<dyn AsyncRead + Send + Unpin>;
pub type SessionOutput = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Session {
    pub conn: Connection,
    pub stdin: SessionInput,
    pub stdout: SessionOutput,
}

impl Session {
    pub fn new(conn: Connection, stdin: SessionInput, stdout: SessionOutput) -> Self {
        Session {
            conn,
            stdin,
            stdout,
        }
    }

    /// Bind the connection to the process's standard streams.
    pub fn stdio(conn: Connection) -> Self {
        Session::new(
            conn,
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
        )
    }
}
