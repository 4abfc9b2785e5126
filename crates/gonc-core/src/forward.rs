//! Full-duplex byte forwarding between two connections, with cancellation
//! and per-direction byte accounting.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::pool;
use gonc_types::NcError;

type Result<T> = gonc_types::NcResult<T>;

/// Copy `a -> b` and `b -> a` concurrently until one direction ends or the
/// token is cancelled, then close both sides and await the other direction.
/// Returns the `(a_to_b, b_to_a)` byte counts.
pub async fn bridge<A, B>(token: &CancellationToken, a: A, b: B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let cancel = token.child_token();
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome = copy_direction(&cancel, &mut a_read, &mut b_write).await;
            let _ = b_write.shutdown().await;
            cancel.cancel();
            outcome
        })
    };
    let b_to_a = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome = copy_direction(&cancel, &mut b_read, &mut a_write).await;
            let _ = a_write.shutdown().await;
            cancel.cancel();
            outcome
        })
    };

    let (forward, backward) = (join(a_to_b).await?, join(b_to_a).await?);
    surface_error(forward.1)?;
    surface_error(backward.1)?;
    Ok((forward.0, backward.0))
}

/// Copy between a connection and a local input/output pair, the interactive
/// and pipe mode of the tool.
///
/// The `stdin -> conn` direction half-closes the connection's write side on
/// clean EOF (typical of finite piped input) so the remote can detect
/// end-of-input, while `conn -> stdout` keeps draining the response. The
/// whole relay ends when the connection side ends or the token is cancelled.
pub async fn relay<C, I, O>(token: &CancellationToken, conn: C, stdin: I, stdout: O) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Send + Unpin + 'static,
{
    let cancel = token.child_token();
    let (mut conn_read, mut conn_write) = tokio::io::split(conn);
    let mut stdin = stdin;
    let mut stdout = stdout;

    let net_to_out = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome = copy_direction(&cancel, &mut conn_read, &mut stdout).await;
            cancel.cancel();
            outcome
        })
    };
    let in_to_net = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome = copy_direction(&cancel, &mut stdin, &mut conn_write).await;
            let _ = conn_write.shutdown().await;
            // A clean local EOF must not tear down the connection before the
            // remote finishes sending.
            if outcome.1.is_some() {
                cancel.cancel();
            }
            outcome
        })
    };

    let (received, sent) = (join(net_to_out).await?, join(in_to_net).await?);
    surface_error(received.1)?;
    surface_error(sent.1)?;
    Ok(())
}

/// One copy direction. Returns the byte count and the error that ended the
/// loop, if any; cancellation and clean EOF both end it without error.
async fn copy_direction<R, W>(
    cancel: &CancellationToken,
    reader: &mut R,
    writer: &mut W,
) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool::buffer();
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return (total, None),
            res = reader.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => return (total, Some(err)),
            },
        };
        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        let res = tokio::select! {
            _ = cancel.cancelled() => return (total, None),
            res = write => res,
        };
        match res {
            Ok(()) => total += n as u64,
            Err(err) => return (total, Some(err)),
        }
    }
    (total, None)
}

async fn join(handle: tokio::task::JoinHandle<(u64, Option<io::Error>)>) -> Result<(u64, Option<io::Error>)> {
    handle
        .await
        .map_err(|err| NcError::other(format!("forwarder task failed: {err}")))
}

fn surface_error(err: Option<io::Error>) -> Result<()> {
    match err {
        Some(err) if !is_harmless(&err) => Err(NcError::Io(err)),
        _ => Ok(()),
    }
}

/// Errors that are expected during shutdown of one side.
fn is_harmless(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
