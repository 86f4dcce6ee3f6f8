//! # Transport
//!
//! Purpose: Dial keep-alive TCP connections with a bounded retry policy and
//! write request bytes under a per-attempt deadline, telling apart writes
//! that never started from writes that broke half-way.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::resp::ReplyReader;

/// Read side of a dialed connection.
pub(crate) type ReadSide = ReplyReader<OwnedReadHalf>;

/// Dials the configured server, retrying with a fixed pause.
pub(crate) async fn dial(config: &ClientConfig, conn: usize) -> ClientResult<(ReadSide, OwnedWriteHalf)> {
    let addr = config.addr();
    let attempts = config.dial_attempts.max(1);
    let mut last_err = io::Error::new(io::ErrorKind::Other, "no dial attempt made");

    for attempt in 1..=attempts {
        match timeout(config.dial_timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => {
                configure(&stream, config)?;
                if config.password.is_some() {
                    debug!(conn, "password configured but AUTH is not sent");
                }
                debug!(conn, attempt, %addr, "connected");
                let (read, write) = stream.into_split();
                return Ok((ReplyReader::new(read), write));
            }
            Ok(Err(err)) => last_err = err,
            Err(_) => last_err = io::Error::new(io::ErrorKind::TimedOut, "dial timed out"),
        }
        warn!(conn, attempt, %addr, error = %last_err, "dial failed");
        if attempt < attempts {
            sleep(config.dial_retry_delay).await;
        }
    }

    Err(ClientError::Connect {
        addr,
        attempts,
        source: Arc::new(last_err),
    })
}

fn configure(stream: &TcpStream, config: &ClientConfig) -> io::Result<()> {
    // Disable Nagle to keep request latency low for small payloads.
    stream.set_nodelay(true)?;
    // Keep-alive makes a dead peer eventually fail pending reads and writes.
    let keepalive = TcpKeepalive::new().with_time(config.keepalive);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Writes `payload` fully before an absolute deadline.
///
/// Fails with [`ClientError::NothingSent`] when no byte was written and with
/// [`ClientError::PartialSend`] otherwise.
pub(crate) async fn send<W>(writer: &mut W, payload: &[u8], deadline: Duration) -> ClientResult<()>
where
    W: AsyncWrite + Unpin,
{
    let deadline = Instant::now() + deadline;
    let mut written = 0;

    while written < payload.len() {
        let result: io::Result<()> = match timeout_at(deadline, writer.write(&payload[written..])).await {
            Ok(Ok(0)) => Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes")),
            Ok(Ok(n)) => {
                written += n;
                continue;
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline elapsed")),
        };
        if let Err(err) = result {
            return Err(send_error(written, payload.len(), err));
        }
    }

    match timeout_at(deadline, writer.flush()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(send_error(written, payload.len(), err)),
        Err(_) => Err(send_error(
            written,
            payload.len(),
            io::Error::new(io::ErrorKind::TimedOut, "flush deadline elapsed"),
        )),
    }
}

fn send_error(written: usize, total: usize, err: io::Error) -> ClientError {
    if written == 0 {
        ClientError::NothingSent(Arc::new(err))
    } else {
        ClientError::PartialSend {
            written,
            total,
            source: Arc::new(err),
        }
    }
}

/// Best-effort `QUIT` on shutdown; the reply is never read.
pub(crate) async fn send_quit<W>(writer: &mut W, deadline: Duration)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = send(writer, &crate::cmd::QUIT_REQUEST, deadline).await {
        debug!(error = %err, "QUIT not delivered");
    }
    let _ = timeout(deadline, writer.shutdown()).await;
}
