//! # Single-Connection Client
//!
//! Purpose: Run one job at a time over one connection, with no pipelining
//! across calls. Used on its own and as the unit the rental pool leases.
//!
//! ## Design Principles
//! 1. **Exclusive Borrow**: Every operation takes `&mut self`, so at most one
//!    job is ever in flight on the socket.
//! 2. **Retry Only When Safe**: A write that sent nothing is retried on a
//!    fresh connection (bounded by `send_attempts`); anything else surfaces
//!    immediately.
//! 3. **Lazy Recovery**: A connection that failed mid-read is dropped and
//!    redialed by the next call instead of being reused half-synchronized.

use std::future::Future;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cmd::{Arg, Cmd};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::job::Job;
use crate::net;
use crate::resp::{Reply, ReplyReader};
use crate::status::{StatusEvent, StatusHandler, StatusSink};

struct Connection<R = OwnedReadHalf, W = OwnedWriteHalf> {
    reader: ReplyReader<R>,
    writer: W,
}

/// Synchronous (one job at a time) client over a single connection.
pub struct SyncedClient {
    config: Arc<ClientConfig>,
    id: usize,
    conn: Option<Connection>,
    status: StatusSink,
    quit: bool,
}

impl SyncedClient {
    /// Dials the server and starts a status consumer for `handler`.
    pub async fn connect(config: ClientConfig, handler: Option<StatusHandler>) -> ClientResult<Self> {
        let (status, _consumer) = StatusSink::spawn(handler, config.queue_capacity());
        Self::with_sink(Arc::new(config), 0, status).await
    }

    pub(crate) async fn with_sink(config: Arc<ClientConfig>, id: usize, status: StatusSink) -> ClientResult<Self> {
        let conn = dial_connection(config.clone(), id).await?;
        status.report(StatusEvent::Connected { conn: id });
        Ok(SyncedClient {
            config,
            id,
            conn: Some(conn),
            status,
            quit: false,
        })
    }

    /// Executes one command and returns its reply.
    ///
    /// Error replies are returned as `Reply::Error`, not as `Err`.
    pub async fn command(&mut self, cmd: &Cmd, args: impl IntoIterator<Item = Arg>) -> ClientResult<Reply> {
        let job = self.execute(Job::command(cmd, args)?).await;
        let mut replies = job.into_result()?;
        replies
            .pop()
            .ok_or_else(|| ClientError::protocol("no reply for command"))
    }

    /// Executes a pipelined batch and returns one reply per command.
    pub async fn commands(&mut self, args: impl IntoIterator<Item = Arg>) -> ClientResult<Vec<Reply>> {
        self.execute(Job::pipeline(args)?).await.into_result()
    }

    /// Sends a job and reads all of its replies, returning the finished job.
    pub async fn execute(&mut self, mut job: Job) -> Job {
        if self.quit {
            job.set_error(ClientError::AlreadyClosed);
            return job;
        }
        match self.send_with_retry(&job).await {
            Ok(()) => self.read_replies(&mut job).await,
            Err(err) => {
                self.status
                    .report(StatusEvent::job_failure(self.id, err.clone(), job.debug_string()));
                job.set_error(err);
            }
        }
        job
    }

    /// Sends `QUIT` and closes the connection. A second call reports
    /// [`ClientError::AlreadyQuit`].
    pub async fn quit(&mut self) -> ClientResult<()> {
        if self.quit {
            return Err(ClientError::AlreadyQuit);
        }
        self.quit = true;
        if let Some(mut conn) = self.conn.take() {
            net::send_quit(&mut conn.writer, self.config.write_timeout).await;
        }
        debug!(conn = self.id, "client quit");
        Ok(())
    }

    /// Identifier used in status events.
    pub fn id(&self) -> usize {
        self.id
    }

    async fn send_with_retry(&mut self, job: &Job) -> ClientResult<()> {
        let config = self.config.clone();
        let id = self.id;
        send_retrying(&mut self.conn, job.payload(), &self.config, id, &self.status, || {
            dial_connection(config.clone(), id)
        })
        .await
    }

    async fn read_replies(&mut self, job: &mut Job) {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => {
                job.set_error(ClientError::AlreadyClosed);
                return;
            }
        };

        let mut replies = Vec::with_capacity(job.command_count());
        for index in 0..job.command_count() {
            let next = match self.config.read_timeout {
                Some(limit) => match timeout(limit, conn.reader.next_reply()).await {
                    Ok(result) => result,
                    Err(_) => {
                        conn.reader.mark_closed();
                        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read deadline elapsed").into())
                    }
                },
                None => conn.reader.next_reply().await,
            };
            match next {
                Ok(reply) => replies.push(reply),
                Err(err) => {
                    let err = ClientError::Read {
                        index,
                        source: Box::new(err),
                    };
                    // Replies of this job may still be in the socket; start over next time.
                    self.conn = None;
                    self.status
                        .report(StatusEvent::job_failure(self.id, err.clone(), job.debug_string()));
                    job.set_error(err);
                    return;
                }
            }
        }
        job.set_replies(replies);
    }
}

async fn dial_connection(config: Arc<ClientConfig>, id: usize) -> ClientResult<Connection> {
    let (reader, writer) = net::dial(&config, id).await?;
    Ok(Connection { reader, writer })
}

/// Writes `payload`, replacing the connection through `redial` each time
/// nothing at all was written, for at most `send_attempts` writes.
///
/// Any other failure drops the connection and is returned as is.
async fn send_retrying<R, W, D, Fut>(
    conn: &mut Option<Connection<R, W>>,
    payload: &[u8],
    config: &ClientConfig,
    id: usize,
    status: &StatusSink,
    mut redial: D,
) -> ClientResult<()>
where
    W: AsyncWrite + Unpin,
    D: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<Connection<R, W>>>,
{
    let attempts = config.send_attempts.max(1);
    let mut failures = 0;
    loop {
        if conn.is_none() {
            *conn = Some(redial().await?);
            status.report(StatusEvent::Reconnected { conn: id });
        }
        let Some(link) = conn.as_mut() else {
            return Err(ClientError::AlreadyClosed);
        };
        match net::send(&mut link.writer, payload, config.write_timeout).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_nothing_sent() => {
                // Nothing left the client; the connection is presumed stale.
                failures += 1;
                *conn = None;
                status.report(StatusEvent::failure(Some(id), err.clone()));
                if failures >= attempts {
                    return Err(err);
                }
                warn!(conn = id, failures, "nothing sent, redialing");
            }
            Err(err) => {
                *conn = None;
                return Err(err);
            }
        }
    }
}
