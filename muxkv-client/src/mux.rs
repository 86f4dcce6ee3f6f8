//! # Multiplexed Client
//!
//! Purpose: Pipeline jobs from many callers over a fixed set of
//! connections. Each connection runs a writer task and a reader task; the
//! writer never waits for replies, which is what makes pipelining work.
//!
//! ## Design Principles
//! 1. **Shared Dispatch Queue**: One bounded MPMC queue feeds every writer;
//!    whichever writer is free takes the next job (no caller affinity).
//! 2. **Order by Construction**: Per connection, the writer pushes written
//!    jobs into an ordered in-flight queue and the reader pairs replies with
//!    jobs in that same order, so no request IDs are needed.
//! 3. **Failure Stays Local**: Send and read failures end one connection;
//!    siblings keep serving.
//! 4. **Actor Shutdown**: A supervisor task owns the connection tasks;
//!    `quit` only flips an atomic flag and asks the supervisor.
//!
//! ## Structure Overview
//!
//! ```text
//! callers ──► dispatch queue (async_channel, MPMC)
//!                 ├──► writer 0 ──► socket 0 ─┐
//!                 │       └──► in-flight 0 ──► reader 0 ◄─┘ ──► job done
//!                 └──► writer N ... (same shape)
//! supervisor: stop signals, joins, post-shutdown drain
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cmd::{Arg, Cmd};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::job::{Job, Submission};
use crate::net::{self, ReadSide};
use crate::resp::Reply;
use crate::status::{StatusEvent, StatusHandler, StatusSink};

/// Pipelining client over `config.connections` connections.
pub struct MuxClient {
    jobs: async_channel::Sender<Submission>,
    quit_tx: mpsc::Sender<oneshot::Sender<()>>,
    quitting: AtomicBool,
    connections: usize,
}

impl MuxClient {
    /// Dials every connection and starts its writer/reader pair.
    ///
    /// If any connection cannot be dialed, the ones already started are shut
    /// down and the connect error is returned.
    pub async fn connect(config: ClientConfig, handler: Option<StatusHandler>) -> ClientResult<Self> {
        let config = Arc::new(config);
        let capacity = config.queue_capacity();
        let (status, _consumer) = StatusSink::spawn(handler, capacity);
        let (jobs_tx, jobs_rx) = async_channel::bounded(capacity);
        let count = config.connections.max(1);

        let mut tasks = JoinSet::new();
        let mut stops = Vec::with_capacity(count);
        for id in 0..count {
            match net::dial(&config, id).await {
                Ok((reader, writer)) => {
                    let (stop_tx, stop_rx) = oneshot::channel();
                    let conn = Connection::start(id, config.clone(), jobs_rx.clone(), status.clone(), reader, writer);
                    tasks.spawn(conn.run(stop_rx));
                    stops.push(stop_tx);
                    status.report(StatusEvent::Connected { conn: id });
                }
                Err(err) => {
                    status.report(StatusEvent::failure(Some(id), err.clone()));
                    stop_all(stops, &mut tasks).await;
                    return Err(err);
                }
            }
        }

        let (quit_tx, quit_rx) = mpsc::channel(1);
        tokio::spawn(supervise(tasks, stops, jobs_rx, quit_rx, status));
        info!(connections = count, addr = %config.addr(), "multiplexed client ready");

        Ok(MuxClient {
            jobs: jobs_tx,
            quit_tx,
            quitting: AtomicBool::new(false),
            connections: count,
        })
    }

    /// Executes one command and returns its reply.
    pub async fn command(&self, cmd: &Cmd, args: impl IntoIterator<Item = Arg>) -> ClientResult<Reply> {
        let job = self.execute(Job::command(cmd, args)?).await;
        let mut replies = job.into_result()?;
        replies
            .pop()
            .ok_or_else(|| ClientError::protocol("no reply for command"))
    }

    /// Executes a pipelined batch and returns one reply per command.
    pub async fn commands(&self, args: impl IntoIterator<Item = Arg>) -> ClientResult<Vec<Reply>> {
        self.execute(Job::pipeline(args)?).await.into_result()
    }

    /// Queues a job and waits for it to finish.
    pub async fn execute(&self, job: Job) -> Job {
        let (submission, done) = Submission::new(job);
        if let Err(async_channel::SendError(submission)) = self.jobs.send(submission).await {
            submission.fail(ClientError::AlreadyClosed);
        }
        match done.await {
            Ok(job) => job,
            Err(_) => {
                let mut job = Job::empty();
                job.set_error(ClientError::AlreadyClosed);
                job
            }
        }
    }

    /// Shuts every connection down and waits for them.
    ///
    /// Only the first call does anything; later calls return
    /// [`ClientError::AlreadyQuit`] immediately.
    pub async fn quit(&self) -> ClientResult<()> {
        if self.quitting.swap(true, Ordering::AcqRel) {
            return Err(ClientError::AlreadyQuit);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.quit_tx
            .send(done_tx)
            .await
            .map_err(|_| ClientError::AlreadyQuit)?;
        done_rx.await.map_err(|_| ClientError::AlreadyQuit)
    }

    /// Number of connections the client was started with.
    pub fn connections(&self) -> usize {
        self.connections
    }
}

async fn supervise(
    mut tasks: JoinSet<()>,
    stops: Vec<oneshot::Sender<()>>,
    jobs: async_channel::Receiver<Submission>,
    mut quit_rx: mpsc::Receiver<oneshot::Sender<()>>,
    status: StatusSink,
) {
    let mut draining = false;
    // `None` means the client was dropped without an explicit quit.
    let request = loop {
        tokio::select! {
            request = quit_rx.recv() => break request,
            joined = tasks.join_next(), if !tasks.is_empty() => {
                if let Some(Err(err)) = joined {
                    warn!(error = %err, "connection task failed");
                }
                if tasks.is_empty() && !draining {
                    warn!("every connection stopped; queued jobs will fail");
                    spawn_drain(jobs.clone());
                    draining = true;
                }
            }
        }
    };

    status.report(StatusEvent::QuitStarted);
    stop_all(stops, &mut tasks).await;
    status.report(StatusEvent::QuitDone);
    if !draining {
        spawn_drain(jobs);
    }
    if let Some(done) = request {
        let _ = done.send(());
    }
}

async fn stop_all(stops: Vec<oneshot::Sender<()>>, tasks: &mut JoinSet<()>) {
    for stop in stops {
        // The connection may already have stopped on its own.
        let _ = stop.send(());
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "connection task failed");
        }
    }
}

/// Fails every job that reaches the dispatch queue after shutdown.
fn spawn_drain(jobs: async_channel::Receiver<Submission>) {
    tokio::spawn(async move {
        while let Ok(submission) = jobs.recv().await {
            submission.fail(ClientError::AlreadyClosed);
        }
    });
}

/// Writer side of one multiplexed connection; owns its reader task.
struct Connection {
    id: usize,
    config: Arc<ClientConfig>,
    jobs: async_channel::Receiver<Submission>,
    status: StatusSink,
    writer: OwnedWriteHalf,
    in_flight: mpsc::Sender<Submission>,
    reader: JoinHandle<()>,
    // Readers of replaced sockets, still draining what was sent on them.
    retired: Vec<JoinHandle<()>>,
}

impl Connection {
    fn start(
        id: usize,
        config: Arc<ClientConfig>,
        jobs: async_channel::Receiver<Submission>,
        status: StatusSink,
        reader: ReadSide,
        writer: OwnedWriteHalf,
    ) -> Self {
        let (in_flight, reader) = spawn_reader(id, &config, status.clone(), reader);
        Connection {
            id,
            config,
            jobs,
            status,
            writer,
            in_flight,
            reader,
            retired: Vec::new(),
        }
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let healthy = loop {
            let submission = tokio::select! {
                biased;
                _ = &mut stop => break true,
                next = self.jobs.recv() => match next {
                    Ok(submission) => submission,
                    Err(_) => break true,
                },
            };
            if let Err(err) = self.dispatch(submission).await {
                warn!(conn = self.id, error = %err, "connection failed, shutting it down");
                break false;
            }
        };
        self.shutdown(healthy).await;
    }

    /// Writes one job and hands it to the reader.
    ///
    /// `Err` means the connection can no longer be used.
    async fn dispatch(&mut self, submission: Submission) -> ClientResult<()> {
        if self.in_flight.is_closed() {
            // The reader saw the socket die; replace it before writing.
            debug!(conn = self.id, "reader gone, redialing before send");
            if let Err(err) = self.reconnect().await {
                self.report_job(&err, &submission);
                submission.fail(err.clone());
                return Err(err);
            }
        }

        let deadline = self.config.write_timeout;
        let sent = net::send(&mut self.writer, submission.job().payload(), deadline).await;
        match sent {
            Ok(()) => {
                self.hand_off(submission).await;
                Ok(())
            }
            Err(err) if err.is_nothing_sent() => {
                // Nothing went out: the connection is presumed stale.
                self.report_job(&err, &submission);
                if let Err(err) = self.reconnect().await {
                    self.report_job(&err, &submission);
                    submission.fail(err.clone());
                    return Err(err);
                }
                let resent = net::send(&mut self.writer, submission.job().payload(), deadline).await;
                match resent {
                    Ok(()) => {
                        self.hand_off(submission).await;
                        Ok(())
                    }
                    Err(err) => {
                        self.report_job(&err, &submission);
                        submission.fail(err.clone());
                        Err(err)
                    }
                }
            }
            Err(err) => {
                self.report_job(&err, &submission);
                submission.fail(err.clone());
                Err(err)
            }
        }
    }

    async fn hand_off(&mut self, submission: Submission) {
        if let Err(mpsc::error::SendError(submission)) = self.in_flight.send(submission).await {
            // The reader exited after the write; the reply is lost with the socket.
            let err = ClientError::Read {
                index: 0,
                source: Box::new(ClientError::Io(Arc::new(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before the reply was read",
                )))),
            };
            self.report_job(&err, &submission);
            submission.fail(err);
        }
    }

    async fn reconnect(&mut self) -> ClientResult<()> {
        let (reader, writer) = net::dial(&self.config, self.id).await?;
        let (in_flight, handle) = spawn_reader(self.id, &self.config, self.status.clone(), reader);
        // Dropping the old sender lets the old reader finish what it holds.
        self.in_flight = in_flight;
        self.writer = writer;
        self.retired.push(std::mem::replace(&mut self.reader, handle));
        self.retired.retain(|handle| !handle.is_finished());
        self.status.report(StatusEvent::Reconnected { conn: self.id });
        Ok(())
    }

    async fn shutdown(self, healthy: bool) {
        let Connection {
            id,
            config,
            status,
            mut writer,
            in_flight,
            reader,
            retired,
            ..
        } = self;
        debug!(conn = id, healthy, "connection shutting down");

        if healthy {
            net::send_quit(&mut writer, config.write_timeout).await;
        }
        // Closing the hand-off lets the reader drain and exit.
        drop(in_flight);
        drop(writer);

        for handle in retired {
            handle.abort();
        }
        if let Err(err) = reader.await {
            if !err.is_cancelled() {
                warn!(conn = id, error = %err, "reader task failed");
            }
        }

        debug!(conn = id, "connection stopped");
        status.report(StatusEvent::ConnectionStopped { conn: id });
    }

    fn report_job(&self, err: &ClientError, submission: &Submission) {
        self.status
            .report(StatusEvent::job_failure(self.id, err.clone(), submission.job().debug_string()));
    }
}

fn spawn_reader(
    id: usize,
    config: &ClientConfig,
    status: StatusSink,
    reader: ReadSide,
) -> (mpsc::Sender<Submission>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity());
    let handle = tokio::spawn(read_loop(id, reader, rx, status, config.read_timeout));
    (tx, handle)
}

async fn read_loop(
    id: usize,
    mut reader: ReadSide,
    mut in_flight: mpsc::Receiver<Submission>,
    status: StatusSink,
    read_timeout: Option<std::time::Duration>,
) {
    while let Some(mut submission) = in_flight.recv().await {
        let count = submission.job().command_count();
        match read_replies(&mut reader, count, read_timeout).await {
            Ok(replies) => {
                submission.job_mut().set_replies(replies);
                submission.complete();
            }
            Err(err) => {
                status.report(StatusEvent::job_failure(id, err.clone(), submission.job().debug_string()));
                submission.fail(err.clone());
                // The stream position is lost: nothing queued behind this job
                // can be matched to its reply any more.
                in_flight.close();
                while let Some(pending) = in_flight.recv().await {
                    pending.fail(err.clone());
                }
                break;
            }
        }
    }
    debug!(conn = id, "reader stopped");
}

async fn read_replies(
    reader: &mut ReadSide,
    count: usize,
    read_timeout: Option<std::time::Duration>,
) -> ClientResult<Vec<Reply>> {
    let mut replies = Vec::with_capacity(count);
    for index in 0..count {
        let next = match read_timeout {
            Some(limit) => match timeout(limit, reader.next_reply()).await {
                Ok(next) => next,
                Err(_) => {
                    reader.mark_closed();
                    Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read deadline elapsed").into())
                }
            },
            None => reader.next_reply().await,
        };
        match next {
            Ok(reply) => replies.push(reply),
            Err(err) => {
                return Err(ClientError::Read {
                    index,
                    source: Box::new(err),
                })
            }
        }
    }
    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{args, cmd};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::sleep;

    fn count_pings(chunk: &[u8]) -> usize {
        chunk.windows(4).filter(|w| *w == b"PING").count()
    }

    /// Drops `stream` with an RST instead of a FIN.
    fn reset(stream: TcpStream) {
        let _ = socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO));
        drop(stream);
    }

    /// Answers `+PONG` per `PING` until `stream` closes; a chunk containing
    /// `BIG` resets the connection instead.
    async fn serve_pings(mut stream: TcpStream) {
        let mut buf = vec![0u8; 4096];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                return;
            }
            if buf[..n].windows(3).any(|w| w == b"BIG") {
                reset(stream);
                return;
            }
            if stream.write_all(&b"+PONG\r\n".repeat(count_pings(&buf[..n]))).await.is_err() {
                return;
            }
        }
    }

    fn events() -> (StatusHandler, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Box::new(move |event| drop(tx.send(event))), rx)
    }

    async fn saw<F: Fn(&StatusEvent) -> bool>(events: &mut mpsc::UnboundedReceiver<StatusEvent>, pred: F) -> bool {
        let wait = async {
            while let Some(event) = events.recv().await {
                if pred(&event) {
                    return true;
                }
            }
            false
        };
        timeout(Duration::from_secs(2), wait).await.unwrap_or(false)
    }

    /// Answers `+PONG` for every `PING` seen; with `mute`, reads one chunk
    /// and hangs up without answering.
    async fn ping_server(mute: bool) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                if !mute {
                    tokio::spawn(serve_pings(stream));
                    continue;
                }
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                });
            }
        });
        port
    }

    fn config(port: u16) -> ClientConfig {
        let mut config = ClientConfig::new("127.0.0.1", port);
        config.dial_attempts = 1;
        config
    }

    #[tokio::test]
    async fn pipelined_batch_gets_every_reply() {
        let client = MuxClient::connect(config(ping_server(false).await), None).await.unwrap();
        let replies = client.commands(args![&cmd::PING, &cmd::PING, &cmd::PING]).await.unwrap();
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|reply| reply.to_text().unwrap() == "PONG"));
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn hang_up_fails_the_job_in_flight() {
        let client = MuxClient::connect(config(ping_server(true).await), None).await.unwrap();
        let err = client.command(&cmd::PING, args![]).await.unwrap_err();
        assert!(matches!(err, ClientError::Read { index: 0, .. }));
        assert!(err.is_fatal());
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_client_shuts_it_down() {
        let client = MuxClient::connect(config(ping_server(false).await), None).await.unwrap();
        let reply = client.command(&cmd::PING, args![]).await.unwrap();
        assert_eq!(reply.to_text().unwrap(), "PONG");
        drop(client);
    }

    #[tokio::test]
    async fn malformed_reply_fails_every_job_in_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // First connection: one garbled frame followed by a valid one,
            // both in a single write once two requests are pending.
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut pings = 0;
            while pings < 2 {
                let n = stream.read(&mut buf).await.unwrap();
                pings += count_pings(&buf[..n]);
            }
            stream.write_all(b"!bad\r\n:2\r\n").await.unwrap();
            tokio::spawn(async move {
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&b":3\r\n".repeat(count_pings(&buf[..n]))).await.is_err() {
                        break;
                    }
                }
            });
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_pings(stream));
            }
        });

        let client = MuxClient::connect(config(port), None).await.unwrap();
        let (first, second) = timeout(
            Duration::from_secs(2),
            async { tokio::join!(client.command(&cmd::PING, args![]), client.command(&cmd::PING, args![])) },
        )
        .await
        .expect("no job may hang after a malformed reply");

        match first {
            Err(ClientError::Read { index: 0, source }) => assert!(matches!(*source, ClientError::Protocol(_))),
            other => panic!("unexpected {:?}", other),
        }
        assert!(second.is_err(), "the reply after a garbled frame cannot be trusted");

        // The next job runs on a fresh connection and gets its own reply.
        let third = client.command(&cmd::PING, args![]).await.unwrap();
        assert_eq!(third.to_text().unwrap(), "PONG");
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn nothing_sent_redials_and_resends_the_same_job() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            reset(stream);
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_pings(stream));
            }
        });

        let (handler, mut seen) = events();
        let client = MuxClient::connect(config(port), Some(handler)).await.unwrap();
        // Let the reset reach the idle socket before anything is written.
        sleep(Duration::from_millis(100)).await;

        let reply = client.command(&cmd::PING, args![]).await.unwrap();
        assert_eq!(reply.to_text().unwrap(), "PONG");
        assert!(
            saw(&mut seen, |event| matches!(
                event,
                StatusEvent::Failure { error: ClientError::NothingSent(_), job: Some(_), .. }
            ))
            .await
        );
        assert!(saw(&mut seen, |event| matches!(event, StatusEvent::Reconnected { conn: 0 })).await);
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn partial_send_stops_only_its_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_pings(stream));
            }
        });

        let (handler, mut seen) = events();
        let mut config = config(port);
        config.connections = 2;
        let client = MuxClient::connect(config, Some(handler)).await.unwrap();

        // Far larger than the socket buffers, so the reset lands mid-write.
        let big = Job::command(&Cmd::new("BIG"), args![vec![b'x'; 32 << 20]]).unwrap();
        let job = client.execute(big).await;
        let err = job.error().cloned().expect("job must fail");
        assert!(matches!(err, ClientError::PartialSend { written, .. } if written > 0));
        assert!(err.is_fatal());
        assert!(saw(&mut seen, |event| matches!(event, StatusEvent::ConnectionStopped { .. })).await);

        for _ in 0..10 {
            let reply = client.command(&cmd::PING, args![]).await.unwrap();
            assert_eq!(reply.to_text().unwrap(), "PONG");
        }
        client.quit().await.unwrap();
    }
}
