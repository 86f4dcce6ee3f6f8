//! # Rental Pool
//!
//! Purpose: Lease single-connection clients to callers exclusively and for
//! a bounded time, so several tasks can share a few connections without
//! interleaving their requests.
//!
//! ## Design Principles
//! 1. **Controller per Connection**: Each pooled client is owned by one task
//!    running an explicit Idle/Rented state machine; no mutex guards the
//!    pool.
//! 2. **Structural Exclusivity**: A controller only answers rent requests
//!    while Idle, so a client is never held by two callers.
//! 3. **Observational Timeout**: An expired rental is reported and the
//!    client retired once it comes back; it is never taken from its holder.
//! 4. **RAII Return**: [`RentedClient`] goes back to its controller on
//!    `release` or when dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::cmd::{Arg, Cmd};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::job::Job;
use crate::resp::Reply;
use crate::status::{StatusEvent, StatusHandler, StatusSink};
use crate::synced::SyncedClient;

type RentSlot = oneshot::Sender<RentedClient>;

/// Pool of `config.connections` single-connection clients.
pub struct ClientPool {
    requests: async_channel::Sender<RentSlot>,
    quit_tx: mpsc::Sender<oneshot::Sender<()>>,
    quitting: AtomicBool,
    size: usize,
}

impl ClientPool {
    /// Dials every pooled client and starts its controller.
    pub async fn connect(config: ClientConfig, handler: Option<StatusHandler>) -> ClientResult<Self> {
        let config = Arc::new(config);
        let (status, _consumer) = StatusSink::spawn(handler, config.queue_capacity());
        let size = config.connections.max(1);

        let mut clients = Vec::with_capacity(size);
        for id in 0..size {
            match SyncedClient::with_sink(config.clone(), id, status.clone()).await {
                Ok(client) => clients.push(client),
                Err(err) => {
                    status.report(StatusEvent::failure(Some(id), err.clone()));
                    for mut client in clients {
                        let _ = client.quit().await;
                    }
                    return Err(err);
                }
            }
        }

        let (requests_tx, requests_rx) = async_channel::bounded(config.queue_capacity());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut controllers = JoinSet::new();
        for client in clients {
            let controller = Controller {
                id: client.id(),
                requests: requests_rx.clone(),
                shutdown: shutdown_rx.clone(),
                status: status.clone(),
                rent_timeout: config.rent_timeout,
            };
            controllers.spawn(controller.run(client));
        }

        let (quit_tx, quit_rx) = mpsc::channel(1);
        tokio::spawn(supervise(controllers, shutdown_tx, requests_rx, quit_rx, status));
        info!(size, addr = %config.addr(), "client pool ready");

        Ok(ClientPool {
            requests: requests_tx,
            quit_tx,
            quitting: AtomicBool::new(false),
            size,
        })
    }

    /// Waits until some pooled client is idle and leases it.
    ///
    /// Fails with [`ClientError::AlreadyClosed`] once the pool has shut down.
    pub async fn rent(&self) -> ClientResult<RentedClient> {
        let (slot, granted) = oneshot::channel();
        self.requests
            .send(slot)
            .await
            .map_err(|_| ClientError::AlreadyClosed)?;
        granted.await.map_err(|_| ClientError::AlreadyClosed)
    }

    /// Stops every controller and waits for them; idempotent.
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

    /// Number of pooled clients.
    pub fn size(&self) -> usize {
        self.size
    }
}

async fn supervise(
    mut controllers: JoinSet<()>,
    shutdown: watch::Sender<bool>,
    requests: async_channel::Receiver<RentSlot>,
    mut quit_rx: mpsc::Receiver<oneshot::Sender<()>>,
    status: StatusSink,
) {
    let request = loop {
        tokio::select! {
            request = quit_rx.recv() => break request,
            joined = controllers.join_next(), if !controllers.is_empty() => {
                if let Some(Err(err)) = joined {
                    warn!(error = %err, "pool controller failed");
                }
                if controllers.is_empty() {
                    warn!("every pooled client retired; rentals will fail");
                    reject_waiting(&requests);
                }
            }
        }
    };

    status.report(StatusEvent::QuitStarted);
    let _ = shutdown.send(true);
    while let Some(joined) = controllers.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "pool controller failed");
        }
    }
    reject_waiting(&requests);
    status.report(StatusEvent::QuitDone);
    if let Some(done) = request {
        let _ = done.send(());
    }
}

/// Closes the request queue; dropping the queued slots wakes their callers.
fn reject_waiting(requests: &async_channel::Receiver<RentSlot>) {
    requests.close();
    while requests.try_recv().is_ok() {}
}

enum Rental {
    Idle(SyncedClient),
    Rented {
        returned: oneshot::Receiver<SyncedClient>,
        deadline: Instant,
    },
    // Timed out: the client is retired as soon as it comes back.
    Expired {
        returned: oneshot::Receiver<SyncedClient>,
    },
    Stopped,
}

struct Controller {
    id: usize,
    requests: async_channel::Receiver<RentSlot>,
    shutdown: watch::Receiver<bool>,
    status: StatusSink,
    rent_timeout: Duration,
}

impl Controller {
    async fn run(mut self, client: SyncedClient) {
        let mut state = Rental::Idle(client);
        loop {
            state = match state {
                Rental::Idle(client) => self.idle(client).await,
                Rental::Rented { returned, deadline } => self.rented(returned, deadline).await,
                Rental::Expired { returned } => self.expired(returned).await,
                Rental::Stopped => break,
            };
        }
        debug!(conn = self.id, "pool controller stopped");
    }

    async fn idle(&mut self, client: SyncedClient) -> Rental {
        if *self.shutdown.borrow() {
            return retire(client).await;
        }
        let slot = tokio::select! {
            biased;
            _ = self.shutdown.changed() => return retire(client).await,
            next = self.requests.recv() => match next {
                Ok(slot) => slot,
                Err(_) => return retire(client).await,
            },
        };

        let (back_tx, back_rx) = oneshot::channel();
        let rented = RentedClient {
            conn: self.id,
            client: Some(client),
            back: Some(back_tx),
            status: self.status.clone(),
        };
        match slot.send(rented) {
            Ok(()) => {
                debug!(conn = self.id, "client rented");
                Rental::Rented {
                    returned: back_rx,
                    deadline: Instant::now() + self.rent_timeout,
                }
            }
            // The caller stopped waiting; keep the client for the next one.
            Err(rented) => match rented.into_client() {
                Some(client) => Rental::Idle(client),
                None => Rental::Stopped,
            },
        }
    }

    async fn rented(&mut self, mut returned: oneshot::Receiver<SyncedClient>, deadline: Instant) -> Rental {
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => {
                self.status.report(StatusEvent::QuitWhileRented { conn: self.id });
                Rental::Stopped
            }
            back = &mut returned => match back {
                Ok(client) => {
                    debug!(conn = self.id, "client returned");
                    Rental::Idle(client)
                }
                Err(_) => Rental::Stopped,
            },
            _ = sleep_until(deadline) => {
                self.status.report(StatusEvent::RentTimeout { conn: self.id });
                Rental::Expired { returned }
            }
        }
    }

    async fn expired(&mut self, mut returned: oneshot::Receiver<SyncedClient>) -> Rental {
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => {
                self.status.report(StatusEvent::QuitWhileRented { conn: self.id });
                Rental::Stopped
            }
            back = &mut returned => match back {
                Ok(client) => {
                    self.status.report(StatusEvent::ReturnedAfterTimeout { conn: self.id });
                    retire(client).await
                }
                Err(_) => Rental::Stopped,
            },
        }
    }
}

async fn retire(mut client: SyncedClient) -> Rental {
    if let Err(err) = client.quit().await {
        debug!(conn = client.id(), error = %err, "pooled client already quit");
    }
    Rental::Stopped
}

/// Exclusive lease of one pooled client.
///
/// Returned to the pool by [`RentedClient::release`] or on drop. It cannot
/// be shut down by its holder.
pub struct RentedClient {
    conn: usize,
    client: Option<SyncedClient>,
    back: Option<oneshot::Sender<SyncedClient>>,
    status: StatusSink,
}

impl RentedClient {
    /// Executes one command and returns its reply.
    pub async fn command(&mut self, cmd: &Cmd, args: impl IntoIterator<Item = Arg>) -> ClientResult<Reply> {
        self.client()?.command(cmd, args).await
    }

    /// Executes a pipelined batch and returns one reply per command.
    pub async fn commands(&mut self, args: impl IntoIterator<Item = Arg>) -> ClientResult<Vec<Reply>> {
        self.client()?.commands(args).await
    }

    /// Sends a job and reads all of its replies.
    pub async fn execute(&mut self, mut job: Job) -> Job {
        match self.client.as_mut() {
            Some(client) => client.execute(job).await,
            None => {
                job.set_error(ClientError::AlreadyClosed);
                job
            }
        }
    }

    /// Always fails: a leased client is released, never shut down.
    pub async fn quit(&mut self) -> ClientResult<()> {
        let err = ClientError::RentedClientCannotQuit;
        self.status.report(StatusEvent::failure(Some(self.conn), err.clone()));
        Err(err)
    }

    /// Hands the client back to its controller.
    pub fn release(mut self) {
        self.give_back();
    }

    /// Pool slot this lease belongs to.
    pub fn conn(&self) -> usize {
        self.conn
    }

    fn client(&mut self) -> ClientResult<&mut SyncedClient> {
        self.client.as_mut().ok_or(ClientError::AlreadyClosed)
    }

    fn into_client(mut self) -> Option<SyncedClient> {
        self.back = None;
        self.client.take()
    }

    fn give_back(&mut self) {
        if let (Some(client), Some(back)) = (self.client.take(), self.back.take()) {
            if back.send(client).is_err() {
                // Controller is gone (pool shut down); the socket closes on drop.
                debug!(conn = self.conn, "returned client after pool shutdown");
            }
        }
    }
}

impl Drop for RentedClient {
    fn drop(&mut self) {
        self.give_back();
    }
}
