//! # Status Sink
//!
//! Purpose: Carry lifecycle and failure events (reconnects, rent timeouts,
//! shutdown progress) out of the connection tasks to a caller-supplied
//! handler. Normal results never travel here.
//!
//! ## Design Principles
//! 1. **Never Block the Hot Path**: Reporting uses `try_send`; a full
//!    buffer drops the event with a warning instead of stalling a writer.
//! 2. **Single Consumer**: One task owns the handler, so handlers need not
//!    be `Sync`.
//! 3. **Logged Twice**: Every event is also emitted through `tracing`, so
//!    nothing fails silently even without a handler.

use std::fmt;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;

/// Handler invoked for every status event, in report order.
pub type StatusHandler = Box<dyn FnMut(StatusEvent) + Send + 'static>;

/// Event reported on the status sink.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// A connection (or pooled client) finished dialing.
    Connected { conn: usize },
    /// A stale connection was replaced by a fresh one.
    Reconnected { conn: usize },
    /// A multiplexed connection stopped serving jobs.
    ConnectionStopped { conn: usize },
    /// Shutdown of a client or pool began.
    QuitStarted,
    /// Shutdown of a client or pool completed.
    QuitDone,
    /// A rental outlived the configured rent timeout.
    RentTimeout { conn: usize },
    /// A rental that timed out was eventually released.
    ReturnedAfterTimeout { conn: usize },
    /// The pool shut down while the connection was rented.
    QuitWhileRented { conn: usize },
    /// A failure, optionally tied to a connection and a job.
    Failure {
        conn: Option<usize>,
        error: ClientError,
        job: Option<String>,
    },
}

impl StatusEvent {
    pub(crate) fn failure(conn: Option<usize>, error: ClientError) -> Self {
        StatusEvent::Failure {
            conn,
            error,
            job: None,
        }
    }

    pub(crate) fn job_failure(conn: usize, error: ClientError, job: String) -> Self {
        StatusEvent::Failure {
            conn: Some(conn),
            error,
            job: Some(job),
        }
    }

    /// Returns true for failures, false for purely informational events.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            StatusEvent::RentTimeout { .. } | StatusEvent::QuitWhileRented { .. } | StatusEvent::Failure { .. }
        )
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Connected { conn } => write!(f, "connection {} connected", conn),
            StatusEvent::Reconnected { conn } => write!(f, "connection {} reconnected", conn),
            StatusEvent::ConnectionStopped { conn } => write!(f, "connection {} stopped", conn),
            StatusEvent::QuitStarted => write!(f, "quit started"),
            StatusEvent::QuitDone => write!(f, "quit done"),
            StatusEvent::RentTimeout { conn } => write!(f, "rent timeout on client {}", conn),
            StatusEvent::ReturnedAfterTimeout { conn } => {
                write!(f, "client {} returned after timeout", conn)
            }
            StatusEvent::QuitWhileRented { conn } => {
                write!(f, "quit signaled while client {} was rented", conn)
            }
            StatusEvent::Failure { conn, error, job } => {
                match conn {
                    Some(conn) => write!(f, "connection {}: {}", conn, error)?,
                    None => write!(f, "{}", error)?,
                }
                if let Some(job) = job {
                    write!(f, " (job: {})", job)?;
                }
                Ok(())
            }
        }
    }
}

/// Multi-producer handle onto the status queue.
#[derive(Clone)]
pub struct StatusSink {
    tx: mpsc::Sender<StatusEvent>,
}

impl StatusSink {
    /// Spawns the consumer task and returns the producing handle.
    ///
    /// Without a handler the consumer drains events silently.
    pub(crate) fn spawn(handler: Option<StatusHandler>, capacity: usize) -> (StatusSink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let consumer = tokio::spawn(async move {
            match handler {
                Some(mut handler) => {
                    while let Some(event) = rx.recv().await {
                        handler(event);
                    }
                }
                None => while rx.recv().await.is_some() {},
            }
        });
        (StatusSink { tx }, consumer)
    }

    /// Reports one event without waiting for buffer space.
    pub(crate) fn report(&self, event: StatusEvent) {
        match &event {
            StatusEvent::QuitStarted | StatusEvent::QuitDone => info!(%event, "status"),
            event if event.is_error() => warn!(%event, "status"),
            event => debug!(%event, "status"),
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!(%event, "status queue full, event dropped"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handler_sees_events_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (sink, consumer) = StatusSink::spawn(
            Some(Box::new(move |event| {
                let _ = tx.send(event.to_string());
            })),
            16,
        );
        sink.report(StatusEvent::Connected { conn: 0 });
        sink.report(StatusEvent::QuitStarted);
        sink.report(StatusEvent::failure(Some(1), ClientError::AlreadyClosed));
        drop(sink);
        consumer.await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "connection 0 connected");
        assert_eq!(rx.recv().await.unwrap(), "quit started");
        assert_eq!(rx.recv().await.unwrap(), "connection 1: client is already closed");
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (tx, rx) = mpsc::channel(1);
        let sink = StatusSink { tx };
        sink.report(StatusEvent::QuitStarted);
        sink.report(StatusEvent::QuitDone);
        drop(rx);
    }

    #[test]
    fn failures_are_errors() {
        assert!(StatusEvent::RentTimeout { conn: 0 }.is_error());
        assert!(!StatusEvent::ReturnedAfterTimeout { conn: 0 }.is_error());
        assert!(!StatusEvent::QuitDone.is_error());
    }
}
