//! # Client Errors
//!
//! Purpose: One error type for every failure the client can surface, from
//! malformed peer bytes to lifecycle misuse.
//!
//! ## Design Principles
//! 1. **Cloneable Failures**: The same error is attached to a job and
//!    reported on the status sink, so I/O sources are shared behind `Arc`.
//! 2. **Failure Classes**: Callers ask `is_fatal()` / `is_lifecycle()`
//!    instead of matching every variant.
//! 3. **Job-Scoped vs Connection-Scoped**: Decode and conversion failures
//!    stay on their job; send/read failures end only their connection.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client, the multiplexer and the rental pool.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Peer bytes do not follow the RESP framing rules.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// A reply could not be read as the requested scalar.
    #[error("cannot convert reply to {to}: {detail}")]
    Conversion { to: &'static str, detail: String },

    /// Empty or malformed command batch, or an unsupported argument kind.
    #[error("invalid input: {0}")]
    Input(String),

    /// Dialing (or redialing) the server failed on every attempt.
    #[error("cannot connect to {addr} after {attempts} attempt(s): {source}")]
    Connect {
        addr: String,
        attempts: u32,
        #[source]
        source: Arc<io::Error>,
    },

    /// The write failed before a single byte left the client.
    #[error("error before sending message: {0}")]
    NothingSent(#[source] Arc<io::Error>),

    /// The write failed part-way; the connection is no longer usable.
    #[error("connection broke after sending {written} of {total} bytes: {source}")]
    PartialSend {
        written: usize,
        total: usize,
        #[source]
        source: Arc<io::Error>,
    },

    /// Reading the `index`-th reply of a job failed.
    #[error("cannot read reply #{index}: {source}")]
    Read {
        index: usize,
        #[source]
        source: Box<ClientError>,
    },

    /// Transport failure outside of a send attempt.
    #[error("io error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The client shut down before the job could be processed.
    #[error("client is already closed")]
    AlreadyClosed,

    /// Shutdown was requested more than once.
    #[error("client is quitting or has quit already")]
    AlreadyQuit,

    /// A rented client must be released, not shut down.
    #[error("rented client cannot quit; release it to the pool instead")]
    RentedClientCannotQuit,
}

impl ClientError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        ClientError::Protocol(message.into())
    }

    pub(crate) fn input(message: impl Into<String>) -> Self {
        ClientError::Input(message.into())
    }

    pub(crate) fn conversion(to: &'static str, detail: impl Into<String>) -> Self {
        ClientError::Conversion {
            to,
            detail: detail.into(),
        }
    }

    /// Returns true when the failure ends the connection it happened on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::PartialSend { .. } | ClientError::Read { .. } | ClientError::Connect { .. }
        )
    }

    /// Returns true for lifecycle markers rather than real failures.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ClientError::AlreadyClosed | ClientError::AlreadyQuit | ClientError::RentedClientCannotQuit
        )
    }

    /// Returns true when the write never started, so the job may be retried.
    pub fn is_nothing_sent(&self) -> bool {
        matches!(self, ClientError::NothingSent(_))
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}
