//! # MuxKV Client
//!
//! Purpose: Talk to a Redis-compatible key-value server at high request
//! rates by pipelining many callers' commands over a few connections, or by
//! leasing dedicated connections from a small pool.
//!
//! ## Design Principles
//! 1. **Explicit Protocol**: Requests are framed and replies decoded by a
//!    hand-written RESP2 codec with bounded lengths and nesting.
//! 2. **Ordering Without IDs**: Per connection, replies are matched to jobs
//!    in write order.
//! 3. **Local Failure**: A broken connection fails only its own jobs;
//!    siblings keep serving.
//! 4. **Nothing Silent**: Every failure is returned to its caller and also
//!    reported to the status sink.
//!
//! ## Quick Start
//!
//! ```no_run
//! use muxkv_client::{args, cmd, ClientConfig, MuxClient};
//!
//! # async fn demo() -> muxkv_client::ClientResult<()> {
//! let client = MuxClient::connect(ClientConfig::new("127.0.0.1", 6379), None).await?;
//! let replies = client
//!     .commands(args![&cmd::SET, "k", 1, &cmd::INCR, "k", &cmd::GET, "k"])
//!     .await?;
//! assert_eq!(replies[2].to_i64()?, 2);
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

pub mod cmd;
mod config;
mod error;
mod job;
mod mux;
mod net;
mod pool;
mod resp;
mod status;
mod synced;

pub use cmd::{Arg, Cmd};
pub use config::{ClientConfig, DEFAULT_QUEUE_CAPACITY};
pub use error::{ClientError, ClientResult};
pub use job::Job;
pub use mux::MuxClient;
pub use pool::{ClientPool, RentedClient};
pub use resp::{decode_reply, encode_command, parse_reply, Reply, ReplyReader};
pub use status::{StatusEvent, StatusHandler};
pub use synced::SyncedClient;
