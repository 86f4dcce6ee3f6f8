//! # Jobs
//!
//! Purpose: Bundle one or more encoded commands with the replies they
//! produce, and hand the result back to exactly one waiting caller.
//!
//! ## Design Principles
//! 1. **Encode Up Front**: A job is encoded once at construction; writers
//!    only copy bytes (and may resend them after a reconnect).
//! 2. **All or Error**: A finished job holds one reply per command, or a
//!    terminal error and no replies; never a silent short batch.
//! 3. **Single-Fire Completion**: [`Submission`] wraps the job with a
//!    oneshot sender and is consumed by `complete`/`fail`, so delivering
//!    twice does not compile.

use std::fmt::Write as _;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::cmd::{Arg, Cmd};
use crate::error::{ClientError, ClientResult};
use crate::resp::{encode_command, Reply};

/// A batch of encoded commands and, once processed, their replies.
#[derive(Debug)]
pub struct Job {
    single: Option<Cmd>,
    args: Vec<Arg>,
    num_cmds: usize,
    payload: Bytes,
    replies: Vec<Reply>,
    error: Option<ClientError>,
}

impl Job {
    /// Builds a job for a single command.
    pub fn command(cmd: &Cmd, args: impl IntoIterator<Item = Arg>) -> ClientResult<Self> {
        let args: Vec<Arg> = args.into_iter().collect();
        let mut buf = BytesMut::with_capacity(64);
        encode_command(cmd, &args, &mut buf)?;
        Ok(Job {
            single: Some(cmd.clone()),
            args,
            num_cmds: 1,
            payload: buf.freeze(),
            replies: Vec::new(),
            error: None,
        })
    }

    /// Builds a pipelined job from a stream interleaving tokens and scalars.
    ///
    /// Every command token starts a new command; the scalars that follow it
    /// are its arguments.
    pub fn pipeline(args: impl IntoIterator<Item = Arg>) -> ClientResult<Self> {
        let args: Vec<Arg> = args.into_iter().collect();
        if args.is_empty() {
            return Err(ClientError::input("empty command batch"));
        }

        let mut buf = BytesMut::with_capacity(64 * args.len());
        let mut num_cmds = 0;
        let mut idx = 0;
        while idx < args.len() {
            let cmd = match &args[idx] {
                Arg::Cmd(cmd) => cmd,
                _ => {
                    return Err(ClientError::input(format!(
                        "argument #{} precedes any command token",
                        idx + 1
                    )));
                }
            };
            let end = args[idx + 1..]
                .iter()
                .position(|arg| matches!(arg, Arg::Cmd(_)))
                .map_or(args.len(), |offset| idx + 1 + offset);
            encode_command(cmd, &args[idx + 1..end], &mut buf).map_err(|err| match err {
                ClientError::Input(message) => {
                    ClientError::input(format!("command #{}: {}", num_cmds + 1, message))
                }
                other => other,
            })?;
            num_cmds += 1;
            idx = end;
        }

        Ok(Job {
            single: None,
            args,
            num_cmds,
            payload: buf.freeze(),
            replies: Vec::new(),
            error: None,
        })
    }

    /// Placeholder left behind once a submission handed its job over.
    pub(crate) fn empty() -> Self {
        Job {
            single: None,
            args: Vec::new(),
            num_cmds: 0,
            payload: Bytes::new(),
            replies: Vec::new(),
            error: None,
        }
    }

    /// Number of commands, and therefore replies, in this job.
    pub fn command_count(&self) -> usize {
        self.num_cmds
    }

    /// Encoded request bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Replies in command order; empty until the job succeeded.
    pub fn replies(&self) -> &[Reply] {
        &self.replies
    }

    /// Terminal error, if the job failed.
    pub fn error(&self) -> Option<&ClientError> {
        self.error.as_ref()
    }

    /// First error reply of the batch, converted to a server error.
    pub fn first_server_error(&self) -> Option<ClientError> {
        self.replies.iter().find_map(Reply::server_error)
    }

    /// Replies on success, the terminal error otherwise.
    pub fn into_result(self) -> ClientResult<Vec<Reply>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.replies),
        }
    }

    pub(crate) fn set_replies(&mut self, replies: Vec<Reply>) {
        debug_assert_eq!(replies.len(), self.num_cmds);
        self.replies = replies;
        self.error = None;
    }

    pub(crate) fn set_error(&mut self, err: ClientError) {
        self.replies.clear();
        self.error = Some(err);
    }

    /// Renders commands, arguments, replies and error for logs.
    ///
    /// The output is pure ASCII: non-ASCII characters, control characters,
    /// quotes and backslashes are escaped, and invalid UTF-8 bytes appear as
    /// `\xNN`.
    pub fn debug_string(&self) -> String {
        let mut raw: Vec<u8> = b"cmd(s): ".to_vec();
        let mut first = true;
        if let Some(cmd) = &self.single {
            raw.extend_from_slice(cmd.name());
            first = false;
        }
        for arg in &self.args {
            if !first {
                raw.extend_from_slice(b" / ");
            }
            first = false;
            write_arg(&mut raw, arg);
        }
        if !self.replies.is_empty() {
            raw.extend_from_slice(b" --> reply: ");
            for (idx, reply) in self.replies.iter().enumerate() {
                if idx > 0 {
                    raw.extend_from_slice(b" / ");
                }
                write_reply_summary(&mut raw, reply);
            }
        }
        if let Some(err) = &self.error {
            raw.extend_from_slice(format!(" --> error: {}", err).as_bytes());
        }
        ascii_escape(&raw)
    }
}

fn write_arg(out: &mut Vec<u8>, arg: &Arg) {
    match arg {
        Arg::Cmd(cmd) => out.extend_from_slice(cmd.name()),
        Arg::Text(text) => out.extend_from_slice(text.as_bytes()),
        Arg::Int(value) => out.extend_from_slice(value.to_string().as_bytes()),
        Arg::Bytes(bytes) => out.extend_from_slice(bytes),
    }
}

fn write_reply_summary(out: &mut Vec<u8>, reply: &Reply) {
    out.push(reply.marker());
    match reply {
        Reply::Array(items) => out.extend_from_slice(format!("[{}]", items.len()).as_bytes()),
        Reply::Nil => {}
        scalar => {
            if let Ok(bytes) = scalar.as_bytes() {
                out.extend_from_slice(bytes);
            }
        }
    }
}

fn ascii_escape(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for chunk in raw.utf8_chunks() {
        for c in chunk.valid().chars() {
            match c {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                ' '..='~' => out.push(c),
                _ => out.extend(c.escape_default()),
            }
        }
        for &byte in chunk.invalid() {
            let _ = write!(out, "\\x{:02x}", byte);
        }
    }
    out
}

/// A job travelling through a client together with its completion signal.
///
/// Dropping an undelivered submission (a queue torn down, a task aborted)
/// still completes it, with [`ClientError::AlreadyClosed`].
#[derive(Debug)]
pub(crate) struct Submission {
    job: Job,
    done: Option<oneshot::Sender<Job>>,
}

impl Submission {
    pub(crate) fn new(job: Job) -> (Self, oneshot::Receiver<Job>) {
        let (done, rx) = oneshot::channel();
        (Submission { job, done: Some(done) }, rx)
    }

    pub(crate) fn job(&self) -> &Job {
        &self.job
    }

    pub(crate) fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    /// Delivers the job to its waiting caller.
    pub(crate) fn complete(mut self) {
        self.deliver();
    }

    /// Attaches `err` and delivers the job.
    pub(crate) fn fail(mut self, err: ClientError) {
        self.job.set_error(err);
        self.deliver();
    }

    fn deliver(&mut self) {
        if let Some(done) = self.done.take() {
            let job = std::mem::replace(&mut self.job, Job::empty());
            // The caller may have stopped waiting; the result is then discarded.
            let _ = done.send(job);
        }
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        if self.done.is_some() {
            self.job.set_error(ClientError::AlreadyClosed);
            self.deliver();
        }
    }
}
