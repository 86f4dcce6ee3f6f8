//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode commands into request frames and decode server replies
//! into a typed tree, incrementally and without trusting the peer.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: `parse_reply` returns `Ok(None)` until a whole
//!    reply is buffered, so socket reads never need to line up with frames.
//! 2. **Fail at the First Bad Byte**: Unknown markers, non-numeric lengths and
//!    a CR not followed by LF are rejected as soon as they are seen.
//! 3. **Binary-Safe**: Bulk strings are length-delimited raw bytes.
//! 4. **Bounded Work**: Bulk lengths, line lengths and array nesting are
//!    capped so garbage cannot trigger huge allocations or unbounded
//!    recursion.
//! 5. **Scan, Then Build**: A resumable scanner finds where a frame ends
//!    without allocating; the `Reply` tree is built once the whole frame is
//!    buffered, so a large reply costs linear time however it is split.
//!
//! ## Wire Format
//!
//! ```text
//! request:  *<n>\r\n  $<len>\r\n<cmd>\r\n  $<len>\r\n<arg>\r\n ...
//! replies:  +<text>\r\n   -<message>\r\n   :<digits>\r\n
//!           $<len>\r\n<bytes>\r\n   ($-1\r\n is nil)
//!           *<n>\r\n<reply>...      (*-1\r\n is nil)
//! ```

use std::fmt;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cmd::{Arg, Cmd};
use crate::error::{ClientError, ClientResult};

/// Marker of simple-string replies.
pub const MARK_SIMPLE_STRING: u8 = b'+';
/// Marker of error replies.
pub const MARK_ERROR: u8 = b'-';
/// Marker of integer replies.
pub const MARK_INTEGER: u8 = b':';
/// Marker of bulk-string replies.
pub const MARK_BULK_STRING: u8 = b'$';
/// Marker of array replies.
pub const MARK_ARRAY: u8 = b'*';
/// Internal marker for nil; never appears on the wire.
pub const MARK_NIL: u8 = b'N';

/// Largest bulk string accepted from the server (512 MiB).
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Deepest array nesting accepted from the server.
pub const MAX_DEPTH: usize = 128;

/// Longest simple-string, error or integer line accepted (64 KiB).
pub const MAX_LINE_LEN: usize = 64 * 1024;

// A length line never needs more than a sign and 19 digits.
const MAX_LEN_LINE: usize = 20;

/// Decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK` style status text.
    SimpleString(Vec<u8>),
    /// `-ERR ...` error text, kept verbatim.
    Error(Vec<u8>),
    /// `:123`, kept as the raw decimal digits.
    Integer(Vec<u8>),
    /// `$n` binary payload.
    BulkString(Vec<u8>),
    /// `*n` ordered children.
    Array(Vec<Reply>),
    /// `$-1` or `*-1`.
    Nil,
}

impl Reply {
    /// Wire marker of the reply; nil reports [`MARK_NIL`].
    pub fn marker(&self) -> u8 {
        match self {
            Reply::SimpleString(_) => MARK_SIMPLE_STRING,
            Reply::Error(_) => MARK_ERROR,
            Reply::Integer(_) => MARK_INTEGER,
            Reply::BulkString(_) => MARK_BULK_STRING,
            Reply::Array(_) => MARK_ARRAY,
            Reply::Nil => MARK_NIL,
        }
    }

    /// Human-readable name of the reply kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::SimpleString(_) => "simple string",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::BulkString(_) => "bulk string",
            Reply::Array(_) => "array",
            Reply::Nil => "nil",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Raw payload of a scalar reply.
    ///
    /// Fails with a conversion error for arrays and nil.
    pub fn as_bytes(&self) -> ClientResult<&[u8]> {
        match self {
            Reply::SimpleString(bytes)
            | Reply::Error(bytes)
            | Reply::Integer(bytes)
            | Reply::BulkString(bytes) => Ok(bytes),
            other => Err(ClientError::conversion("bytes", format!("reply is {}", other.kind()))),
        }
    }

    /// Payload as UTF-8 text. Error replies yield the server message.
    pub fn to_text(&self) -> ClientResult<String> {
        let bytes = self.as_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ClientError::conversion("string", format!("invalid utf-8 {:?}", bytes.escape_ascii().to_string())))
    }

    /// Payload parsed as a signed decimal integer.
    pub fn to_i64(&self) -> ClientResult<i64> {
        let bytes = self.as_bytes()?;
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
            .ok_or_else(|| ClientError::conversion("i64", format!("value {:?}", bytes.escape_ascii().to_string())))
    }

    /// Children of an array reply.
    pub fn children(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Converts an error reply into a server error; other replies give `None`.
    pub fn server_error(&self) -> Option<ClientError> {
        match self {
            Reply::Error(message) => Some(ClientError::Server(String::from_utf8_lossy(message).into_owned())),
            _ => None,
        }
    }

    /// True when a batch consists of a single nil reply.
    pub fn is_nil_batch(replies: &[Reply]) -> bool {
        matches!(replies, [Reply::Nil])
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::SimpleString(text) => write!(f, "{}", text.escape_ascii()),
            Reply::Error(text) => write!(f, "(error) {}", text.escape_ascii()),
            Reply::Integer(digits) => write!(f, "(integer) {}", digits.escape_ascii()),
            Reply::BulkString(data) => write!(f, "\"{}\"", data.escape_ascii()),
            Reply::Nil => write!(f, "(nil)"),
            Reply::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Reply::Array(items) => {
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", idx + 1, item)?;
                }
                Ok(())
            }
        }
    }
}

/// Encodes one command and its arguments as a RESP2 array request.
///
/// A command token in `args` is an unsupported argument kind.
pub fn encode_command(cmd: &Cmd, args: &[Arg], out: &mut BytesMut) -> ClientResult<()> {
    out.extend_from_slice(b"*");
    push_usize(out, 1 + args.len());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(cmd.encoded());
    for (idx, arg) in args.iter().enumerate() {
        match arg {
            Arg::Text(text) => push_bulk(out, text.as_bytes()),
            Arg::Bytes(bytes) => push_bulk(out, bytes),
            Arg::Int(value) => {
                let (digits, len) = encode_i64(*value);
                push_bulk(out, &digits[..len]);
            }
            Arg::Cmd(inner) => {
                return Err(ClientError::input(format!(
                    "argument #{} of {} is a command token ({}), which cannot be sent as an argument",
                    idx + 1,
                    cmd.name().escape_ascii(),
                    inner.name().escape_ascii()
                )));
            }
        }
    }
    Ok(())
}

/// Parses one reply from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds only a prefix of a valid reply, or
/// `Ok(Some((reply, consumed)))` once a whole reply is available.
pub fn parse_reply(buf: &[u8]) -> ClientResult<Option<(Reply, usize)>> {
    match FrameScanner::default().advance(buf)? {
        Some(end) => Ok(Some((build_frame(&buf[..end])?, end))),
        None => Ok(None),
    }
}

/// Decodes exactly one reply from a complete byte slice.
///
/// Truncated input is a protocol error.
pub fn decode_reply(buf: &[u8]) -> ClientResult<Reply> {
    match parse_reply(buf)? {
        Some((reply, _)) => Ok(reply),
        None => Err(ClientError::protocol(format!(
            "truncated reply after {} byte(s)",
            buf.len()
        ))),
    }
}

/// Outcome of scanning one element header.
enum Step {
    /// The element ends this many bytes in.
    Done(usize),
    /// An array of `count` children whose header is `used` bytes long.
    Open { count: usize, used: usize },
}

/// Resumable search for the end of one reply frame.
///
/// Keeps the offset of the first unfinished element and the number of
/// children still expected by every open array, so bytes already walked
/// over are never scanned again.
#[derive(Debug, Default)]
struct FrameScanner {
    pos: usize,
    open: Vec<usize>,
}

impl FrameScanner {
    /// Returns the frame length once `buf` holds the whole frame.
    fn advance(&mut self, buf: &[u8]) -> ClientResult<Option<usize>> {
        loop {
            let step = match scan_element(&buf[self.pos..]) {
                Ok(Some(step)) => step,
                Ok(None) => return Ok(None),
                Err(err) => {
                    self.reset();
                    return Err(err);
                }
            };
            match step {
                Step::Open { count, used } => {
                    if self.open.len() >= MAX_DEPTH {
                        self.reset();
                        return Err(ClientError::protocol("array nesting too deep"));
                    }
                    self.open.push(count);
                    self.pos += used;
                }
                Step::Done(used) => {
                    self.pos += used;
                    // Close every array this element completes.
                    loop {
                        match self.open.last_mut() {
                            None => {
                                let end = self.pos;
                                self.reset();
                                return Ok(Some(end));
                            }
                            Some(remaining) => {
                                *remaining -= 1;
                                if *remaining > 0 {
                                    break;
                                }
                                self.open.pop();
                            }
                        }
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.open.clear();
    }
}

/// Validates the element at the front of `buf` without materializing it.
fn scan_element(buf: &[u8]) -> ClientResult<Option<Step>> {
    let marker = match buf.first() {
        Some(&marker) => marker,
        None => return Ok(None),
    };
    match marker {
        MARK_SIMPLE_STRING | MARK_ERROR | MARK_INTEGER => Ok(read_line(buf)?.map(|(_, next)| Step::Done(next))),
        MARK_BULK_STRING => {
            let (len, start) = match read_len(buf)? {
                Some(found) => found,
                None => return Ok(None),
            };
            match len {
                None => Ok(Some(Step::Done(start))),
                Some(len) => Ok(bulk_end(buf, start, len)?.map(Step::Done)),
            }
        }
        MARK_ARRAY => {
            let (count, used) = match read_len(buf)? {
                Some(found) => found,
                None => return Ok(None),
            };
            match count {
                None | Some(0) => Ok(Some(Step::Done(used))),
                Some(count) => Ok(Some(Step::Open { count, used })),
            }
        }
        other => Err(unknown_marker(other)),
    }
}

/// Offset just past a bulk payload of `len` bytes starting at `start`.
fn bulk_end(buf: &[u8], start: usize, len: usize) -> ClientResult<Option<usize>> {
    if len > MAX_BULK_LEN {
        return Err(ClientError::protocol(format!("bulk length {} exceeds limit", len)));
    }
    let end = start + len;
    // Check whatever part of the terminator has already arrived.
    if let Some(&cr) = buf.get(end) {
        if cr != b'\r' {
            return Err(ClientError::protocol(format!(
                "bulk string of length {} is not followed by CR",
                len
            )));
        }
    }
    match buf.get(end + 1) {
        None => Ok(None),
        Some(b'\n') => Ok(Some(end + 2)),
        Some(_) => Err(ClientError::protocol("CR is not followed by LF")),
    }
}

fn unknown_marker(marker: u8) -> ClientError {
    ClientError::protocol(format!(
        "unknown marker {:?}",
        char::from(marker).escape_default().to_string()
    ))
}

/// Builds the reply tree of a frame the scanner found complete.
fn build_frame(frame: &[u8]) -> ClientResult<Reply> {
    match parse_at(frame, 0)? {
        Some((reply, _)) => Ok(reply),
        None => Err(ClientError::protocol("reply frame ended early")),
    }
}

/// Materializes one element, recursing into arrays.
fn parse_at(buf: &[u8], depth: usize) -> ClientResult<Option<(Reply, usize)>> {
    let marker = match buf.first() {
        Some(&marker) => marker,
        None => return Ok(None),
    };

    match marker {
        MARK_SIMPLE_STRING | MARK_ERROR | MARK_INTEGER => {
            let (line, next) = match read_line(buf)? {
                Some(found) => found,
                None => return Ok(None),
            };
            let payload = line.to_vec();
            let reply = match marker {
                MARK_SIMPLE_STRING => Reply::SimpleString(payload),
                MARK_ERROR => Reply::Error(payload),
                _ => Reply::Integer(payload),
            };
            Ok(Some((reply, next)))
        }
        MARK_BULK_STRING => {
            let (len, start) = match read_len(buf)? {
                Some(found) => found,
                None => return Ok(None),
            };
            let len = match len {
                Some(len) => len,
                None => return Ok(Some((Reply::Nil, start))),
            };
            match bulk_end(buf, start, len)? {
                Some(next) => Ok(Some((Reply::BulkString(buf[start..start + len].to_vec()), next))),
                None => Ok(None),
            }
        }
        MARK_ARRAY => {
            let (count, mut pos) = match read_len(buf)? {
                Some(found) => found,
                None => return Ok(None),
            };
            let count = match count {
                Some(count) => count,
                None => return Ok(Some((Reply::Nil, pos))),
            };
            if count > 0 && depth >= MAX_DEPTH {
                return Err(ClientError::protocol("array nesting too deep"));
            }
            // Cap the preallocation; the peer's count is not trusted.
            let mut items = Vec::with_capacity(count.min(1024));
            for idx in 0..count {
                match parse_at(&buf[pos..], depth + 1) {
                    Ok(Some((item, used))) => {
                        items.push(item);
                        pos += used;
                    }
                    Ok(None) => return Ok(None),
                    Err(ClientError::Protocol(message)) => {
                        return Err(ClientError::protocol(format!("array element #{}: {}", idx, message)));
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(Some((Reply::Array(items), pos)))
        }
        other => Err(unknown_marker(other)),
    }
}

/// Finds the CRLF-terminated line after the marker byte.
fn read_line(buf: &[u8]) -> ClientResult<Option<(&[u8], usize)>> {
    let limit = buf.len().min(MAX_LINE_LEN + 2);
    let cr = match buf[1..limit].iter().position(|&b| b == b'\r') {
        Some(offset) => offset + 1,
        None if buf.len() > MAX_LINE_LEN + 1 => {
            return Err(ClientError::protocol(format!("line longer than {} bytes", MAX_LINE_LEN)));
        }
        None => return Ok(None),
    };
    match buf.get(cr + 1) {
        None => Ok(None),
        Some(b'\n') => Ok(Some((&buf[1..cr], cr + 2))),
        Some(_) => Err(ClientError::protocol("CR is not followed by LF")),
    }
}

/// Reads a length line; `Some(None)` inside means the nil length `-1`.
fn read_len(buf: &[u8]) -> ClientResult<Option<(Option<usize>, usize)>> {
    let limit = buf.len().min(MAX_LEN_LINE + 2);
    let body_end = buf[1..limit].iter().position(|&b| b == b'\r').map(|offset| offset + 1);
    // Validate the digits seen so far, even before the CR arrives.
    let body = &buf[1..body_end.unwrap_or(limit)];
    validate_len_prefix(body)?;

    let (line, next) = match read_line(buf)? {
        Some(found) => found,
        None => return Ok(None),
    };
    Ok(Some((parse_len(line)?, next)))
}

fn validate_len_prefix(body: &[u8]) -> ClientResult<()> {
    if body.len() > MAX_LEN_LINE {
        return Err(ClientError::protocol("length line too long"));
    }
    for (idx, &b) in body.iter().enumerate() {
        let ok = b.is_ascii_digit() || (idx == 0 && b == b'-');
        if !ok {
            return Err(ClientError::protocol(format!(
                "cannot find length, read so far: {:?}",
                body.escape_ascii().to_string()
            )));
        }
    }
    Ok(())
}

fn parse_len(line: &[u8]) -> ClientResult<Option<usize>> {
    if line == b"-1" {
        return Ok(None);
    }
    if line.is_empty() || line[0] == b'-' {
        return Err(ClientError::protocol(format!(
            "invalid length {:?}",
            line.escape_ascii().to_string()
        )));
    }
    let mut value: usize = 0;
    for &b in line {
        value = value
            .checked_mul(10)
            .and_then(|value| value.checked_add((b - b'0') as usize))
            .ok_or_else(|| ClientError::protocol("length overflows"))?;
    }
    Ok(Some(value))
}

fn push_bulk(out: &mut BytesMut, data: &[u8]) {
    out.extend_from_slice(b"$");
    push_usize(out, data.len());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Appends the decimal digits of `value`.
pub(crate) fn push_usize(out: &mut BytesMut, mut value: usize) {
    let mut buf = [0u8; 20];
    let mut len = 0;
    loop {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    buf[..len].reverse();
    out.extend_from_slice(&buf[..len]);
}

fn encode_i64(value: i64) -> ([u8; 20], usize) {
    let mut buf = [0u8; 20];
    let mut len = 0;
    let mut magnitude = value.unsigned_abs();
    if magnitude == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while magnitude > 0 {
        buf[len] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        len += 1;
    }
    if value < 0 {
        buf[len] = b'-';
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}

/// Streams replies off an async reader through the incremental parser.
pub struct ReplyReader<R> {
    inner: R,
    buf: BytesMut,
    scan: FrameScanner,
    closed: bool,
}

impl<R: AsyncRead + Unpin> ReplyReader<R> {
    pub fn new(inner: R) -> Self {
        ReplyReader {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            scan: FrameScanner::default(),
            closed: false,
        }
    }

    /// Reads the next whole reply.
    ///
    /// EOF between replies is an I/O error; EOF inside a reply is a protocol
    /// error. A malformed reply is a protocol error too: the length of the
    /// bad frame is unknown, so the stream cannot be resynchronized. In all
    /// of these cases the reader is closed afterwards.
    pub async fn next_reply(&mut self) -> ClientResult<Reply> {
        loop {
            match self.scan.advance(&self.buf) {
                Ok(Some(end)) => {
                    let built = build_frame(&self.buf[..end]);
                    self.buf.advance(end);
                    return built.map_err(|err| self.fail(err));
                }
                Ok(None) => {}
                Err(err) => return Err(self.fail(err)),
            }
            if self.closed {
                return Err(closed_error());
            }
            match self.inner.read_buf(&mut self.buf).await {
                Ok(0) => {
                    self.closed = true;
                    if self.buf.is_empty() {
                        return Err(closed_error());
                    }
                    let pending = self.buf.len();
                    self.buf.clear();
                    self.scan.reset();
                    return Err(ClientError::protocol(format!(
                        "connection closed inside a reply ({} byte(s) pending)",
                        pending
                    )));
                }
                Ok(_) => {}
                Err(err) => {
                    self.closed = true;
                    return Err(err.into());
                }
            }
        }
    }

    /// Marks the underlying transport as unusable.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// True once EOF, a transport error or a malformed reply was seen.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn fail(&mut self, err: ClientError) -> ClientError {
        self.closed = true;
        self.buf.clear();
        self.scan.reset();
        err
    }
}

fn closed_error() -> ClientError {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed by peer").into()
}
