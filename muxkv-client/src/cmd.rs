//! # Command Tokens and Arguments
//!
//! Purpose: Pre-encode command names once and describe the scalar
//! arguments a request may carry.
//!
//! ## Design Principles
//! 1. **Encode Once**: A `Cmd` already holds its `$<len>\r\n<NAME>\r\n`
//!    frame; requests splice it in without re-formatting.
//! 2. **Build Once, Never Mutate**: The catalog is a `LazyLock` map built
//!    on first use and read-only afterwards.
//! 3. **Closed Argument Set**: `Arg` lists exactly the kinds the wire
//!    encoder supports.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use bytes::{BufMut, Bytes, BytesMut};

use crate::resp::push_usize;

/// Pre-encoded command token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Cmd(Bytes);

impl Cmd {
    /// Encodes `name` as a bulk-string frame.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        let name = name.as_ref();
        let mut buf = BytesMut::with_capacity(name.len() + 8);
        buf.put_u8(b'$');
        push_usize(&mut buf, name.len());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(name);
        buf.extend_from_slice(b"\r\n");
        Cmd(buf.freeze())
    }

    /// Returns the wire frame, ready to be spliced into a request.
    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    /// Returns the bare command name.
    pub fn name(&self) -> &[u8] {
        let start = self.0.iter().position(|&b| b == b'\n').map_or(0, |idx| idx + 1);
        &self.0[start..self.0.len() - 2]
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cmd({})", self.name().escape_ascii())
    }
}

/// One element of a request stream: a command token or a scalar argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Starts a new command segment.
    Cmd(Cmd),
    /// UTF-8 text, sent as its bytes.
    Text(String),
    /// 64-bit integer, sent in decimal.
    Int(i64),
    /// Raw bytes, sent verbatim.
    Bytes(Vec<u8>),
}

impl From<Cmd> for Arg {
    fn from(cmd: Cmd) -> Self {
        Arg::Cmd(cmd)
    }
}

impl From<&Cmd> for Arg {
    fn from(cmd: &Cmd) -> Self {
        Arg::Cmd(cmd.clone())
    }
}

impl From<&LazyLock<Cmd>> for Arg {
    fn from(cmd: &LazyLock<Cmd>) -> Self {
        Arg::Cmd(Cmd::clone(cmd))
    }
}

impl From<&str> for Arg {
    fn from(text: &str) -> Self {
        Arg::Text(text.to_string())
    }
}

impl From<String> for Arg {
    fn from(text: String) -> Self {
        Arg::Text(text)
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Int(value)
    }
}

impl From<i32> for Arg {
    fn from(value: i32) -> Self {
        Arg::Int(value as i64)
    }
}

impl From<u32> for Arg {
    fn from(value: u32) -> Self {
        Arg::Int(value as i64)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(bytes: Vec<u8>) -> Self {
        Arg::Bytes(bytes)
    }
}

impl From<&[u8]> for Arg {
    fn from(bytes: &[u8]) -> Self {
        Arg::Bytes(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Arg {
    fn from(bytes: &[u8; N]) -> Self {
        Arg::Bytes(bytes.to_vec())
    }
}

/// Builds a `Vec<Arg>` from command tokens and scalars.
///
/// ```
/// use muxkv_client::{args, cmd};
///
/// let stream = args![&cmd::SET, "counter", 1, &cmd::INCR, "counter"];
/// assert_eq!(stream.len(), 5);
/// ```
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::Arg::from($arg)),*]
    };
}

macro_rules! commands {
    ($($ident:ident => $name:literal),* $(,)?) => {
        $(
            #[doc = concat!("`", $name, "` command token.")]
            pub static $ident: LazyLock<Cmd> = LazyLock::new(|| Cmd::new($name));
        )*
    };
}

commands! {
    PING => "PING",
    ECHO => "ECHO",
    SELECT => "SELECT",
    DEL => "DEL",
    EXISTS => "EXISTS",
    EXPIRE => "EXPIRE",
    TTL => "TTL",
    GET => "GET",
    SET => "SET",
    INCR => "INCR",
    INCRBY => "INCRBY",
    DECR => "DECR",
    MGET => "MGET",
    MSET => "MSET",
    HGET => "HGET",
    HSET => "HSET",
    LPUSH => "LPUSH",
    LRANGE => "LRANGE",
    MULTI => "MULTI",
    EXEC => "EXEC",
}

pub(crate) static QUIT: LazyLock<Cmd> = LazyLock::new(|| Cmd::new("QUIT"));

/// Fully framed `QUIT` request sent on shutdown.
pub(crate) static QUIT_REQUEST: LazyLock<Bytes> = LazyLock::new(|| {
    let mut buf = BytesMut::with_capacity(16);
    buf.extend_from_slice(b"*1\r\n");
    buf.extend_from_slice(QUIT.encoded());
    buf.freeze()
});

const CATALOG_NAMES: &[&str] = &[
    // connection
    "ECHO", "PING", "SELECT",
    // keys
    "DEL", "DUMP", "EXISTS", "EXPIRE", "EXPIREAT", "KEYS", "MOVE", "PERSIST", "PEXPIRE",
    "PEXPIREAT", "PTTL", "RANDOMKEY", "RENAME", "RENAMENX", "RESTORE", "SCAN", "SORT", "TTL",
    "TYPE",
    // strings
    "APPEND", "BITCOUNT", "BITOP", "BITPOS", "DECR", "DECRBY", "GET", "GETBIT", "GETRANGE",
    "GETSET", "INCR", "INCRBY", "INCRBYFLOAT", "MGET", "MSET", "MSETNX", "PSETEX", "SET",
    "SETBIT", "SETEX", "SETNX", "SETRANGE", "STRLEN",
    // hashes
    "HDEL", "HEXISTS", "HGET", "HGETALL", "HINCRBY", "HINCRBYFLOAT", "HKEYS", "HLEN", "HMGET",
    "HMSET", "HSCAN", "HSET", "HSETNX", "HSTRLEN", "HVALS",
    // hyperloglog
    "PFADD", "PFCOUNT", "PFMERGE",
    // lists
    "LINDEX", "LINSERT", "LLEN", "LPOP", "LPUSH", "LPUSHX", "LRANGE", "LREM", "LSET", "LTRIM",
    "RPOP", "RPOPLPUSH", "RPUSH", "RPUSHX",
    // sets
    "SADD", "SCARD", "SDIFF", "SDIFFSTORE", "SINTER", "SINTERSTORE", "SISMEMBER", "SMEMBERS",
    "SMOVE", "SPOP", "SRANDMEMBER", "SREM", "SSCAN", "SUNION", "SUNIONSTORE",
    // sorted sets
    "ZADD", "ZCARD", "ZCOUNT", "ZINCRBY", "ZINTERSTORE", "ZLEXCOUNT", "ZRANGE", "ZRANGEBYLEX",
    "ZRANGEBYSCORE", "ZRANK", "ZREM", "ZREMRANGEBYLEX", "ZREMRANGEBYRANK", "ZREMRANGEBYSCORE",
    "ZREVRANGE", "ZREVRANGEBYLEX", "ZREVRANGEBYSCORE", "ZREVRANK", "ZSCAN", "ZSCORE",
    "ZUNIONSTORE",
    // transactions
    "EXEC", "MULTI",
];

static CATALOG: LazyLock<HashMap<&'static str, Cmd>> =
    LazyLock::new(|| CATALOG_NAMES.iter().map(|&name| (name, Cmd::new(name))).collect());

/// Looks up a well-known command by name, ignoring ASCII case.
pub fn lookup(name: &str) -> Option<&'static Cmd> {
    CATALOG.get(name.to_ascii_uppercase().as_str())
}
