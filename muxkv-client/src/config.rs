//! # Client Configuration
//!
//! Purpose: Gather every tunable of the clients and the pool in one
//! serde-friendly struct with sensible defaults.
//!
//! Durations are stored as `Duration` but travel as milliseconds in JSON
//! (`dial_timeout_ms`, `rent_timeout_ms`, ...).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capacity of the dispatch, in-flight and status queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Configuration shared by [`SyncedClient`](crate::SyncedClient),
/// [`MuxClient`](crate::MuxClient) and [`ClientPool`](crate::ClientPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Password for the server. Accepted but never sent: AUTH is not
    /// implemented.
    pub password: Option<String>,
    /// Number of connections (multiplexer) or pooled clients (pool).
    pub connections: usize,
    /// Dial attempts before giving up with a connect error.
    pub dial_attempts: u32,
    /// Pause between two dial attempts.
    #[serde(rename = "dial_retry_delay_ms", with = "millis")]
    pub dial_retry_delay: Duration,
    /// Timeout of a single dial attempt.
    #[serde(rename = "dial_timeout_ms", with = "millis")]
    pub dial_timeout: Duration,
    /// TCP keep-alive idle time, so dead peers eventually surface.
    #[serde(rename = "keepalive_ms", with = "millis")]
    pub keepalive: Duration,
    /// Absolute deadline for one write attempt.
    #[serde(rename = "write_timeout_ms", with = "millis")]
    pub write_timeout: Duration,
    /// Optional deadline for one reply read; `None` waits forever.
    #[serde(rename = "read_timeout_ms", with = "opt_millis")]
    pub read_timeout: Option<Duration>,
    /// Capacity of the dispatch, in-flight and status queues.
    pub queue_capacity: usize,
    /// How long a rental may last before the pool reports it.
    #[serde(rename = "rent_timeout_ms", with = "millis")]
    pub rent_timeout: Duration,
    /// Send attempts of the synchronous client when nothing was written.
    pub send_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            connections: 1,
            dial_attempts: 5,
            dial_retry_delay: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            read_timeout: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            rent_timeout: Duration::from_secs(10),
            send_attempts: 5,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for `host:port` with default tunables.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientConfig {
            host: host.into(),
            port,
            ..ClientConfig::default()
        }
    }

    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Returns the `host:port` address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
