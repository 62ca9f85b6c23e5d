//! Connection tunables

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-connection limits and timeouts
///
/// Durations are written in milliseconds:
///
/// ```toml
/// max_header_size = 16384
/// request_timeout = 30000
/// keep_alive_timeout = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bytes read from the socket per attempt
    pub read_buffer_size: usize,

    /// Limit on the request line plus headers
    pub max_header_size: usize,

    /// Limit on a request body
    pub max_body_size: usize,

    /// Time allowed to receive a whole request once it has started, and
    /// to write its response
    #[serde(with = "millis")]
    pub request_timeout: Duration,

    /// Time an idle keep-alive connection waits for the next request
    #[serde(with = "millis")]
    pub keep_alive_timeout: Duration,

    /// Allow persistent connections at all
    pub keep_alive: bool,

    /// Readiness wake-ups that find nothing to read before the
    /// connection is treated as faulty
    pub max_spurious_wakeups: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8 * 1024,
            max_header_size: 16 * 1024,
            max_body_size: 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(5),
            keep_alive: true,
            max_spurious_wakeups: 64,
        }
    }
}

/// `#[serde(with = "millis")]` for durations written as whole milliseconds
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Write a duration as milliseconds
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    /// Read a duration from milliseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
