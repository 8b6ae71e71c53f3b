//! HTTP/2 connection configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use io_driver::CacheKey;
use serde::{Deserialize, Serialize};

use crate::frame::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_MAX_CONCURRENT_STREAMS, DEFAULT_MAX_FRAME_SIZE};

/// Protocol settings advertised to (and enforced against) the peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Http2Config {
    /// Receive window for each stream (SETTINGS_INITIAL_WINDOW_SIZE).
    #[serde(default = "default_initial_window_size")]
    pub initial_window_size: u32,

    /// Receive window for the whole connection. Anything above 65535 is
    /// granted with a WINDOW_UPDATE right after the preface.
    #[serde(default = "default_connection_window_size")]
    pub connection_window_size: u32,

    /// Largest frame payload we accept (SETTINGS_MAX_FRAME_SIZE).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,

    /// HPACK decoder table size (SETTINGS_HEADER_TABLE_SIZE).
    #[serde(default = "default_header_table_size")]
    pub header_table_size: u32,

    /// Accept PUSH_PROMISE frames (SETTINGS_ENABLE_PUSH).
    #[serde(default)]
    pub enable_push: bool,

    /// Concurrent pushed streams the server may open.
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,

    /// Ignore WINDOW_UPDATE frames with a zero increment instead of treating
    /// them as a protocol error. Some servers send them.
    #[serde(default)]
    pub tolerate_zero_window_update: bool,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            initial_window_size: default_initial_window_size(),
            connection_window_size: default_connection_window_size(),
            max_frame_size: default_max_frame_size(),
            header_table_size: default_header_table_size(),
            enable_push: false,
            max_concurrent_streams: default_max_concurrent_streams(),
            tolerate_zero_window_update: false,
        }
    }
}

fn default_initial_window_size() -> u32 {
    1 << 20
}

fn default_connection_window_size() -> u32 {
    1 << 24
}

fn default_max_frame_size() -> u32 {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_header_table_size() -> u32 {
    DEFAULT_HEADER_TABLE_SIZE
}

fn default_max_concurrent_streams() -> u32 {
    DEFAULT_MAX_CONCURRENT_STREAMS
}

/// Called once when a connection closes, with the key it was cached under.
pub type CloseHook = Arc<dyn Fn(&CacheKey) + Send + Sync>;

/// Everything a connection needs from its owner besides the socket.
#[derive(Clone, Default)]
pub struct ConnectionContext {
    pub config: Http2Config,
    /// Close the connection after it has had no open streams for this long.
    pub idle_timeout: Option<Duration>,
    /// Default deadline for a response to start arriving. A request can
    /// override it.
    pub request_timeout: Option<Duration>,
    /// Lets a connection cache forget the connection.
    pub on_close: Option<CloseHook>,
}

impl ConnectionContext {
    pub fn new(config: Http2Config) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn on_close(mut self, hook: impl Fn(&CacheKey) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("config", &self.config)
            .field("idle_timeout", &self.idle_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Http2Config::default();
        assert_eq!(config.max_frame_size, 16_384);
        assert_eq!(config.header_table_size, 4_096);
        assert!(!config.enable_push);
        assert!(!config.tolerate_zero_window_update);
        assert!(config.connection_window_size > 65_535);
    }

    #[test]
    fn test_context_builder() {
        let ctx = ConnectionContext::new(Http2Config::default())
            .with_idle_timeout(Duration::from_secs(30))
            .on_close(|_| {});
        assert_eq!(ctx.idle_timeout, Some(Duration::from_secs(30)));
        assert!(ctx.request_timeout.is_none());
        assert!(format!("{ctx:?}").contains("on_close: true"));
    }
}
