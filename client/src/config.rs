//! Client configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Unknown keys are rejected.

use std::path::Path;
use std::time::Duration;

use http2::Http2Config;
use http2::frame::{DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE, MAX_WINDOW_SIZE};
use io_driver::{ConnectOptions, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FREE, ReactorConfig, SocketConfig};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Client configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Reactor and worker pool.
    #[serde(default)]
    pub reactor: ReactorSection,

    /// Socket and connection lifetime settings.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// HTTP/2 settings advertised to servers.
    #[serde(default)]
    pub http2: Http2Config,

    #[serde(default)]
    pub tls: TlsSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: ClientConfig = toml::from_str(&contents).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_frame_size = self.http2.max_frame_size;
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&max_frame_size) {
            return Err(ConfigError::Invalid(format!(
                "http2.max_frame_size ({max_frame_size}) must be between {DEFAULT_MAX_FRAME_SIZE} and {MAX_FRAME_SIZE}"
            )));
        }
        if self.http2.initial_window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::Invalid(format!(
                "http2.initial_window_size ({}) exceeds 2^31-1",
                self.http2.initial_window_size
            )));
        }
        if self.http2.connection_window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::Invalid(format!(
                "http2.connection_window_size ({}) exceeds 2^31-1",
                self.http2.connection_window_size
            )));
        }
        if self.connection.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "connection.read_buffer_size must be non-zero".to_string(),
            ));
        }
        if self.tls.alpn.is_empty() {
            return Err(ConfigError::Invalid(
                "tls.alpn must name at least one protocol".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker threads for the executor.
    pub fn threads(&self) -> usize {
        match self.reactor.threads {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }

    pub fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            nodeadline: Duration::from_millis(self.reactor.nodeadline_ms),
            ..Default::default()
        }
    }

    /// Socket options and handshake deadline. TLS is filled in by the
    /// client.
    pub fn connect_options(&self) -> ConnectOptions {
        let c = &self.connection;
        ConnectOptions {
            socket: SocketConfig {
                connect_timeout: Duration::from_millis(c.connect_timeout_ms),
                io_timeout: Duration::from_millis(c.io_timeout_ms),
                tcp_nodelay: c.tcp_nodelay,
                read_buffer_size: c.read_buffer_size,
                max_free_buffers: c.buffer_pool_size,
            },
            tls: None,
            handshake_timeout: Duration::from_millis(c.handshake_timeout_ms),
        }
    }
}

/// Reactor configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReactorSection {
    /// Longest the reactor waits when no timer is pending, in milliseconds.
    #[serde(default = "default_nodeadline_ms")]
    pub nodeadline_ms: u64,

    /// Executor threads (0 = one per CPU).
    #[serde(default)]
    pub threads: usize,
}

impl Default for ReactorSection {
    fn default() -> Self {
        Self {
            nodeadline_ms: default_nodeadline_ms(),
            threads: 0,
        }
    }
}

/// Connection configuration. Zero disables the optional timeouts.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for blocking reads and writes.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_tcp_nodelay")]
    pub tcp_nodelay: bool,

    /// Capacity of each pooled read buffer.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Idle read buffers kept per connection.
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,

    /// Close an HTTP/2 connection after this long without streams.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Default deadline for response headers.
    #[serde(default)]
    pub request_timeout_ms: u64,

    /// Idle HTTP/1.1 connections kept per origin.
    #[serde(default = "default_max_idle_per_origin")]
    pub max_idle_per_origin: usize,
}

impl ConnectionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.idle_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.request_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            tcp_nodelay: default_tcp_nodelay(),
            read_buffer_size: default_read_buffer_size(),
            buffer_pool_size: default_buffer_pool_size(),
            idle_timeout_ms: default_idle_timeout_ms(),
            request_timeout_ms: 0,
            max_idle_per_origin: default_max_idle_per_origin(),
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    /// ALPN protocols offered, most preferred first. `h2` is always moved
    /// to the front for HTTP/2 connections.
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,
}

impl TlsSection {
    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        self.alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
    }
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            alpn: default_alpn(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration. `RUST_LOG` overrides `level`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Include thread names; useful to tell reactor workers apart.
    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            thread_names: false,
        }
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn default_nodeadline_ms() -> u64 {
    io_driver::DEFAULT_NODEADLINE.as_millis() as u64
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_tcp_nodelay() -> bool {
    true
}

fn default_read_buffer_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_buffer_pool_size() -> usize {
    DEFAULT_MAX_FREE
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_max_idle_per_origin() -> usize {
    4
}

fn default_alpn() -> Vec<String> {
    vec!["h2".to_string(), "http/1.1".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_default() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_sections() {
        let config: ClientConfig = toml::from_str(
            r#"
            [reactor]
            nodeadline_ms = 250
            threads = 3

            [connection]
            connect_timeout_ms = 1000
            tcp_nodelay = false
            idle_timeout_ms = 0
            request_timeout_ms = 1500

            [http2]
            initial_window_size = 65535
            enable_push = true
            tolerate_zero_window_update = true

            [tls]
            alpn = ["http/1.1"]

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.threads(), 3);
        assert_eq!(config.reactor_config().nodeadline, Duration::from_millis(250));
        assert!(!config.connection.tcp_nodelay);
        assert_eq!(config.connection.idle_timeout(), None);
        assert_eq!(
            config.connection.request_timeout(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(config.http2.initial_window_size, 65_535);
        assert!(config.http2.enable_push);
        assert!(config.http2.tolerate_zero_window_update);
        assert_eq!(config.tls.alpn_protocols(), vec![b"http/1.1".to_vec()]);
        assert_eq!(config.logging.format, LogFormat::Json);

        let options = config.connect_options();
        assert_eq!(options.socket.connect_timeout, Duration::from_secs(1));
        assert!(!options.socket.tcp_nodelay);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<ClientConfig>("[connection]\nbogus = 1\n").is_err());
        assert!(toml::from_str::<ClientConfig>("[nope]\n").is_err());
    }

    #[test]
    fn test_validate_frame_size() {
        let mut config = ClientConfig::default();
        config.http2.max_frame_size = 1024;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = toml::to_string_pretty(&ClientConfig::default()).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, ClientConfig::default());
    }
}
