use io_driver::CacheKey;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client shut down")]
    Closed,
    #[error("cannot resolve {0}")]
    Resolve(String),
    /// TLS settled on something other than `h2`. The session was handed to
    /// the connection pool for HTTP/1.1 use.
    #[error("{key} negotiated {} instead of h2", protocol.as_deref().unwrap_or("no protocol"))]
    Downgraded {
        key: CacheKey,
        protocol: Option<String>,
    },
    #[error("http2 error: {0}")]
    Http2(#[from] http2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Whether sending the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http2(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(std::io::Error),
    #[error("parse error: {0}")]
    Parse(toml::de::Error),
    #[error("invalid value: {0}")]
    Invalid(String),
}
