//! Where a request goes: scheme, host, port and an optional proxy.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::ClientError;

/// An origin server, optionally reached through a cleartext proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub proxy: Option<SocketAddr>,
    /// TLS server name when it differs from `host`.
    pub server_name: Option<String>,
}

impl Target {
    pub fn new(secure: bool, host: impl Into<String>, port: u16) -> Self {
        Self {
            secure,
            host: host.into(),
            port,
            proxy: None,
            server_name: None,
        }
    }

    /// Parse `host:port`, `[v6]:port`, or a bare host with the scheme's
    /// default port.
    pub fn parse(authority: &str, secure: bool) -> Result<Self, ClientError> {
        let default_port = if secure { 443 } else { 80 };
        let invalid = || ClientError::Resolve(authority.to_string());

        if let Some(rest) = authority.strip_prefix('[') {
            let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match rest.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if rest.is_empty() => default_port,
                None => return Err(invalid()),
            };
            return Ok(Self::new(secure, host, port));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                let port = port.parse().map_err(|_| invalid())?;
                Ok(Self::new(secure, host, port))
            }
            None if !authority.is_empty() => Ok(Self::new(secure, authority, default_port)),
            _ => Err(invalid()),
        }
    }

    pub fn via_proxy(mut self, proxy: SocketAddr) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }

    /// The `:authority` pseudo-header value.
    pub fn authority(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }

    pub(crate) fn resolve(&self) -> Result<SocketAddr, ClientError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(ClientError::Io)?
            .next()
            .ok_or_else(|| ClientError::Resolve(format!("{}:{}", self.host, self.port)))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.authority())
    }
}
