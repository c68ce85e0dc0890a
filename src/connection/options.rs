//! Connection Settings

use crate::error::DriverError;
use crate::protocol::parser::MAX_FRAME_SIZE;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new(crate::DEFAULT_HOST, crate::DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = DriverError;

    /// Parses `host:port`, or a bare `host` on the default port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DriverError::Validation("empty server address".to_string()));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse().map_err(|_| {
                    DriverError::Validation(format!("invalid port in server address `{}`", s))
                })?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(DriverError::Validation(format!(
                "missing host in server address `{}`",
                s
            ))),
            None => Ok(Self::new(s, crate::DEFAULT_PORT)),
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Authorization key sent during the handshake (empty for none)
    pub auth_key: String,

    /// Bound on TCP connect plus handshake (default: 20s)
    pub connect_timeout: Duration,

    /// Bound on waiting for each response (default: none)
    pub query_timeout: Option<Duration>,

    /// Largest accepted response payload
    pub max_frame_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auth_key: String::new(),
            connect_timeout: Duration::from_secs(20),
            query_timeout: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}
