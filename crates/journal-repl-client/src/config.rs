//! Client configuration.

use crate::error::ReplicationError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Port a journal origin listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 7075;

/// Default bound of the metadata scratch buffer.
pub const DEFAULT_MAX_METADATA_BYTES: usize = 16 * 1024 * 1024;

/// Replication client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Origin to connect to
    pub node: ServerNode,

    /// Secure channel settings
    pub ssl: SslConfig,

    /// Recovery from recoverable disconnects
    pub reconnect: ReconnectPolicy,

    /// Largest journal metadata blob accepted during a handshake
    pub max_metadata_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node: ServerNode::default(),
            ssl: SslConfig::default(),
            reconnect: ReconnectPolicy::default(),
            max_metadata_bytes: DEFAULT_MAX_METADATA_BYTES,
        }
    }
}

impl ClientConfig {
    /// Configuration targeting `node` with default settings otherwise.
    #[must_use]
    pub fn for_node(node: ServerNode) -> Self {
        Self {
            node,
            ..Self::default()
        }
    }
}

/// Address of a journal origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNode {
    /// Host name or IP address
    pub host: String,

    /// TCP port
    pub port: u16,
}

impl ServerNode {
    /// Create a node address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for ServerNode {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

impl fmt::Display for ServerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerNode {
    type Err = ReplicationError;

    /// Parse `host`, `host:port` or `tcp://host:port`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| {
            ReplicationError::Configuration(format!("invalid node address {input}: {reason}"))
        };

        if input.contains("://") {
            let url = Url::parse(input).map_err(|e| invalid(e.to_string()))?;

            if url.scheme() != "tcp" {
                return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
            }

            let host = url
                .host_str()
                .ok_or_else(|| invalid("missing host".to_string()))?;
            let port = url.port().unwrap_or(DEFAULT_PORT);

            return Ok(Self::new(host, port));
        }

        let mut parts = input.split(':');
        let host = parts
            .next()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let port = match parts.next() {
            None => DEFAULT_PORT,
            Some(port) => port
                .parse()
                .map_err(|_| invalid(format!("invalid port '{port}'")))?,
        };
        if parts.next().is_some() {
            return Err(invalid("too many ':' separators".to_string()));
        }

        Ok(Self::new(host, port))
    }
}

/// Secure channel settings.
///
/// The cryptographic handshake itself is supplied by a
/// [`SecureChannel`](crate::transport::SecureChannel) installed on the
/// connector; these settings are handed to it unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslConfig {
    /// Wrap the channel in a secure channel
    pub secure: bool,

    /// Name to verify the origin's certificate against
    pub server_name: Option<String>,

    /// Trusted certificates
    pub trust_store: Option<PathBuf>,
}

/// Reconnect budget and backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Handshake attempts per reconnect sequence
    pub retry_count: u32,

    /// Authentication failures tolerated per reconnect sequence
    pub login_retry_count: u32,

    /// Delay before each attempt
    pub sleep_between_retries: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            retry_count: 10,
            login_retry_count: 3,
            sleep_between_retries: Duration::from_secs(2),
        }
    }
}
