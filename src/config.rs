// Server configuration with constructor-time validation

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration error, reported to the caller before the server starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listen address '{0}' (expected host:port)")]
    InvalidListenAddr(String),
    #[error("maximum concurrent connections must be at least 1")]
    ZeroConnectionLimit,
    #[error("poll timeout must be non-zero")]
    ZeroPollTimeout,
    #[error("handshake timeout must be non-zero")]
    ZeroHandshakeTimeout,
    #[error("unknown digest algorithm '{0}' (expected sha256 or sha512)")]
    UnknownDigest(String),
}

/// Keyed digest used for the authentication handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Parse a configuration identifier.
    pub fn from_identifier(identifier: &str) -> Result<Self, ConfigError> {
        match identifier.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(ConfigError::UnknownDigest(other.to_string())),
        }
    }

    pub fn identifier(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Server configuration.
///
/// Invalid values are rejected when the configuration is built, not when the
/// server first trips over them.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to. Port 0 asks the OS for an ephemeral
    /// port; the bound address is available from the server after bind.
    pub listen: SocketAddr,
    /// Maximum concurrent connections, authenticated or not. Connections
    /// beyond the limit wait in the accept backlog.
    pub max_connections: usize,
    /// Upper bound on one idle pass of the event loop; also the cadence of
    /// housekeeping (half-open handshake expiry).
    pub poll_timeout: Duration,
    /// How long a connection may sit in the handshake before it is dropped.
    pub handshake_timeout: Duration,
    /// Keyed digest for the challenge-response handshake.
    pub digest: DigestAlgorithm,
    /// Capacity of the registry-event queue handed to external observers.
    pub event_queue_capacity: usize,
}

impl ServerConfig {
    pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
    pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 64;

    /// Build a configuration listening on `listen` ("host:port").
    pub fn new(listen: &str) -> Result<Self, ConfigError> {
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(listen.to_string()))?;

        Ok(Self {
            listen,
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            poll_timeout: Self::DEFAULT_POLL_TIMEOUT,
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
            digest: DigestAlgorithm::default(),
            event_queue_capacity: Self::DEFAULT_EVENT_QUEUE_CAPACITY,
        })
    }

    pub fn with_max_connections(mut self, limit: usize) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::ZeroConnectionLimit);
        }
        self.max_connections = limit;
        Ok(self)
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::ZeroPollTimeout);
        }
        self.poll_timeout = timeout;
        Ok(self)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::ZeroHandshakeTimeout);
        }
        self.handshake_timeout = timeout;
        Ok(self)
    }

    pub fn with_digest(mut self, identifier: &str) -> Result<Self, ConfigError> {
        self.digest = DigestAlgorithm::from_identifier(identifier)?;
        Ok(self)
    }
}
