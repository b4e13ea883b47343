//! Error types for the IRC daemon

use thiserror::Error;

/// Main error type for the IRC daemon
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Message parsing error: {0}")]
    MessageParse(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Nickname in use: {0}")]
    NickInUse(String),

    #[error("No such target: {0}")]
    NoSuchTarget(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Registration required")]
    RegistrationRequired,

    /// Severe server-link violation. The link that produced this is squit.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// CAPAB negotiation failed. The link is closed with an ERROR line.
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// Peer clock differs by more than the configured bound.
    #[error("Timestamp skew of {0} seconds exceeds the configured bound")]
    TsSkew(i64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("User error: {0}")]
    User(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Generic(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}

impl Error {
    /// Whether this error must tear down a server link (squit with ERROR).
    pub fn is_link_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_) | Error::CapabilityMismatch(_) | Error::TsSkew(_)
        )
    }
}
