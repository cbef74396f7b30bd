//! Error handling for Veloxfer

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("circuit open for host: {host}")]
    CircuitOpen { host: String },

    #[error("DNS resolution error: {0}")]
    Dns(String),

    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exceeded for user {user}: requested {requested} bytes")]
    QuotaExceeded { user: String, requested: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("channel error: {0}")]
    Channel(String),
}

impl Error {
    /// Stable machine-readable kind, paired with the human-readable
    /// `Display` message when failures are surfaced to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Network(_) => "network",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::Dns(_) => "dns",
            Error::Cancelled(_) => "cancelled",
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Database(_) => "database",
            Error::Sqlite(_) => "database",
            Error::Channel(_) => "channel",
        }
    }

    /// Transient errors are retried locally with backoff before they are
    /// recorded against the circuit breaker.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Dns(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(err: async_channel::SendError<T>) -> Self {
        Error::Channel(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(Error::Network("timed out".into()).kind(), "network");
        assert_eq!(
            Error::CircuitOpen { host: "x".into() }.kind(),
            "circuit_open"
        );
        assert_eq!(
            Error::QuotaExceeded { user: "u1".into(), requested: 10 }.kind(),
            "quota_exceeded"
        );
    }

    #[test]
    fn test_transience() {
        assert!(Error::Network("reset".into()).is_transient());
        assert!(Error::Dns("servfail".into()).is_transient());
        assert!(!Error::CircuitOpen { host: "x".into() }.is_transient());
        assert!(!Error::InvalidInput("bad".into()).is_transient());
    }
}
