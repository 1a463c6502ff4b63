//! Unified error type for the bridge, plus the fetch failure taxonomy.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a single forecast fetch failed.
///
/// Only the coordinator decides what to do with a failure; the client and
/// normalizer just report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Credentials were rejected (HTTP 401/403).
    Unauthorized,
    /// Provider asked us to slow down, optionally saying for how long.
    RateLimited { retry_after: Option<Duration> },
    /// Connection, DNS, TLS or 5xx failure.
    Unreachable,
    /// Response did not match the expected payload contract.
    MalformedResponse,
    /// Request exceeded the configured timeout.
    Timeout,
}

impl ErrorKind {
    /// Transient failures are retried through backoff; the rest wait for
    /// external state to change.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited { .. } | ErrorKind::Unreachable | ErrorKind::Timeout
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::RateLimited { .. } => "rate_limited",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::RateLimited {
                retry_after: Some(after),
            } => write!(f, "rate_limited (retry after {}s)", after.as_secs()),
            other => f.write_str(other.label()),
        }
    }
}

/// A failed fetch attempt. Cloneable so one poll result can be handed to
/// every caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn rate_limited(retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited { retry_after }, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unreachable, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedResponse, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Forecast fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Snapshot persistence error: {0}")]
    Persist(String),

    #[error("Coordinator stopped")]
    CoordinatorStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_split() {
        assert!(ErrorKind::Timeout.is_retriable());
        assert!(ErrorKind::Unreachable.is_retriable());
        assert!(ErrorKind::RateLimited { retry_after: None }.is_retriable());
        assert!(!ErrorKind::Unauthorized.is_retriable());
        assert!(!ErrorKind::MalformedResponse.is_retriable());
    }

    #[test]
    fn test_fetch_error_display_includes_retry_after() {
        let err = FetchError::rate_limited(Some(Duration::from_secs(120)), "slow down");
        assert_eq!(err.to_string(), "rate_limited (retry after 120s): slow down");
    }
}
