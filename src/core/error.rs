/// Custom error types for the download engine
use std::time::Duration;

/// Sub-classification of transient network failures, used to pick a
/// backoff profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransientKind {
    /// Connect/read/idle timeout or stall watchdog trip
    Timeout,
    /// 429/503 with or without Retry-After
    RateLimit,
    /// Connection reset/refused, DNS hiccup, partial disconnect
    Network,
}

/// Integrity failures after a transfer or merge.
#[derive(Debug, Clone, thiserror::Error, serde::Serialize)]
pub enum IntegrityError {
    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("chunk {index} size mismatch: expected {expected} bytes, found {actual}")]
    ChunkSizeMismatch {
        index: u32,
        expected: u64,
        actual: u64,
    },
}

/// Main error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Retryable network condition; `retry_after` carries a server-supplied delay
    #[error("transient network error: {message}")]
    TransientNetwork {
        kind: TransientKind,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Non-retryable HTTP status (400, 401, 403, 404, 410, ...)
    #[error("request rejected with status {status}")]
    Permanent4xx { status: u16 },

    /// 5xx beyond the retry budget
    #[error("server error {status}")]
    Permanent5xx { status: u16 },

    #[error("integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    /// Out of space, permission denied, invalid path, rename failure
    #[error("disk error: {0}")]
    Disk(String),

    /// State-machine violation, invalid input, unrecoverable missing metadata
    #[error("logic error: {0}")]
    Logic(String),

    /// Operation intentionally aborted by user or session invalidation
    #[error("operation cancelled")]
    Cancelled,

    /// Short-circuited at the per-host breaker; treated as transient
    #[error("circuit breaker open for host {host}")]
    CircuitOpen { host: String },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl EngineError {
    /// Whether the error should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::TransientNetwork { .. } | EngineError::CircuitOpen { .. }
        )
    }

    /// Short stable code recorded on attempts and surfaced as `last_error`.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::TransientNetwork { kind, .. } => match kind {
                TransientKind::Timeout => "TIMEOUT",
                TransientKind::RateLimit => "RATE_LIMITED",
                TransientKind::Network => "NETWORK",
            },
            EngineError::Permanent4xx { .. } => "HTTP_4XX",
            EngineError::Permanent5xx { .. } => "HTTP_5XX",
            EngineError::Integrity(IntegrityError::SizeMismatch { .. }) => "SIZE_MISMATCH",
            EngineError::Integrity(IntegrityError::HashMismatch { .. }) => "HASH_MISMATCH",
            EngineError::Integrity(IntegrityError::ChunkSizeMismatch { .. }) => {
                "CHUNK_SIZE_MISMATCH"
            }
            EngineError::Disk(_) => "DISK",
            EngineError::Logic(_) => "LOGIC",
            EngineError::Cancelled => "CANCELLED",
            EngineError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            EngineError::Store(_) => "STORE",
        }
    }

    /// Server-supplied retry delay, when one was parsed from Retry-After.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::TransientNetwork { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify an HTTP status outside the 2xx range.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => EngineError::TransientNetwork {
                kind: TransientKind::RateLimit,
                message: "429 Too Many Requests".to_string(),
                retry_after: Some(retry_after.unwrap_or(Duration::from_secs(60))),
            },
            503 => EngineError::TransientNetwork {
                kind: TransientKind::RateLimit,
                message: "503 Service Unavailable".to_string(),
                retry_after: Some(retry_after.unwrap_or(Duration::from_secs(30))),
            },
            400..=499 => EngineError::Permanent4xx { status },
            _ => EngineError::Permanent5xx { status },
        }
    }
}

/// Convert reqwest::Error, classifying timeouts vs other network faults.
impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransientKind::Timeout
        } else {
            TransientKind::Network
        };
        EngineError::TransientNetwork {
            kind,
            message: err.to_string(),
            retry_after: None,
        }
    }
}

/// Convert std::io::Error; ENOSPC/EACCES and friends are disk errors, the
/// rest surface as transient (a read error mid-stream is usually a
/// disconnect).
impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied
            | ErrorKind::NotFound
            | ErrorKind::AlreadyExists
            | ErrorKind::InvalidInput => EngineError::Disk(err.to_string()),
            ErrorKind::TimedOut => EngineError::TransientNetwork {
                kind: TransientKind::Timeout,
                message: err.to_string(),
                retry_after: None,
            },
            _ => {
                if err.raw_os_error() == Some(28) {
                    // ENOSPC
                    EngineError::Disk(format!("out of disk space: {err}"))
                } else {
                    EngineError::Disk(err.to_string())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            EngineError::from_status(404, None),
            EngineError::Permanent4xx { status: 404 }
        ));
        assert!(matches!(
            EngineError::from_status(500, None),
            EngineError::Permanent5xx { status: 500 }
        ));

        let rate = EngineError::from_status(429, None);
        assert!(rate.is_transient());
        assert_eq!(rate.retry_after(), Some(Duration::from_secs(60)));

        let unavailable = EngineError::from_status(503, None);
        assert_eq!(unavailable.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_retry_after_override() {
        let err = EngineError::from_status(429, Some(Duration::from_secs(120)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(EngineError::Cancelled.error_code(), "CANCELLED");
        assert_eq!(
            EngineError::Integrity(IntegrityError::SizeMismatch {
                expected: 10,
                actual: 9
            })
            .error_code(),
            "SIZE_MISMATCH"
        );
        assert!(!EngineError::Permanent4xx { status: 403 }.is_transient());
        assert!(EngineError::CircuitOpen {
            host: "a.com".into()
        }
        .is_transient());
    }
}
