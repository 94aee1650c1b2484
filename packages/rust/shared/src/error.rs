//! Error types for Varnika.
//!
//! Library crates use [`VarnikaError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! External capabilities (search, fetch, language models) report failures as
//! [`UpstreamError`]. Only the rate-limited gate looks at
//! [`UpstreamError::RateLimited`]; everything else converts straight into a
//! [`VarnikaError`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for all Varnika operations.
#[derive(Debug, thiserror::Error)]
pub enum VarnikaError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Retry budget for a rate-limited call was exhausted.
    #[error("rate limit exceeded for {operation} after {attempts} attempts")]
    RateLimitExceeded { operation: String, attempts: u32 },

    /// Non-retryable failure reported by an external service.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// A call or a whole job ran past its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the job.
    #[error("cancelled")]
    Cancelled,

    /// The sources ledger stayed locked by another writer for too long.
    #[error("timed out after {waited_ms}ms waiting for lock on {path:?}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    /// Malformed request or illegal state change.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Unknown job id or missing artifact.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, VarnikaError>;

impl VarnikaError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error from any displayable message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Machine-readable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::Upstream(_) => ErrorKind::UpstreamFailure,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Io { .. } => ErrorKind::Io,
        }
    }
}

/// Stable, serializable error classification stored on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimitExceeded,
    UpstreamFailure,
    Timeout,
    Cancelled,
    LockTimeout,
    ValidationError,
    NotFound,
    Config,
    Storage,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::UpstreamFailure => "upstream_failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::LockTimeout => "lock_timeout",
            Self::ValidationError => "validation_error",
            Self::NotFound => "not_found",
            Self::Config => "config",
            Self::Storage => "storage",
            Self::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = VarnikaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rate_limit_exceeded" => Ok(Self::RateLimitExceeded),
            "upstream_failure" => Ok(Self::UpstreamFailure),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            "lock_timeout" => Ok(Self::LockTimeout),
            "validation_error" => Ok(Self::ValidationError),
            "not_found" => Ok(Self::NotFound),
            "config" => Ok(Self::Config),
            "storage" => Ok(Self::Storage),
            "io" => Ok(Self::Io),
            other => Err(VarnikaError::validation(format!("unknown error kind '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// UpstreamError
// ---------------------------------------------------------------------------

/// Failure reported by an external capability for a single call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// The service asked us to slow down (HTTP 429 or equivalent).
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The call did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// The service is down or refused the request.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The target could not be reached at all (DNS, connect, blocked).
    #[error("not reachable: {0}")]
    NotReachable(String),

    /// Any other failure (bad status, malformed payload, ...).
    #[error("{0}")]
    Failed(String),
}

impl UpstreamError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

impl From<UpstreamError> for VarnikaError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Timeout => VarnikaError::Timeout("upstream request".into()),
            UpstreamError::RateLimited { .. } => VarnikaError::RateLimitExceeded {
                operation: "upstream request".into(),
                attempts: 1,
            },
            other => VarnikaError::Upstream(other.to_string()),
        }
    }
}
