//! Shared error taxonomy (spec §7) for every citadel component.
//!
//! Component crates define their own narrower error enums where it helps
//! callers match on specifics, then convert into [`CitadelError`] at the
//! boundary where a caller only needs the coarse kind and retryability.

use std::fmt;

use thiserror::Error;

/// One of the defined migration failure codes (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationErrorCode {
    InProgress = 1001,
    Offline = 1002,
    StateNotAllowed = 1003,
    CannotStart = 1004,
    SaveFailed = 2001,
    LoadFailed = 2002,
    RouteUpdateFailed = 2003,
    Exception = 2099,
    CoordinatorException = 3001,
}

impl fmt::Display for MigrationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", *self as u32, self)
    }
}

/// The coarse error kinds a caller can see, independent of which component
/// raised them.
#[derive(Debug, Clone, Error)]
pub enum CitadelError {
    /// Channel closed, connect failed, serialize failed, malformed frame.
    /// Retryable by the RPC client subject to its configured retry count.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unknown service/method/paramTypes, service not found. Never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Raised by a server-side handler and propagated back with the
    /// originating exception's class name preserved.
    #[error("business error from {class}: {message}")]
    Business { class: String, message: String },

    /// A pending request's future was not completed within its timeout.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// SQL timeout, deadlock, connection reset: the writeback manager will
    /// re-enqueue the task up to its configured retry limit.
    #[error("transient persistence error: {0}")]
    PersistenceTransient(String),

    /// Constraint violation, schema mismatch: counted as a final failure and
    /// never surfaced to the business caller of `submit*` (fire-and-forget).
    #[error("permanent persistence error: {0}")]
    PersistencePermanent(String),

    /// One of the enumerated migration failure codes; always accompanies a
    /// session rollback.
    #[error("migration failed: {code} ({message})")]
    Migration {
        code: MigrationErrorCode,
        message: String,
    },
}

impl CitadelError {
    /// Whether a caller (RPC client retry logic, writeback worker) should
    /// attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CitadelError::Transport(_) | CitadelError::Timeout(_) | CitadelError::PersistenceTransient(_)
        )
    }
}

pub type CitadelResult<T> = Result<T, CitadelError>;
