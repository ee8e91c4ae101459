//! Error types for problemd

use thiserror::Error;

/// Core error type for problemd operations
///
/// Every failure that reaches a client is expressed as one of these kinds;
/// the daemon maps them onto protocol error codes.
#[derive(Debug, Error)]
pub enum ProblemError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Temporary refusal, the caller may retry later
    #[error("Limits exceeded: {0}")]
    LimitsExceeded(String),

    /// Hard per-user limit reached
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Operation would block: {0}")]
    WouldBlock(String),

    #[error("Not a problem directory: {0}")]
    NotADumpDir(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProblemError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        Self::AccessDenied(msg.into())
    }

    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::InvalidArgs(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn limits(msg: impl Into<String>) -> Self {
        Self::LimitsExceeded(msg.into())
    }

    pub fn quota(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn would_block(msg: impl Into<String>) -> Self {
        Self::WouldBlock(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<std::io::Error> for ProblemError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProblemError>;

/// Report a broken internal invariant and abort the process.
///
/// Used where continuing would leave the object registries inconsistent.
pub fn fatal_bug(msg: impl std::fmt::Display) -> ! {
    tracing::error!(message = %msg, "BUG: internal invariant violated, aborting");
    std::process::abort()
}
