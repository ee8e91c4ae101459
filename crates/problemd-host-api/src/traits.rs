//! Collaborator traits

use async_trait::async_trait;
use problemd_util::ProblemError;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Polkit-style action guarding access to every user's problems
pub const GET_ALL_ACTION: &str = "org.freedesktop.problems.getall";

/// Errors from collaborator operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type HostResult<T> = Result<T, HostError>;

impl From<HostError> for ProblemError {
    fn from(e: HostError) -> Self {
        match e {
            HostError::Io(io) => ProblemError::Io(io.to_string()),
            other => ProblemError::Internal(other.to_string()),
        }
    }
}

/// What post-processing decided about a new problem directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The directory is kept as a new problem
    Accepted,
    /// The problem was already known; the path is the existing directory
    Duplicate(PathBuf),
    /// Post-processing removed the directory
    Dropped,
    /// The data was rejected
    Invalid,
}

/// Post-processing of freshly saved problem directories
#[async_trait]
pub trait ProblemNotifier: Send + Sync {
    /// Hand over a complete problem directory
    async fn notify_new_problem(&self, dir: &Path) -> HostResult<NotifyOutcome>;

    /// Optional: check if the notifier is usable
    fn is_healthy(&self) -> bool {
        true
    }
}

/// One authorization question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub uid: u32,
    pub pid: Option<i32>,
    pub action: String,
    /// Message the policy agent may show to the user
    pub message: Option<String>,
}

impl AuthorizationRequest {
    pub fn get_all(uid: u32) -> Self {
        Self {
            uid,
            pid: None,
            action: GET_ALL_ACTION.to_string(),
            message: None,
        }
    }
}

/// Policy authority answering authorization questions
///
/// `Ok(false)` is a denial; an error means the question could not be
/// answered.
#[async_trait]
pub trait Authority: Send + Sync {
    async fn check_authorization(&self, request: &AuthorizationRequest) -> HostResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_errors_map_to_problem_errors() {
        let io = HostError::Io(std::io::Error::other("broken pipe"));
        assert!(matches!(ProblemError::from(io), ProblemError::Io(_)));

        let transport = HostError::Transport("refused".into());
        assert!(matches!(ProblemError::from(transport), ProblemError::Internal(_)));
    }

    #[test]
    fn get_all_request() {
        let request = AuthorizationRequest::get_all(1000);
        assert_eq!(request.action, GET_ALL_ACTION);
        assert_eq!(request.uid, 1000);
        assert!(request.message.is_none());
    }
}
