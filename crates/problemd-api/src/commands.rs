//! Command types for the problemd protocol

use problemd_util::{ClientId, ObjectPath, ProblemError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    API_VERSION, AuthorizeResult, ElementInfo, EntryProperties, ProblemInfo, SessionInfo,
    TaskInfo, TaskResults,
};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Number of file descriptors sent along with this line
    #[serde(default)]
    pub fd_count: u32,
    /// The command
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            fd_count: 0,
            command,
        }
    }

    pub fn with_fds(mut self, fd_count: u32) -> Self {
        self.fd_count = fd_count;
        self
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Number of file descriptors sent along with this line
    #[serde(default)]
    pub fd_count: u32,
    /// Response payload or error
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            fd_count: 0,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            fd_count: 0,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&ProblemError> for ErrorInfo {
    fn from(err: &ProblemError) -> Self {
        let (code, message) = match err {
            ProblemError::NotFound(m) => (ErrorCode::NotFound, m.clone()),
            ProblemError::AccessDenied(m) => (ErrorCode::AccessDenied, m.clone()),
            ProblemError::InvalidArgs(m) => (ErrorCode::InvalidArgs, m.clone()),
            ProblemError::InvalidState(m) => (ErrorCode::InvalidState, m.clone()),
            ProblemError::LimitsExceeded(m) => (ErrorCode::LimitsExceeded, m.clone()),
            ProblemError::QuotaExceeded(m) => (ErrorCode::QuotaExceeded, m.clone()),
            ProblemError::WouldBlock(m) => (ErrorCode::WouldBlock, m.clone()),
            ProblemError::NotADumpDir(m) => (ErrorCode::NotADumpDir, m.clone()),
            ProblemError::Io(m) => (ErrorCode::IoError, m.clone()),
            ProblemError::NotSupported(m) => (ErrorCode::NotSupported, m.clone()),
            ProblemError::Cancelled => (ErrorCode::Cancelled, err.to_string()),
            ProblemError::Internal(m) => (ErrorCode::InternalError, m.clone()),
        };
        Self::new(code, message)
    }
}

impl From<ProblemError> for ErrorInfo {
    fn from(err: ProblemError) -> Self {
        Self::from(&err)
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    AccessDenied,
    InvalidArgs,
    InvalidState,
    LimitsExceeded,
    QuotaExceeded,
    WouldBlock,
    NotADumpDir,
    IoError,
    NotSupported,
    Cancelled,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Create a new problem from element data
    NewProblem {
        data: ProblemInfo,
        #[serde(default)]
        flags: u32,
    },

    /// Get (or open) the caller's session
    GetSession,

    /// List problem entries visible to the caller
    GetProblems {
        #[serde(default)]
        flags: u32,
        #[serde(default)]
        options: BTreeMap<String, String>,
    },

    /// Load all elements of a problem
    GetProblemData { entry: ObjectPath },

    /// Delete problems, stopping at the first failure
    DeleteProblems { entries: Vec<ObjectPath> },

    // Entry commands

    ReadElements {
        entry: ObjectPath,
        names: Vec<String>,
        #[serde(default)]
        flags: u32,
    },

    SaveElements {
        entry: ObjectPath,
        elements: ProblemInfo,
        #[serde(default)]
        flags: u32,
    },

    DeleteElements {
        entry: ObjectPath,
        names: Vec<String>,
    },

    GetEntryProperties { entry: ObjectPath },

    // Session commands

    Authorize {
        session: ObjectPath,
        #[serde(default)]
        details: BTreeMap<String, String>,
    },

    /// Create a token another session of the same user can authorize with
    GenerateToken {
        session: ObjectPath,
        /// Validity in seconds, 0 selects the default
        #[serde(default)]
        duration: u32,
    },

    RevokeToken { session: ObjectPath, token: String },

    RevokeAuthorization { session: ObjectPath },

    GetSessionInfo { session: ObjectPath },

    // Task commands

    StartTask {
        task: ObjectPath,
        #[serde(default)]
        options: BTreeMap<String, String>,
    },

    CancelTask { task: ObjectPath },

    FinishTask { task: ObjectPath },

    GetTaskInfo { task: ObjectPath },

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    /// Unsubscribe from events
    UnsubscribeEvents,

    /// Ping for keepalive
    Ping,
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    /// Task path, entry path, or the null path for autonomous runs
    NewProblem {
        path: ObjectPath,
    },
    Session {
        path: ObjectPath,
    },
    Problems {
        entries: Vec<ObjectPath>,
    },
    ProblemData {
        elements: BTreeMap<String, ElementInfo>,
    },
    ProblemsDeleted,
    /// Handle values index into the descriptors sent with the response
    Elements {
        elements: ProblemInfo,
    },
    ElementsSaved,
    ElementsDeleted,
    EntryProperties(EntryProperties),
    Authorization {
        result: AuthorizeResult,
    },
    Token {
        token: String,
    },
    TokenRevoked,
    AuthorizationRevoked,
    SessionInfo(SessionInfo),
    TaskStarted,
    TaskCancelled,
    TaskFinished {
        results: TaskResults,
        code: i32,
    },
    TaskInfo(TaskInfo),
    Subscribed {
        client_id: ClientId,
    },
    Unsubscribed,
    Pong,
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    /// Real uid of the peer process
    pub uid: u32,
    /// Process ID if available
    pub pid: Option<i32>,
}

impl ClientInfo {
    pub fn new(uid: u32) -> Self {
        Self {
            client_id: ClientId::new(),
            uid,
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }
}
