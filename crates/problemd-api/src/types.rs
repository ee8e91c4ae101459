//! Shared types for the problemd API

use bitflags::bitflags;
use problemd_util::ObjectPath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value of one problem element as it travels over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementValue {
    Text(String),
    Bytes(Vec<u8>),
    /// Index into the file descriptors sent along with the message
    Handle(u32),
}

impl ElementValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ElementValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for ElementValue {
    fn from(s: &str) -> Self {
        ElementValue::Text(s.to_string())
    }
}

impl From<String> for ElementValue {
    fn from(s: String) -> Self {
        ElementValue::Text(s)
    }
}

/// Element name -> value, as supplied to NewProblem and SaveElements
pub type ProblemInfo = BTreeMap<String, ElementValue>;

/// Incrementally published task details
pub type TaskDetails = BTreeMap<String, String>;

/// Final task results
pub type TaskResults = BTreeMap<String, String>;

bitflags! {
    /// Classification of a stored element
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ElementFlags: u32 {
        const BINARY = 0x01;
        const TEXT = 0x02;
        const EDITABLE = 0x04;
        const NOT_EDITABLE = 0x08;
        const LIST = 0x10;
        const UNIX_TIME = 0x20;
        const BIG_TEXT = 0x40;
    }
}

bitflags! {
    /// Flags of the NewProblem call
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NewProblemFlags: u32 {
        /// Register the task under the caller's session instead of running it autonomously
        const REGISTER_TASK = 0x1;
        /// Stop after the problem directory is written, before notifying
        const STOP_BEFORE_NOTIFY = 0x2;
        /// Start the registered task immediately
        const START = 0x4;
    }
}

bitflags! {
    /// Flags of the GetProblems call
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GetProblemsFlags: u32 {
        /// Include problems owned by other users
        const FOREIGN = 0x1;
        /// Include problems not yet confirmed by post-processing
        const NEW = 0x2;
    }
}

bitflags! {
    /// Flags of the Entry ReadElements call
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReadElementsFlags: u32 {
        const ALL_FD = 0x01;
        const ALL_TYPES = 0x02;
        const ONLY_TEXT = 0x04;
        const ONLY_BIG_TEXT = 0x08;
        const ONLY_BINARY = 0x10;
        const ALL_NO_FD = 0x20;
    }
}

bitflags! {
    /// Flags of the Entry SaveElements call
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SaveElementsFlags: u32 {
        const IO_ERROR_FATAL = 0x1;
        const UNSUPPORTED_ERROR_FATAL = 0x2;
        const ELEMENTS_COUNT_LIMIT_FATAL = 0x4;
        const DATA_SIZE_LIMIT_FATAL = 0x8;
        const ALL_FATAL = 0xF;
    }
}

/// Type, size and content of one element as returned by GetProblemData
///
/// Binary elements carry the full path of the backing file as content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub flags: u32,
    pub size: u64,
    pub content: String,
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Running,
    Stopped,
    Canceled,
    Failed,
    Done,
}

impl TaskStatus {
    pub fn code(self) -> i32 {
        match self {
            TaskStatus::New => 0,
            TaskStatus::Running => 1,
            TaskStatus::Stopped => 2,
            TaskStatus::Canceled => 3,
            TaskStatus::Failed => 4,
            TaskStatus::Done => 5,
        }
    }

    /// Whether the status never changes again
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Canceled | TaskStatus::Failed | TaskStatus::Done)
    }
}

/// Result codes of the NewProblem task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewProblemCode {
    Accepted,
    Failed,
    Duplicate,
    Dropped,
    InvalidData,
}

impl NewProblemCode {
    pub fn code(self) -> i32 {
        match self {
            NewProblemCode::Accepted => 0,
            NewProblemCode::Failed => 1,
            NewProblemCode::Duplicate => 2,
            NewProblemCode::Dropped => 3,
            NewProblemCode::InvalidData => 4,
        }
    }
}

/// Immediate answer of Session Authorize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizeResult {
    /// The session already is authorized
    Granted,
    /// A new authorization request was started
    Accepted,
    /// An authorization request is already in progress
    Pending,
}

impl AuthorizeResult {
    pub fn code(self) -> i32 {
        match self {
            AuthorizeResult::Granted => 0,
            AuthorizeResult::Accepted => 1,
            AuthorizeResult::Pending => 2,
        }
    }
}

/// Status carried by the AuthorizationChanged event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Authorized,
    Pending,
    NotAuthorized,
    Failed,
}

impl AuthorizationStatus {
    pub fn code(self) -> i32 {
        match self {
            AuthorizationStatus::Authorized => 0,
            AuthorizationStatus::Pending => 1,
            AuthorizationStatus::NotAuthorized => 2,
            AuthorizationStatus::Failed => 3,
        }
    }
}

/// Installed package the crashed binary belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub package: String,
    pub epoch: String,
    pub name: String,
    pub version: String,
    pub release: String,
}

/// One line of the `reported_to` element
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportInfo {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bthash: Option<String>,
}

/// Read-only properties of a problem entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryProperties {
    pub id: String,
    pub user: String,
    pub hostname: String,
    #[serde(rename = "type")]
    pub problem_type: String,
    pub executable: String,
    pub command_line: String,
    pub component: String,
    pub uuid: String,
    pub duphash: String,
    pub reason: String,
    pub technical_details: String,
    pub uid: u32,
    pub count: u32,
    pub first_occurrence: u64,
    pub last_occurrence: u64,
    pub package: PackageInfo,
    pub reports: Vec<ReportInfo>,
    pub elements: Vec<String>,
    pub is_reported: bool,
    pub can_be_reported: bool,
    pub is_remote: bool,
}

/// View of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub path: ObjectPath,
    pub uid: u32,
    pub is_authorized: bool,
    pub tasks: Vec<ObjectPath>,
}

/// View of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub path: ObjectPath,
    pub status: TaskStatus,
    pub details: TaskDetails,
}
