//! Event types for problemd -> client streaming

use chrono::{DateTime, Local};
use problemd_util::ObjectPath;
use serde::{Deserialize, Serialize};

use crate::{API_VERSION, AuthorizationStatus, TaskDetails, TaskStatus};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Local>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: problemd_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A new problem was accepted (or a duplicate was detected)
    Crash { entry: ObjectPath, uid: u32 },

    /// A task owned by the receiving session changed status
    TaskStatusChanged {
        task: ObjectPath,
        status: TaskStatus,
    },

    /// A task owned by the receiving session published new details
    TaskDetailsChanged {
        task: ObjectPath,
        details: TaskDetails,
    },

    /// Authorization of the receiving session changed
    AuthorizationChanged {
        session: ObjectPath,
        status: AuthorizationStatus,
    },

    /// Service is shutting down
    Shutdown,
}
