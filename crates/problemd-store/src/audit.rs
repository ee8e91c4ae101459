//! Audit event types

use chrono::{DateTime, Local};
use problemd_api::AuthorizationStatus;
use problemd_util::ObjectPath;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Service started
    ServiceStarted { problems: usize },

    /// Service stopped
    ServiceStopped,

    /// Client connected
    ClientConnected { client_id: String, uid: u32 },

    /// Client disconnected
    ClientDisconnected { client_id: String },

    /// A new problem was accepted
    ProblemCreated {
        entry: ObjectPath,
        dir: PathBuf,
        uid: u32,
    },

    /// A problem was deleted on a client's request
    ProblemDeleted {
        entry: ObjectPath,
        dir: PathBuf,
        caller_uid: u32,
    },

    /// A session's authorization changed
    AuthorizationChanged {
        session: ObjectPath,
        uid: u32,
        status: AuthorizationStatus,
    },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Local>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp: problemd_util::now(),
            event,
        }
    }
}
