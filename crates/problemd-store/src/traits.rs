//! Store trait definitions

use crate::{AuditEvent, StoreResult};

/// Append-only audit journal
pub trait AuditLog: Send + Sync {
    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    /// Check if the journal is healthy
    fn is_healthy(&self) -> bool;
}
