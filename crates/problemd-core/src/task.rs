//! Cancellable asynchronous tasks
//!
//! A task pairs a [`TaskWork`] implementation with the generic status
//! machine. The service runs the work on the tokio runtime and applies the
//! returned [`TaskOutcome`]; the types here never perform I/O themselves.

use async_trait::async_trait;
use problemd_api::{TaskDetails, TaskInfo, TaskResults, TaskStatus};
use problemd_util::{ObjectPath, ProblemError, Result, fatal_bug};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Service;

/// Result key carrying the message of a failed task
pub const ERROR_MESSAGE_RESULT: &str = "Error.Message";

/// How one run of a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done { results: TaskResults, code: i32 },
    /// Paused; the task may be started again or cancelled
    Stopped,
    Failed { message: String, code: i32 },
    /// The run observed its cancellation token
    Cancelled,
}

/// The work behind a task
#[async_trait]
pub trait TaskWork: Send + Sync {
    /// Run until done, paused, failed or cancelled
    async fn run(&self, ctx: TaskContext) -> TaskOutcome;

    /// Undo partial work of a stopped or cancelled run
    async fn cancel(&self, ctx: TaskContext) -> Result<()>;
}

/// What the caller of `request_cancel` has to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAction {
    /// Nothing; either already cancelled or the running work will notice
    Nothing,
    /// The task is stopped, its work has to be undone
    Undo,
}

/// Handle given to running work
#[derive(Clone)]
pub struct TaskContext {
    service: Service,
    task: Option<ObjectPath>,
    token: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(service: Service, task: Option<ObjectPath>, token: CancellationToken) -> Self {
        Self {
            service,
            task,
            token,
        }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Path of the task, `None` for autonomous runs
    pub fn task(&self) -> Option<&ObjectPath> {
        self.task.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Set a detail on the task and notify its owner
    pub fn publish_detail(&self, key: &str, value: impl Into<String>) {
        if let Some(task) = &self.task {
            self.service.set_task_detail(task, key, value.into());
        }
    }
}

/// A registered task
pub struct Task {
    path: ObjectPath,
    session: ObjectPath,
    status: TaskStatus,
    details: TaskDetails,
    results: TaskResults,
    code: i32,
    token: CancellationToken,
    /// A stopped run is being undone
    undoing: bool,
    work: Arc<dyn TaskWork>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("path", &self.path)
            .field("session", &self.session)
            .field("status", &self.status)
            .field("code", &self.code)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new(path: ObjectPath, session: ObjectPath, work: Arc<dyn TaskWork>) -> Self {
        Self {
            path,
            session,
            status: TaskStatus::New,
            details: TaskDetails::new(),
            results: TaskResults::new(),
            code: 0,
            token: CancellationToken::new(),
            undoing: false,
            work,
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// Path of the owning session
    pub fn session(&self) -> &ObjectPath {
        &self.session
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn details(&self) -> &TaskDetails {
        &self.details
    }

    pub fn work(&self) -> Arc<dyn TaskWork> {
        Arc::clone(&self.work)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Change status, returning whether it changed
    ///
    /// Leaving a terminal status is a bug.
    pub fn set_status(&mut self, status: TaskStatus) -> bool {
        if self.status == status {
            return false;
        }
        if self.status.is_terminal() {
            fatal_bug(format!(
                "Task {} cannot move from {:?} to {:?}",
                self.path, self.status, status
            ));
        }
        debug!(task = %self.path, from = ?self.status, to = ?status, "Task status changed");
        self.status = status;
        true
    }

    /// Move to RUNNING with a fresh cancellation token
    pub fn begin_start(&mut self) -> Result<CancellationToken> {
        if self.undoing {
            return Err(ProblemError::invalid_state("Task is being cancelled"));
        }
        if !matches!(self.status, TaskStatus::New | TaskStatus::Stopped) {
            return Err(ProblemError::invalid_state(
                "Cannot start task that is not new or stopped",
            ));
        }
        self.token = CancellationToken::new();
        self.set_status(TaskStatus::Running);
        Ok(self.token.clone())
    }

    /// Decide how to cancel
    ///
    /// `Undo` is returned once per stopped run; the task refuses to start
    /// until the undo is over.
    pub fn request_cancel(&mut self) -> Result<CancelAction> {
        match self.status {
            TaskStatus::Canceled => Ok(CancelAction::Nothing),
            TaskStatus::Stopped if self.undoing => Ok(CancelAction::Nothing),
            TaskStatus::Running => {
                self.token.cancel();
                Ok(CancelAction::Nothing)
            }
            TaskStatus::Stopped => {
                self.undoing = true;
                Ok(CancelAction::Undo)
            }
            _ => Err(ProblemError::invalid_state(
                "Task is not in the state that allows cancelling",
            )),
        }
    }

    /// Record the end of a run and return the new status
    ///
    /// A cancelled run stays RUNNING until its work has been undone.
    pub fn apply_outcome(&mut self, outcome: TaskOutcome) -> Option<TaskStatus> {
        match outcome {
            TaskOutcome::Done { results, code } => {
                self.results = results;
                self.code = code;
                Some(TaskStatus::Done)
            }
            TaskOutcome::Stopped => Some(TaskStatus::Stopped),
            TaskOutcome::Failed { message, code } => {
                self.results = TaskResults::from([(ERROR_MESSAGE_RESULT.to_string(), message)]);
                self.code = code;
                Some(TaskStatus::Failed)
            }
            TaskOutcome::Cancelled => None,
        }
    }

    /// Give up an undo that failed; the task stays STOPPED
    pub fn abandon_cancel(&mut self) {
        self.undoing = false;
    }

    /// Move to CANCELED after an undo, unless a terminal status was reached
    pub fn finish_cancel(&mut self) -> bool {
        self.undoing = false;
        !self.status.is_terminal() && self.set_status(TaskStatus::Canceled)
    }

    pub fn set_detail(&mut self, key: &str, value: String) {
        self.details.insert(key.to_string(), value);
    }

    /// Results and code of a finished task
    pub fn finish(&self) -> Result<(TaskResults, i32)> {
        if !matches!(self.status, TaskStatus::Done | TaskStatus::Failed) {
            return Err(ProblemError::invalid_state("Cannot finalize undone task"));
        }
        Ok((self.results.clone(), self.code))
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            path: self.path.clone(),
            status: self.status,
            details: self.details.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    #[async_trait]
    impl TaskWork for Idle {
        async fn run(&self, _ctx: TaskContext) -> TaskOutcome {
            TaskOutcome::Stopped
        }

        async fn cancel(&self, _ctx: TaskContext) -> Result<()> {
            Ok(())
        }
    }

    fn task() -> Task {
        let session = ObjectPath::new("/org/freedesktop/Problems2/Session/s");
        Task::new(ObjectPath::for_task(&session, 0), session, Arc::new(Idle))
    }

    #[test]
    fn start_only_from_new_or_stopped() {
        let mut t = task();
        let token = t.begin_start().unwrap();
        assert_eq!(t.status(), TaskStatus::Running);
        assert!(matches!(t.begin_start(), Err(ProblemError::InvalidState(_))));

        assert_eq!(t.apply_outcome(TaskOutcome::Stopped), Some(TaskStatus::Stopped));
        t.set_status(TaskStatus::Stopped);
        let resumed = t.begin_start().unwrap();
        assert!(!token.is_cancelled());
        assert!(!resumed.is_cancelled());
    }

    #[test]
    fn cancel_by_status() {
        let mut t = task();
        assert!(matches!(t.request_cancel(), Err(ProblemError::InvalidState(_))));

        let token = t.begin_start().unwrap();
        assert_eq!(t.request_cancel().unwrap(), CancelAction::Nothing);
        assert!(token.is_cancelled());
        assert_eq!(t.apply_outcome(TaskOutcome::Cancelled), None);

        t.set_status(TaskStatus::Stopped);
        assert_eq!(t.request_cancel().unwrap(), CancelAction::Undo);

        assert!(t.finish_cancel());
        assert_eq!(t.status(), TaskStatus::Canceled);
        assert_eq!(t.request_cancel().unwrap(), CancelAction::Nothing);
    }

    #[test]
    fn undo_blocks_start() {
        let mut t = task();
        t.begin_start().unwrap();
        t.set_status(TaskStatus::Stopped);

        assert_eq!(t.request_cancel().unwrap(), CancelAction::Undo);
        assert_eq!(t.request_cancel().unwrap(), CancelAction::Nothing);
        assert!(matches!(t.begin_start(), Err(ProblemError::InvalidState(_))));
        assert_eq!(t.status(), TaskStatus::Stopped);

        assert!(t.finish_cancel());
        assert_eq!(t.status(), TaskStatus::Canceled);
    }

    #[test]
    fn finish_cancel_keeps_terminal_status() {
        let mut t = task();
        t.begin_start().unwrap();
        let status = t.apply_outcome(TaskOutcome::Failed {
            message: "gone".into(),
            code: 1,
        });
        t.set_status(status.unwrap());

        assert!(!t.finish_cancel());
        assert_eq!(t.status(), TaskStatus::Failed);
    }

    #[test]
    fn finish_after_done_or_failed() {
        let mut t = task();
        assert!(t.finish().is_err());
        t.begin_start().unwrap();

        let results = TaskResults::from([("NewProblem.Entry".to_string(), "/e".to_string())]);
        let status = t.apply_outcome(TaskOutcome::Done {
            results: results.clone(),
            code: 2,
        });
        t.set_status(status.unwrap());
        assert_eq!(t.finish().unwrap(), (results, 2));

        let mut t = task();
        t.begin_start().unwrap();
        let status = t.apply_outcome(TaskOutcome::Failed {
            message: "boom".into(),
            code: 1,
        });
        t.set_status(status.unwrap());
        let (results, code) = t.finish().unwrap();
        assert_eq!(results[ERROR_MESSAGE_RESULT], "boom");
        assert_eq!(code, 1);
    }

    #[test]
    fn unchanged_status_is_not_a_transition() {
        let mut t = task();
        assert!(!t.set_status(TaskStatus::New));
        assert!(t.set_status(TaskStatus::Running));
    }
}
