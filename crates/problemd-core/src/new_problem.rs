//! The NewProblem task: save client data, then hand it to post-processing

use async_trait::async_trait;
use problemd_api::{NewProblemCode, ProblemInfo, TaskResults};
use problemd_host_api::NotifyOutcome;
use problemd_util::{ObjectPath, Result};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{error, info, warn};

use crate::{TaskContext, TaskOutcome, TaskWork};

/// Detail naming the entry while post-processing has not confirmed it
pub const TEMPORARY_ENTRY_DETAIL: &str = "NewProblem.TemporaryEntry";

/// Result naming the problem entry
pub const ENTRY_RESULT: &str = "NewProblem.Entry";

/// Creates a problem entry and asks the notifier to accept it
///
/// The first run saves the data as a NEW entry. With `wait_before_notify`
/// the task then stops so the client can inspect or amend the entry; the
/// next start continues with the notification.
pub struct NewProblemWork {
    caller_uid: u32,
    input: Mutex<Option<(ProblemInfo, Vec<OwnedFd>)>>,
    wait_before_notify: AtomicBool,
    temp_entry: Mutex<Option<ObjectPath>>,
}

impl NewProblemWork {
    pub fn new(data: ProblemInfo, fds: Vec<OwnedFd>, caller_uid: u32, wait_before_notify: bool) -> Self {
        Self {
            caller_uid,
            input: Mutex::new(Some((data, fds))),
            wait_before_notify: AtomicBool::new(wait_before_notify),
            temp_entry: Mutex::new(None),
        }
    }

    fn temp_entry(&self) -> Option<ObjectPath> {
        self.temp_entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_temp_entry(&self, entry: Option<ObjectPath>) {
        *self.temp_entry.lock().unwrap_or_else(PoisonError::into_inner) = entry;
    }

    async fn create_entry(&self, ctx: &TaskContext) -> std::result::Result<ObjectPath, TaskOutcome> {
        let input = self.input.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some((data, fds)) = input else {
            return Err(failed(NewProblemCode::Failed, "Problem data has already been consumed"));
        };

        let entry = ctx
            .service()
            .create_problem_entry(data, fds, self.caller_uid)
            .await
            .map_err(|e| {
                warn!(uid = self.caller_uid, error = %e, "Failed to create new problem");
                failed(NewProblemCode::Failed, e.to_string())
            })?;

        self.set_temp_entry(Some(entry.clone()));
        ctx.publish_detail(TEMPORARY_ENTRY_DETAIL, entry.to_string());
        Ok(entry)
    }

    async fn notify(&self, ctx: &TaskContext, entry: &ObjectPath) -> TaskOutcome {
        let service = ctx.service();
        let Some(dir) = service.entry_dir(entry) else {
            return failed(NewProblemCode::Failed, "The new problem has disappeared");
        };

        let outcome = match service.notify_new_problem(&dir).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "Failed to notify the new problem directory");
                self.discard(ctx, entry).await;
                return failed(
                    NewProblemCode::Failed,
                    "Failed to notify the new problem directory",
                );
            }
        };

        match outcome {
            NotifyOutcome::Accepted => {
                if let Err(e) = service.confirm_entry(entry) {
                    return failed(NewProblemCode::Failed, e.to_string());
                }
                self.set_temp_entry(None);
                done(entry, NewProblemCode::Accepted)
            }
            NotifyOutcome::Duplicate(existing) => {
                info!(dir = %dir.display(), duplicate_of = %existing.display(), "Problem is a duplicate");
                self.discard(ctx, entry).await;
                match service.entry_for_dir(&existing) {
                    Some(existing_entry) => {
                        service.announce_crash(&existing_entry);
                        done(&existing_entry, NewProblemCode::Duplicate)
                    }
                    None => failed(
                        NewProblemCode::Failed,
                        format!("Duplicate problem '{}' is not registered", existing.display()),
                    ),
                }
            }
            NotifyOutcome::Dropped => {
                self.discard(ctx, entry).await;
                failed(NewProblemCode::Dropped, "Problem was dropped by post-processing")
            }
            NotifyOutcome::Invalid => {
                self.discard(ctx, entry).await;
                failed(NewProblemCode::InvalidData, "Problem data are invalid")
            }
        }
    }

    async fn discard(&self, ctx: &TaskContext, entry: &ObjectPath) {
        self.set_temp_entry(None);
        if let Err(e) = ctx.service().discard_entry(entry).await {
            error!(entry = %entry, error = %e, "Failed to remove temporary problem");
        }
    }
}

fn done(entry: &ObjectPath, code: NewProblemCode) -> TaskOutcome {
    TaskOutcome::Done {
        results: TaskResults::from([(ENTRY_RESULT.to_string(), entry.to_string())]),
        code: code.code(),
    }
}

fn failed(code: NewProblemCode, message: impl Into<String>) -> TaskOutcome {
    TaskOutcome::Failed {
        message: message.into(),
        code: code.code(),
    }
}

#[async_trait]
impl TaskWork for NewProblemWork {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome {
        let entry = match self.temp_entry() {
            Some(entry) => entry,
            None => match self.create_entry(&ctx).await {
                Ok(entry) => entry,
                Err(outcome) => return outcome,
            },
        };

        if ctx.is_cancelled() {
            return TaskOutcome::Cancelled;
        }

        if self.wait_before_notify.swap(false, Ordering::SeqCst) {
            return TaskOutcome::Stopped;
        }

        self.notify(&ctx, &entry).await
    }

    async fn cancel(&self, ctx: TaskContext) -> Result<()> {
        let Some(entry) = self.temp_entry() else {
            return Ok(());
        };
        self.set_temp_entry(None);
        ctx.service().discard_entry(&entry).await
    }
}
