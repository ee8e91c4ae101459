//! Mock collaborators for testing

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{Authority, AuthorizationRequest, HostError, HostResult, NotifyOutcome, ProblemNotifier};

/// Notifier answering with a configurable outcome
#[derive(Clone)]
pub struct MockNotifier {
    /// Outcome for every notification
    pub outcome: Arc<Mutex<NotifyOutcome>>,

    /// Configure notification to fail
    pub fail: Arc<Mutex<bool>>,

    notified: Arc<Mutex<Vec<PathBuf>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self {
            outcome: Arc::new(Mutex::new(NotifyOutcome::Accepted)),
            fail: Arc::new(Mutex::new(false)),
            notified: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_outcome(self, outcome: NotifyOutcome) -> Self {
        self.set_outcome(outcome);
        self
    }

    pub fn set_outcome(&self, outcome: NotifyOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    /// Directories notified so far
    pub fn notified(&self) -> Vec<PathBuf> {
        self.notified.lock().unwrap().clone()
    }
}

impl Default for MockNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProblemNotifier for MockNotifier {
    async fn notify_new_problem(&self, dir: &Path) -> HostResult<NotifyOutcome> {
        self.notified.lock().unwrap().push(dir.to_path_buf());

        if *self.fail.lock().unwrap() {
            return Err(HostError::Transport("Mock notification failure".into()));
        }

        let outcome = self.outcome.lock().unwrap().clone();
        // Real post-processing removes dropped directories itself
        if outcome == NotifyOutcome::Dropped {
            let _ = std::fs::remove_dir_all(dir);
        }
        Ok(outcome)
    }
}

/// Authority with a fixed answer and an optional response delay
#[derive(Clone)]
pub struct MockAuthority {
    /// Answer for every request; `None` makes the check fail
    pub answer: Arc<Mutex<Option<bool>>>,

    /// Time before answering
    pub delay: Arc<Mutex<Option<Duration>>>,

    requests: Arc<Mutex<Vec<AuthorizationRequest>>>,
}

impl MockAuthority {
    pub fn granting() -> Self {
        Self::answering(Some(true))
    }

    pub fn denying() -> Self {
        Self::answering(Some(false))
    }

    pub fn failing() -> Self {
        Self::answering(None)
    }

    fn answering(answer: Option<bool>) -> Self {
        Self {
            answer: Arc::new(Mutex::new(answer)),
            delay: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn set_answer(&self, answer: Option<bool>) {
        *self.answer.lock().unwrap() = answer;
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<AuthorizationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Authority for MockAuthority {
    async fn check_authorization(&self, request: &AuthorizationRequest) -> HostResult<bool> {
        self.requests.lock().unwrap().push(request.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let answer = *self.answer.lock().unwrap();
        answer.ok_or_else(|| HostError::Internal("Mock authority failure".into()))
    }
}
