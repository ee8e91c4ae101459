//! New-problem notifiers

use async_trait::async_trait;
use problemd_config::Settings;
use problemd_host_api::{HostError, HostResult, NotifyOutcome, ProblemNotifier};
use problemd_rules::{RunObserver, RunState, run_event_on_dir};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Event run on every new problem directory
pub const POST_CREATE_EVENT: &str = "post-create";

/// Output line prefix naming the directory a new problem duplicates
pub const DUP_OF_DIR_PREFIX: &str = "DUP_OF_DIR: ";

/// Notifies the crash daemon through its HTTP-like socket protocol
pub struct SocketNotifier {
    socket_path: PathBuf,
}

impl SocketNotifier {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn exchange(&self, dir: &Path) -> HostResult<String> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| HostError::Transport(format!("connect('{}'): {}", self.socket_path.display(), e)))?;

        stream
            .write_all(b"POST /creation_notification HTTP/1.1\r\n\r\n")
            .await?;
        stream
            .write_all(dir.as_os_str().as_encoded_bytes())
            .await?;
        stream.shutdown().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

/// Split a daemon response into the status code and the body
///
/// The body starts after the second newline.
pub fn parse_notification_response(response: &str) -> HostResult<(u32, String)> {
    let code = response
        .strip_prefix("HTTP/1.1 ")
        .and_then(|rest| {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u32>().ok()
        })
        .filter(|code| *code <= i32::MAX as u32)
        .ok_or_else(|| HostError::Protocol("response does not contain HTTP code".into()))?;

    let mut parts = response.splitn(3, '\n');
    let body = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(_), Some(body)) => body,
        _ => return Err(HostError::Protocol("response is missing the body separator".into())),
    };

    Ok((code, body.trim_end().to_string()))
}

#[async_trait]
impl ProblemNotifier for SocketNotifier {
    async fn notify_new_problem(&self, dir: &Path) -> HostResult<NotifyOutcome> {
        let response = self.exchange(dir).await?;
        let (code, body) = parse_notification_response(&response)?;
        debug!(dir = %dir.display(), code, "Notification answered");

        Ok(match code {
            200 => NotifyOutcome::Accepted,
            303 => NotifyOutcome::Duplicate(PathBuf::from(body)),
            410 => NotifyOutcome::Dropped,
            other => {
                warn!(dir = %dir.display(), code = other, message = %body, "Problem rejected");
                NotifyOutcome::Invalid
            }
        })
    }

    fn is_healthy(&self) -> bool {
        self.socket_path.exists()
    }
}

/// Watches `post-create` output for a duplicate marker
#[derive(Default)]
struct DuplicateWatcher {
    duplicate_of: Option<PathBuf>,
}

impl RunObserver for DuplicateWatcher {
    fn on_output(&mut self, line: &str) {
        if let Some(dup) = line.strip_prefix(DUP_OF_DIR_PREFIX) {
            self.duplicate_of = Some(PathBuf::from(dup.trim()));
        } else {
            info!(output = line, "post-create");
        }
    }
}

/// Runs the `post-create` event through the rule engine
pub struct PostCreateNotifier {
    state: Mutex<RunState>,
}

impl PostCreateNotifier {
    pub fn new(state: RunState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(RunState::from_settings(settings))
    }
}

#[async_trait]
impl ProblemNotifier for PostCreateNotifier {
    async fn notify_new_problem(&self, dir: &Path) -> HostResult<NotifyOutcome> {
        let mut watcher = DuplicateWatcher::default();
        let status = {
            let mut state = self.state.lock().await;
            run_event_on_dir(&mut state, dir, POST_CREATE_EVENT, &mut watcher)
                .await
                .map_err(|e| HostError::SpawnFailed(e.to_string()))?
        };

        if let Some(existing) = watcher.duplicate_of {
            info!(dir = %dir.display(), duplicate_of = %existing.display(), "Duplicate problem");
            return Ok(NotifyOutcome::Duplicate(existing));
        }
        if !dir.exists() {
            info!(dir = %dir.display(), "Problem directory removed by post-create");
            return Ok(NotifyOutcome::Dropped);
        }
        if status != 0 {
            warn!(dir = %dir.display(), status, "post-create failed");
            return Ok(NotifyOutcome::Invalid);
        }
        Ok(NotifyOutcome::Accepted)
    }
}
