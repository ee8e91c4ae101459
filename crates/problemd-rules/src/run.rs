//! Handler processes for events

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::unistd::pipe2;
use problemd_config::Settings;
use std::collections::{BTreeMap, VecDeque};
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{EventRule, RuleError, RuleResult, load_rule_list, pop_command_for_event};

/// Receives handler output and decides whether to go on after each handler
pub trait RunObserver: Send {
    /// One line of merged stdout/stderr, without the trailing newline
    fn on_output(&mut self, line: &str);

    /// Called after each handler that exited with 0; non-zero stops the run
    fn post_run(&mut self, _dir: &Path) -> i32 {
        0
    }
}

/// Logs handler output at info level
#[derive(Debug, Default)]
pub struct LogObserver;

impl RunObserver for LogObserver {
    fn on_output(&mut self, line: &str) {
        info!(output = line, "Handler output");
    }
}

/// Keeps handler output in memory
#[derive(Debug, Default)]
pub struct OutputCollector {
    pub lines: Vec<String>,
}

impl RunObserver for OutputCollector {
    fn on_output(&mut self, line: &str) {
        debug!(output = line, "Handler output");
        self.lines.push(line.to_string());
    }
}

/// Rules and options for running events
pub struct RunState {
    rules_file: PathBuf,
    event_options: BTreeMap<String, Vec<(String, String)>>,
    rules: VecDeque<EventRule>,
    /// Handlers started since the state was created
    pub children_count: u32,
}

impl RunState {
    pub fn new(rules_file: impl Into<PathBuf>) -> Self {
        Self {
            rules_file: rules_file.into(),
            event_options: BTreeMap::new(),
            rules: VecDeque::new(),
            children_count: 0,
        }
    }

    /// Rules file and per-event options from the service settings
    pub fn from_settings(settings: &Settings) -> Self {
        let mut state = Self::new(settings.service.rules_file.clone());
        for event in settings.events.keys() {
            state
                .event_options
                .insert(event.clone(), settings.event_options(event));
        }
        state
    }

    pub fn with_event_options(mut self, event: &str, options: Vec<(String, String)>) -> Self {
        self.event_options.insert(event.to_string(), options);
        self
    }

    pub fn rules_file(&self) -> &Path {
        &self.rules_file
    }

    /// Load the rule list from the rules file
    pub fn prepare_commands(&mut self) {
        self.rules = load_rule_list(&self.rules_file).into();
        debug!(rules = self.rules.len(), file = %self.rules_file.display(), "Rules prepared");
    }

    pub fn free_commands(&mut self) {
        self.rules.clear();
    }

    /// Start the next handler for `event` on `dir`
    ///
    /// Returns `None` once no rule is left for the event.
    pub async fn spawn_next_command(
        &mut self,
        dir: &Path,
        event: &str,
    ) -> RuleResult<Option<RunningCommand>> {
        let mut rules = std::mem::take(&mut self.rules);
        let match_dir = dir.to_path_buf();
        let match_event = event.to_string();

        // Matching may wait for the directory lock
        let (rules, matched) = tokio::task::spawn_blocking(move || {
            let mut dd = None;
            let matched = pop_command_for_event(&mut rules, &match_event, &mut dd, Some(&match_dir));
            (rules, matched)
        })
        .await
        .map_err(|e| RuleError::Io(std::io::Error::other(e)))?;
        self.rules = rules;

        let Some(matched) = matched else {
            return Ok(None);
        };

        self.children_count += 1;
        let options = self.event_options.get(event).map(Vec::as_slice).unwrap_or(&[]);
        let running = spawn_handler(&matched.command, dir, event, options)?;
        Ok(Some(running))
    }
}

/// A started handler and the read end of its output pipe
pub struct RunningCommand {
    pub command: String,
    pub pid: Option<u32>,
    child: Child,
    output: BufReader<pipe::Receiver>,
}

impl RunningCommand {
    /// Next output line, or `None` at end of output
    pub async fn next_line(&mut self) -> RuleResult<Option<String>> {
        let mut buf = Vec::new();
        let n = self.output.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Wait for exit; returns the exit code, or the signal number plus 128
    pub async fn wait(mut self) -> RuleResult<i32> {
        let status = self.child.wait().await?;
        let code = match (status.code(), status.signal()) {
            (Some(code), _) => code,
            (None, Some(signal)) => signal + 128,
            (None, None) => -1,
        };
        debug!(pid = ?self.pid, command = %self.command, status = code, "Handler exited");
        Ok(code)
    }
}

fn spawn_handler(
    command: &str,
    dir: &Path,
    event: &str,
    options: &[(String, String)],
) -> RuleResult<RunningCommand> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
    fcntl(read_end.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
    let stderr_end = write_end.try_clone()?;

    let dump_dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());

    // The parent's write ends close when `cmd` goes out of scope
    let child = {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(dir)
            .env("DUMP_DIR", &dump_dir)
            .env("EVENT", event)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end));
        for (name, value) in options {
            cmd.env(name, value);
        }

        cmd.spawn().map_err(|e| RuleError::Spawn {
            command: command.to_string(),
            source: e,
        })?
    };

    let pid = child.id();
    info!(pid = ?pid, event, dir = %dir.display(), command, "Handler started");

    let receiver = pipe::Receiver::from_owned_fd(read_end)?;
    Ok(RunningCommand {
        command: command.to_string(),
        pid,
        child,
        output: BufReader::new(receiver),
    })
}

/// Run every handler for `event` on `dir` in rule order
///
/// Stops at the first handler exiting non-zero or the first non-zero
/// `post_run`. Returns the last status, 0 when no handler ran.
pub async fn run_event_on_dir(
    state: &mut RunState,
    dir: &Path,
    event: &str,
    observer: &mut dyn RunObserver,
) -> RuleResult<i32> {
    state.prepare_commands();

    let result = run_prepared(state, dir, event, observer).await;

    state.free_commands();
    result
}

async fn run_prepared(
    state: &mut RunState,
    dir: &Path,
    event: &str,
    observer: &mut dyn RunObserver,
) -> RuleResult<i32> {
    let mut status = 0;

    while let Some(mut running) = state.spawn_next_command(dir, event).await? {
        while let Some(line) = running.next_line().await? {
            observer.on_output(&line);
        }

        status = running.wait().await?;
        if status != 0 {
            warn!(event, dir = %dir.display(), status, "Handler failed");
            break;
        }

        status = observer.post_run(dir);
        if status != 0 {
            debug!(event, status, "Run stopped after handler");
            break;
        }
    }

    Ok(status)
}
