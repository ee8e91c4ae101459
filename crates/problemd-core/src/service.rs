//! The problem service: registries of entries, sessions and tasks

use problemd_api::{
    AuthorizeResult, ClientInfo, ElementInfo, EntryProperties, EventPayload, GetProblemsFlags,
    NewProblemFlags, ProblemInfo, ReadElementsFlags, SaveElementsFlags, SessionInfo, TaskInfo,
    TaskResults, TaskStatus,
};
use problemd_config::Settings;
use problemd_host_api::{
    Authority, AuthorizationRequest, GET_ALL_ACTION, HostResult, NotifyOutcome, ProblemNotifier,
};
use problemd_store::{AuditEvent, AuditEventType, AuditLog, list_problem_dirs};
use problemd_util::{
    ClientId, ObjectPath, ProblemError, Result, ThrottleDecision, UserQuotas, epoch_secs, fatal_bug,
};
use std::collections::{BTreeMap, HashMap};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    AuthorizeStep, CancelAction, CoreEvent, EntryState, NewProblemWork, PEER_BUS_DETAIL,
    PEER_TOKEN_DETAIL, ProblemEntry, ReadLimits, SaveLimits, Session, Task, TaskContext,
    TaskOutcome, TaskWork, save_problem,
};

/// Authorization detail with the message shown by the policy agent
pub const AUTH_MESSAGE_DETAIL: &str = "message";

#[derive(Debug)]
struct EntryRecord {
    entry: ProblemEntry,
    owner: u32,
}

#[derive(Debug)]
struct ClientRecord {
    session: Option<ObjectPath>,
}

/// Everything guarded by the service mutex
struct ServiceState {
    entries: HashMap<ObjectPath, EntryRecord>,
    sessions: HashMap<ObjectPath, Session>,
    clients: HashMap<ClientId, ClientRecord>,
    tasks: HashMap<ObjectPath, Task>,
    quotas: UserQuotas,
}

struct ServiceInner {
    settings: Settings,
    notifier: Arc<dyn ProblemNotifier>,
    authority: Arc<dyn Authority>,
    audit: Arc<dyn AuditLog>,
    state: Mutex<ServiceState>,
    events: mpsc::UnboundedSender<CoreEvent>,
}

/// The problem service
///
/// Cloning is cheap; all clones share the same registries. The state mutex
/// is never held across an await point.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Create the service and the receiver of its client events
    pub fn new(
        settings: Settings,
        notifier: Arc<dyn ProblemNotifier>,
        authority: Arc<dyn Authority>,
        audit: Arc<dyn AuditLog>,
    ) -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let quotas = UserQuotas::new(
            settings.limits.throttling_magnitude,
            settings.limits.new_problems_batch,
        );

        let service = Self {
            inner: Arc::new(ServiceInner {
                settings,
                notifier,
                authority,
                audit,
                state: Mutex::new(ServiceState {
                    entries: HashMap::new(),
                    sessions: HashMap::new(),
                    clients: HashMap::new(),
                    tasks: HashMap::new(),
                    quotas,
                }),
                events: tx,
            }),
        };
        (service, rx)
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, client_id: &ClientId, payload: EventPayload) {
        // The receiver only goes away on shutdown
        let _ = self.inner.events.send(CoreEvent::new(client_id.clone(), payload));
    }

    fn audit(&self, event: AuditEventType) {
        if let Err(e) = self.inner.audit.append_audit(AuditEvent::new(event)) {
            warn!(error = %e, "Failed to append audit event");
        }
    }

    /// Register every problem directory found in the dump location
    pub async fn load_existing_problems(&self) -> Result<usize> {
        let location = self.inner.settings.service.dump_location.clone();
        let dirs = tokio::task::spawn_blocking(move || -> Result<Vec<(PathBuf, u32)>> {
            let dirs = match list_problem_dirs(&location) {
                Ok(dirs) => dirs,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(dir = %location.display(), "Dump location does not exist");
                    Vec::new()
                }
                Err(e) => return Err(e.into()),
            };
            Ok(dirs
                .into_iter()
                .filter_map(|dir| {
                    let owner = ProblemEntry::new(&dir, EntryState::Complete).owner()?;
                    Some((dir, owner))
                })
                .collect())
        })
        .await
        .map_err(|e| ProblemError::internal(format!("Loading problems panicked: {}", e)))??;

        let count = dirs.len();
        for (dir, owner) in dirs {
            self.register_entry(dir, EntryState::Complete, owner);
        }

        info!(count, "Loaded existing problems");
        self.audit(AuditEventType::ServiceStarted { problems: count });
        Ok(count)
    }

    fn register_entry(&self, dir: PathBuf, state: EntryState, owner: u32) -> ObjectPath {
        Self::register_entry_locked(&mut self.lock(), dir, state, owner)
    }

    fn register_entry_locked(
        state: &mut ServiceState,
        dir: PathBuf,
        entry_state: EntryState,
        owner: u32,
    ) -> ObjectPath {
        let path = ObjectPath::for_entry(&dir.to_string_lossy());
        if state.entries.contains_key(&path) {
            debug!(entry = %path, "Problem already registered");
            return path;
        }
        state.quotas.entry(owner).problems += 1;
        state.entries.insert(
            path.clone(),
            EntryRecord {
                entry: ProblemEntry::new(dir, entry_state),
                owner,
            },
        );
        debug!(entry = %path, owner, "Problem registered");
        path
    }

    fn unregister_entry(state: &mut ServiceState, path: &ObjectPath) -> Option<EntryRecord> {
        let record = state.entries.remove(path)?;
        let quota = state.quotas.entry(record.owner);
        quota.problems = quota.problems.saturating_sub(1);
        debug!(entry = %path, "Problem unregistered");
        Some(record)
    }

    fn entry(&self, path: &ObjectPath) -> Result<ProblemEntry> {
        self.lock()
            .entries
            .get(path)
            .map(|record| record.entry.clone())
            .ok_or_else(|| ProblemError::not_found("Requested Entry does not exist"))
    }

    /// Directory of a registered entry
    pub fn entry_dir(&self, path: &ObjectPath) -> Option<PathBuf> {
        self.lock()
            .entries
            .get(path)
            .map(|record| record.entry.dir().to_path_buf())
    }

    /// Entry registered for a problem directory
    pub fn entry_for_dir(&self, dir: &Path) -> Option<ObjectPath> {
        let path = ObjectPath::for_entry(dir.to_string_lossy().trim_end_matches('/'));
        self.lock().entries.contains_key(&path).then_some(path)
    }

    // Clients and sessions

    pub fn client_connected(&self, client: &ClientInfo) {
        self.lock()
            .clients
            .insert(client.client_id.clone(), ClientRecord { session: None });
        self.audit(AuditEventType::ClientConnected {
            client_id: client.client_id.to_string(),
            uid: client.uid,
        });
    }

    /// Destroy the client's session
    ///
    /// Running tasks are cancelled, stopped tasks are undone and pending
    /// authorization is abandoned.
    pub async fn client_disconnected(&self, client_id: &ClientId) {
        let mut undo = Vec::new();
        {
            let mut state = self.lock();
            let session_path = state
                .clients
                .remove(client_id)
                .and_then(|client| client.session);
            let Some(mut session) = session_path.and_then(|path| state.sessions.remove(&path)) else {
                drop(state);
                self.audit(AuditEventType::ClientDisconnected {
                    client_id: client_id.to_string(),
                });
                return;
            };

            for task_path in session.tasks().to_vec() {
                session.remove_task(&task_path);
                let Some(task) = state.tasks.remove(&task_path) else {
                    continue;
                };
                match task.status() {
                    TaskStatus::Running => task.token().cancel(),
                    TaskStatus::Stopped => undo.push((task_path, task.work())),
                    _ => {}
                }
            }

            session.revoke_authorization();

            let quota = state.quotas.entry(session.uid());
            if quota.sessions == 0 {
                fatal_bug(format!("User {} has no session to close", session.uid()));
            }
            quota.sessions -= 1;
            info!(session = %session.path(), uid = session.uid(), "Session closed");
        }

        for (task_path, work) in undo {
            let ctx = TaskContext::new(self.clone(), None, CancellationToken::new());
            if let Err(e) = work.cancel(ctx).await {
                error!(task = %task_path, error = %e, "Failed to cancel task of closed session");
            }
        }

        self.audit(AuditEventType::ClientDisconnected {
            client_id: client_id.to_string(),
        });
    }

    /// The caller's session, opened on first use
    pub fn get_session(&self, caller: &ClientInfo) -> Result<ObjectPath> {
        let mut state = self.lock();
        let Some(client) = state.clients.get(&caller.client_id) else {
            debug!(client_id = %caller.client_id, "Session requested by a disconnected client");
            return Err(ProblemError::not_found("Client is not connected"));
        };
        if let Some(path) = client.session.clone() {
            return Ok(path);
        }

        let limit = self.inner.settings.limits.clients;
        if state.quotas.session_count(caller.uid) >= limit {
            warn!(uid = caller.uid, limit, "User reached the limit of opened sessions");
            return Err(ProblemError::limits("Too many sessions opened"));
        }

        let session = Session::new(caller.client_id.clone(), caller.uid, caller.pid);
        let path = session.path().clone();
        if state.sessions.contains_key(&path) {
            fatal_bug(format!("Session {} registered twice", path));
        }
        state.sessions.insert(path.clone(), session);
        state.quotas.entry(caller.uid).sessions += 1;
        if let Some(client) = state.clients.get_mut(&caller.client_id) {
            client.session = Some(path.clone());
        }

        info!(session = %path, uid = caller.uid, "Session opened");
        Ok(path)
    }

    /// Uid checks are made against; 0 for an authorized session
    pub fn caller_uid(&self, caller: &ClientInfo) -> u32 {
        let state = self.lock();
        let authorized = state
            .clients
            .get(&caller.client_id)
            .and_then(|client| client.session.as_ref())
            .and_then(|path| state.sessions.get(path))
            .is_some_and(Session::is_authorized);
        if authorized { 0 } else { caller.uid }
    }

    fn with_session<T>(
        &self,
        caller: &ClientInfo,
        path: &ObjectPath,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(path)
            .ok_or_else(|| ProblemError::not_found("Requested Session does not exist"))?;
        session.check_sanity(&caller.client_id, caller.uid)?;
        f(session)
    }

    fn announce_authorization(&self, session: &Session, status: Option<problemd_api::AuthorizationStatus>) {
        let Some(status) = status else {
            return;
        };
        self.emit(
            session.client_id(),
            EventPayload::AuthorizationChanged {
                session: session.path().clone(),
                status,
            },
        );
        self.audit(AuditEventType::AuthorizationChanged {
            session: session.path().clone(),
            uid: session.uid(),
            status,
        });
    }

    pub fn authorize(
        &self,
        caller: &ClientInfo,
        path: &ObjectPath,
        details: &BTreeMap<String, String>,
    ) -> Result<AuthorizeResult> {
        match (details.get(PEER_BUS_DETAIL), details.get(PEER_TOKEN_DETAIL)) {
            (Some(peer_bus), Some(token)) => self.authorize_by_peer(caller, path, peer_bus, token),
            (None, None) => self.authorize_by_authority(caller, path, details),
            _ => Err(ProblemError::invalid_args(
                "Invalid parameters peer-bus and peer-token.",
            )),
        }
    }

    fn authorize_by_peer(
        &self,
        caller: &ClientInfo,
        path: &ObjectPath,
        peer_bus: &str,
        token: &str,
    ) -> Result<AuthorizeResult> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get(path)
            .ok_or_else(|| ProblemError::not_found("Requested Session does not exist"))?;
        session.check_sanity(&caller.client_id, caller.uid)?;
        let uid = session.uid();

        let peer_path = ClientId::parse(peer_bus)
            .map(|peer| ObjectPath::for_session(&peer))
            .filter(|peer_path| {
                state
                    .sessions
                    .get(peer_path)
                    .is_some_and(|peer| peer.uid() == uid)
            })
            .ok_or_else(|| {
                ProblemError::access_denied(format!(
                    "Failed to authorize Session: No peer session for bus '{}'",
                    peer_bus
                ))
            })?;

        if let Some(peer) = state.sessions.get_mut(&peer_path) {
            peer.pass_authorization(uid, token, epoch_secs())?;
        }

        let Some(session) = state.sessions.get_mut(path) else {
            return Err(ProblemError::not_found("Requested Session does not exist"));
        };
        let status = session.grant_from_peer();
        info!(session = %path, peer = %peer_path, "Authorization passed from peer");
        self.announce_authorization(session, status);
        Ok(AuthorizeResult::Granted)
    }

    fn authorize_by_authority(
        &self,
        caller: &ClientInfo,
        path: &ObjectPath,
        details: &BTreeMap<String, String>,
    ) -> Result<AuthorizeResult> {
        let (request, token, uid, pid) = {
            let mut state = self.lock();
            let session = state
                .sessions
                .get_mut(path)
                .ok_or_else(|| ProblemError::not_found("Requested Session does not exist"))?;
            session.check_sanity(&caller.client_id, caller.uid)?;

            let (step, status) = session.begin_authorize();
            self.announce_authorization(session, status);
            match step {
                AuthorizeStep::Granted => return Ok(AuthorizeResult::Granted),
                AuthorizeStep::Pending => return Ok(AuthorizeResult::Pending),
                AuthorizeStep::Check { request, token } => {
                    (request, token, session.uid(), session.pid())
                }
            }
        };

        let authority_request = AuthorizationRequest {
            uid,
            pid,
            action: GET_ALL_ACTION.to_string(),
            message: details.get(AUTH_MESSAGE_DETAIL).cloned(),
        };
        let service = self.clone();
        let path = path.clone();
        tokio::spawn(async move {
            let answer = tokio::select! {
                _ = token.cancelled() => {
                    debug!(session = %path, "Authorization request cancelled");
                    return;
                }
                answer = service.inner.authority.check_authorization(&authority_request) => answer,
            };

            let granted = match answer {
                Ok(granted) => granted,
                Err(e) => {
                    error!(session = %path, error = %e, "Failed to check authorization");
                    false
                }
            };

            let mut state = service.lock();
            if let Some(session) = state.sessions.get_mut(&path) {
                let status = session.finish_authorize(request, granted);
                service.announce_authorization(session, status);
            }
        });

        Ok(AuthorizeResult::Accepted)
    }

    pub fn generate_token(&self, caller: &ClientInfo, path: &ObjectPath, duration: u32) -> Result<String> {
        self.with_session(caller, path, |session| {
            session.generate_token(u64::from(duration), epoch_secs())
        })
    }

    pub fn revoke_token(&self, caller: &ClientInfo, path: &ObjectPath, token: &str) -> Result<()> {
        self.with_session(caller, path, |session| {
            session.revoke_token(token);
            Ok(())
        })
    }

    pub fn revoke_authorization(&self, caller: &ClientInfo, path: &ObjectPath) -> Result<()> {
        self.with_session(caller, path, |session| {
            let status = session.revoke_authorization();
            self.announce_authorization(session, status);
            Ok(())
        })
    }

    pub fn session_info(&self, caller: &ClientInfo, path: &ObjectPath) -> Result<SessionInfo> {
        self.with_session(caller, path, |session| Ok(session.info()))
    }

    // Problems

    /// Create a problem through a NewProblem task
    ///
    /// Returns the task path when the task is registered, the null path
    /// when it runs on its own.
    pub fn new_problem(
        &self,
        caller: &ClientInfo,
        data: ProblemInfo,
        fds: Vec<OwnedFd>,
        flags: NewProblemFlags,
    ) -> Result<ObjectPath> {
        let session_path = self.get_session(caller)?;
        let caller_uid = self.caller_uid(caller);

        if !flags.contains(NewProblemFlags::REGISTER_TASK) {
            debug!(uid = caller_uid, "Running NewProblem task in autonomous mode");
            let work: Arc<dyn TaskWork> = Arc::new(NewProblemWork::new(data, fds, caller_uid, false));
            self.spawn_task(None, work, CancellationToken::new());
            return Ok(ObjectPath::null());
        }

        let work = Arc::new(NewProblemWork::new(
            data,
            fds,
            caller_uid,
            flags.contains(NewProblemFlags::STOP_BEFORE_NOTIFY),
        ));

        let task_path = {
            let mut state = self.lock();
            let session = state
                .sessions
                .get_mut(&session_path)
                .ok_or_else(|| ProblemError::not_found("Requested Session does not exist"))?;
            let task_path = session.add_task()?;
            state
                .tasks
                .insert(task_path.clone(), Task::new(task_path.clone(), session_path, work));
            task_path
        };
        debug!(task = %task_path, "NewProblem task registered");

        if flags.contains(NewProblemFlags::START) {
            self.start_task(caller, &task_path)?;
        }
        Ok(task_path)
    }

    /// Check the throttle, then save the data as a NEW entry
    pub(crate) async fn create_problem_entry(
        &self,
        data: ProblemInfo,
        fds: Vec<OwnedFd>,
        uid: u32,
    ) -> Result<ObjectPath> {
        let limit = self.inner.settings.limits.user_problems_for(uid);
        let decision = {
            let mut state = self.lock();
            let decision = state.quotas.can_create_new_problem(uid, epoch_secs(), limit);
            if matches!(decision, ThrottleDecision::Granted(_)) {
                // Held until the saved problem is registered
                state.quotas.entry(uid).problems += 1;
            }
            decision
        };
        match decision {
            ThrottleDecision::Granted(_) => {}
            ThrottleDecision::TooMany => {
                return Err(ProblemError::limits(
                    "Too many problems have been recently created",
                ));
            }
            ThrottleDecision::QuotaExceeded => {
                return Err(ProblemError::quota("You have exceeded the problem quota"));
            }
            ThrottleDecision::Error => {
                return Err(ProblemError::internal("Failed to check NewProblem limits"));
            }
        }

        let settings = self.inner.settings.clone();
        let saved = tokio::task::spawn_blocking(move || save_problem(&settings, data, fds, uid))
            .await
            .map_err(|e| ProblemError::internal(format!("Saving problem panicked: {}", e)))
            .and_then(|saved| saved);
        let owner = saved
            .as_ref()
            .ok()
            .map(|dir| ProblemEntry::new(dir, EntryState::New).owner().unwrap_or(uid));

        let mut state = self.lock();
        let quota = state.quotas.entry(uid);
        quota.problems = quota.problems.saturating_sub(1);
        let dir = saved?;
        Ok(Self::register_entry_locked(
            &mut state,
            dir,
            EntryState::New,
            owner.unwrap_or(uid),
        ))
    }

    pub(crate) async fn notify_new_problem(&self, dir: &Path) -> HostResult<NotifyOutcome> {
        self.inner.notifier.notify_new_problem(dir).await
    }

    /// Mark a NEW entry complete and announce it
    pub(crate) fn confirm_entry(&self, path: &ObjectPath) -> Result<()> {
        let (dir, owner) = {
            let mut state = self.lock();
            let record = state
                .entries
                .get_mut(path)
                .ok_or_else(|| ProblemError::not_found("Requested Entry does not exist"))?;
            record.entry.set_state(EntryState::Complete);
            (record.entry.dir().to_path_buf(), record.owner)
        };

        info!(entry = %path, dir = %dir.display(), uid = owner, "New problem accepted");
        self.audit(AuditEventType::ProblemCreated {
            entry: path.clone(),
            dir,
            uid: owner,
        });
        self.announce_crash(path);
        Ok(())
    }

    /// Send a Crash event to every session that can see the entry
    pub(crate) fn announce_crash(&self, path: &ObjectPath) {
        let state = self.lock();
        let Some(record) = state.entries.get(path) else {
            return;
        };
        for session in state.sessions.values() {
            if session.is_authorized() || session.uid() == record.owner {
                self.emit(
                    session.client_id(),
                    EventPayload::Crash {
                        entry: path.clone(),
                        uid: record.owner,
                    },
                );
            }
        }
    }

    /// Unregister an entry and remove its directory
    pub(crate) async fn discard_entry(&self, path: &ObjectPath) -> Result<()> {
        let record = Self::unregister_entry(&mut self.lock(), path);
        let Some(record) = record else {
            return Ok(());
        };
        let mut entry = record.entry;
        tokio::task::spawn_blocking(move || {
            if entry.dir().exists() {
                entry.delete(0)
            } else {
                Ok(())
            }
        })
        .await
        .map_err(|e| ProblemError::internal(format!("Removing problem panicked: {}", e)))?
    }

    /// Paths of the entries visible to the caller
    ///
    /// Deleted entries are never listed. NEW entries need `NEW`, entries the
    /// caller cannot access need `FOREIGN`.
    pub async fn get_problems(&self, caller: &ClientInfo, flags: GetProblemsFlags) -> Result<Vec<ObjectPath>> {
        let uid = self.caller_uid(caller);
        let candidates: Vec<(ObjectPath, ProblemEntry)> = self
            .lock()
            .entries
            .iter()
            .filter(|(_, record)| match record.entry.state() {
                EntryState::Deleted => false,
                EntryState::New => flags.contains(GetProblemsFlags::NEW),
                EntryState::Complete => true,
            })
            .map(|(path, record)| (path.clone(), record.entry.clone()))
            .collect();

        let foreign = flags.contains(GetProblemsFlags::FOREIGN);
        let mut paths = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .filter(|(_, entry)| foreign || entry.accessible_by(uid))
                .map(|(path, _)| path)
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| ProblemError::internal(format!("Listing problems panicked: {}", e)))?;

        paths.sort();
        Ok(paths)
    }

    pub async fn get_problem_data(
        &self,
        caller: &ClientInfo,
        path: &ObjectPath,
    ) -> Result<BTreeMap<String, ElementInfo>> {
        let uid = self.caller_uid(caller);
        let entry = self.entry(path)?;
        blocking(move || entry.problem_data(uid)).await
    }

    /// Delete problems in order, stopping at the first failure
    pub async fn delete_problems(&self, caller: &ClientInfo, paths: &[ObjectPath]) -> Result<()> {
        let uid = self.caller_uid(caller);
        for path in paths {
            let mut entry = self.entry(path)?;
            if entry.state() == EntryState::New {
                return Err(ProblemError::invalid_state(
                    "Cannot delete a problem that is not complete",
                ));
            }

            let dir = entry.dir().to_path_buf();
            blocking(move || entry.delete(uid)).await?;

            Self::unregister_entry(&mut self.lock(), path);
            info!(entry = %path, dir = %dir.display(), caller_uid = uid, "Problem deleted");
            self.audit(AuditEventType::ProblemDeleted {
                entry: path.clone(),
                dir,
                caller_uid: uid,
            });
        }
        Ok(())
    }

    pub async fn read_elements(
        &self,
        caller: &ClientInfo,
        path: &ObjectPath,
        names: Vec<String>,
        flags: ReadElementsFlags,
    ) -> Result<(ProblemInfo, Vec<OwnedFd>)> {
        let uid = self.caller_uid(caller);
        let entry = self.entry(path)?;
        let limits = ReadLimits {
            max_size: self.inner.settings.limits.max_message_size,
            max_fds: self.inner.settings.limits.max_message_unix_fds,
        };
        blocking(move || entry.read_elements(uid, &names, flags, limits)).await
    }

    pub async fn save_elements(
        &self,
        caller: &ClientInfo,
        path: &ObjectPath,
        elements: ProblemInfo,
        fds: Vec<OwnedFd>,
        flags: SaveElementsFlags,
    ) -> Result<()> {
        let uid = self.caller_uid(caller);
        let entry = self.entry(path)?;
        let limits = SaveLimits {
            elements: self.inner.settings.limits.elements_for(uid),
            data_size: self.inner.settings.limits.data_size_for(uid),
        };
        blocking(move || entry.save_elements(uid, elements, fds, flags, limits)).await
    }

    pub async fn delete_elements(&self, caller: &ClientInfo, path: &ObjectPath, names: Vec<String>) -> Result<()> {
        let uid = self.caller_uid(caller);
        let entry = self.entry(path)?;
        blocking(move || entry.delete_elements(uid, &names)).await
    }

    pub async fn entry_properties(&self, caller: &ClientInfo, path: &ObjectPath) -> Result<EntryProperties> {
        let uid = self.caller_uid(caller);
        let entry = self.entry(path)?;
        blocking(move || entry.properties(uid)).await
    }

    // Tasks

    fn with_task<T>(
        &self,
        caller: &ClientInfo,
        path: &ObjectPath,
        f: impl FnOnce(&mut Task) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        let owns = state
            .clients
            .get(&caller.client_id)
            .and_then(|client| client.session.as_ref())
            .and_then(|session| state.sessions.get(session))
            .is_some_and(|session| session.uid() == caller.uid && session.owns_task(path));
        if !owns {
            return Err(ProblemError::access_denied(
                "The task does not belong to your session",
            ));
        }
        let task = state
            .tasks
            .get_mut(path)
            .ok_or_else(|| ProblemError::not_found("Requested Task does not exist"))?;
        f(task)
    }

    fn announce_task_status(&self, state: &ServiceState, task: &ObjectPath, status: TaskStatus) {
        let Some(owner) = state
            .tasks
            .get(task)
            .and_then(|t| state.sessions.get(t.session()))
        else {
            return;
        };
        self.emit(
            owner.client_id(),
            EventPayload::TaskStatusChanged {
                task: task.clone(),
                status,
            },
        );
    }

    fn remove_task(state: &mut ServiceState, path: &ObjectPath) {
        if let Some(task) = state.tasks.remove(path)
            && let Some(session) = state.sessions.get_mut(task.session())
        {
            session.remove_task(path);
        }
        debug!(task = %path, "Task unregistered");
    }

    pub fn start_task(&self, caller: &ClientInfo, path: &ObjectPath) -> Result<()> {
        let (token, work) = self.with_task(caller, path, |task| {
            let token = task.begin_start()?;
            Ok((token, task.work()))
        })?;
        self.announce_task_status(&self.lock(), path, TaskStatus::Running);
        self.spawn_task(Some(path.clone()), work, token);
        Ok(())
    }

    pub async fn cancel_task(&self, caller: &ClientInfo, path: &ObjectPath) -> Result<()> {
        let (action, work, token) = self.with_task(caller, path, |task| {
            Ok((task.request_cancel()?, task.work(), task.token().clone()))
        })?;
        if action == CancelAction::Nothing {
            return Ok(());
        }

        let undone = work
            .cancel(TaskContext::new(self.clone(), Some(path.clone()), token))
            .await;

        let mut state = self.lock();
        if let Err(e) = undone {
            if let Some(task) = state.tasks.get_mut(path) {
                task.abandon_cancel();
            }
            return Err(e);
        }
        if let Some(task) = state.tasks.get_mut(path)
            && task.finish_cancel()
        {
            self.announce_task_status(&state, path, TaskStatus::Canceled);
        }
        Self::remove_task(&mut state, path);
        Ok(())
    }

    /// Results of a finished task; the task is removed afterwards
    pub fn finish_task(&self, caller: &ClientInfo, path: &ObjectPath) -> Result<(TaskResults, i32)> {
        let finished = self.with_task(caller, path, |task| task.finish())?;
        Self::remove_task(&mut self.lock(), path);
        Ok(finished)
    }

    pub fn task_info(&self, caller: &ClientInfo, path: &ObjectPath) -> Result<TaskInfo> {
        self.with_task(caller, path, |task| Ok(task.info()))
    }

    pub(crate) fn set_task_detail(&self, path: &ObjectPath, key: &str, value: String) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(task) = state.tasks.get_mut(path) else {
            return;
        };
        task.set_detail(key, value);
        let details = task.details().clone();
        if let Some(owner) = state.sessions.get(task.session()) {
            self.emit(
                owner.client_id(),
                EventPayload::TaskDetailsChanged {
                    task: path.clone(),
                    details,
                },
            );
        }
    }

    fn spawn_task(&self, path: Option<ObjectPath>, work: Arc<dyn TaskWork>, token: CancellationToken) {
        let service = self.clone();
        tokio::spawn(async move {
            let ctx = TaskContext::new(service.clone(), path.clone(), token);
            let outcome = work.run(ctx.clone()).await;
            service.complete_task(path, work, ctx, outcome).await;
        });
    }

    async fn complete_task(
        &self,
        path: Option<ObjectPath>,
        work: Arc<dyn TaskWork>,
        ctx: TaskContext,
        outcome: TaskOutcome,
    ) {
        let registered = path.filter(|p| self.lock().tasks.contains_key(p));
        let Some(path) = registered else {
            // Autonomous, or the owning session is gone
            match outcome {
                TaskOutcome::Stopped | TaskOutcome::Cancelled => {
                    if let Err(e) = work.cancel(ctx).await {
                        error!(error = %e, "Failed to cancel task");
                    }
                }
                TaskOutcome::Failed { message, code } => {
                    warn!(code, message = %message, "Task failed");
                }
                TaskOutcome::Done { code, .. } => debug!(code, "Task finished"),
            }
            return;
        };

        if outcome == TaskOutcome::Cancelled {
            if let Err(e) = work.cancel(ctx).await {
                error!(task = %path, error = %e, "Failed to undo cancelled task");
            }
            let mut state = self.lock();
            if let Some(task) = state.tasks.get_mut(&path)
                && task.finish_cancel()
            {
                self.announce_task_status(&state, &path, TaskStatus::Canceled);
            }
            Self::remove_task(&mut state, &path);
            return;
        }

        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(&path) else {
            return;
        };
        if let Some(status) = task.apply_outcome(outcome)
            && task.set_status(status)
        {
            self.announce_task_status(&state, &path, status);
        }
    }

    /// Tell every client the service is going away
    pub fn shutdown(&self) {
        let clients: Vec<ClientId> = self.lock().clients.keys().cloned().collect();
        for client in clients {
            self.emit(&client, EventPayload::Shutdown);
        }
        self.audit(AuditEventType::ServiceStopped);
    }
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProblemError::internal(format!("Blocking operation panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ENTRY_RESULT, ERROR_MESSAGE_RESULT, TEMPORARY_ENTRY_DETAIL};
    use problemd_api::{AuthorizationStatus, ElementValue, NewProblemCode};
    use problemd_host_api::{MockAuthority, MockNotifier};
    use problemd_store::{DumpDir, SqliteAuditLog};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _root: TempDir,
        service: Service,
        events: mpsc::UnboundedReceiver<CoreEvent>,
        notifier: MockNotifier,
        authority: MockAuthority,
        audit: Arc<SqliteAuditLog>,
    }

    fn fixture_with(configure: impl FnOnce(&mut Settings)) -> Fixture {
        let root = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.service.dump_location = root.path().to_path_buf();
        configure(&mut settings);

        let notifier = MockNotifier::new();
        let authority = MockAuthority::denying();
        let audit = Arc::new(SqliteAuditLog::in_memory().unwrap());
        let (service, events) = Service::new(
            settings,
            Arc::new(notifier.clone()),
            Arc::new(authority.clone()),
            audit.clone(),
        );
        Fixture {
            _root: root,
            service,
            events,
            notifier,
            authority,
            audit,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    impl Fixture {
        /// A freshly connected client
        fn client(&self, uid: u32) -> ClientInfo {
            let client = ClientInfo::new(uid);
            self.service.client_connected(&client);
            client
        }
    }

    fn crash_data() -> ProblemInfo {
        ProblemInfo::from([
            ("type".to_string(), ElementValue::from("Python3")),
            ("reason".to_string(), ElementValue::from("ZeroDivisionError")),
            ("executable".to_string(), ElementValue::from("/usr/bin/calc")),
        ])
    }

    fn existing_problem(f: &Fixture, name: &str, uid: u32) -> PathBuf {
        let dd = DumpDir::create(f.service.settings().service.dump_location.join(name), None, 0o640).unwrap();
        dd.save_text("time", "1700000000").unwrap();
        dd.save_u32("uid", uid).unwrap();
        dd.save_text("type", "CCpp").unwrap();
        dd.path().to_path_buf()
    }

    async fn wait_for(service: &Service, caller: &ClientInfo, task: &ObjectPath, status: TaskStatus) -> TaskInfo {
        for _ in 0..500 {
            let info = service.task_info(caller, task).unwrap();
            if info.status == status {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached {:?}", task, status);
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<CoreEvent>) -> Vec<CoreEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn new_problem_task_runs_to_done() {
        let mut f = fixture();
        let caller = f.client(1000);

        let task = f
            .service
            .new_problem(
                &caller,
                crash_data(),
                Vec::new(),
                NewProblemFlags::REGISTER_TASK | NewProblemFlags::START,
            )
            .unwrap();
        assert!(!task.is_null());

        let info = wait_for(&f.service, &caller, &task, TaskStatus::Done).await;
        assert!(info.details.contains_key(TEMPORARY_ENTRY_DETAIL));

        let (results, code) = f.service.finish_task(&caller, &task).unwrap();
        assert_eq!(code, 0);
        let entry = ObjectPath::new(results[ENTRY_RESULT].clone());

        let problems = f.service.get_problems(&caller, GetProblemsFlags::empty()).await.unwrap();
        assert_eq!(problems, vec![entry.clone()]);
        assert_eq!(f.notifier.notified().len(), 1);

        // Finished tasks are gone
        assert!(f.service.task_info(&caller, &task).is_err());

        let events = drain(&mut f.events);
        assert!(events.iter().any(|e| matches!(
            &e.payload,
            EventPayload::Crash { entry: crashed, uid: 1000 } if crashed == &entry
        )));
        assert!(events.iter().any(|e| matches!(
            e.payload,
            EventPayload::TaskStatusChanged { status: TaskStatus::Done, .. }
        )));

        let audits = f.audit.get_recent_audits(10).unwrap();
        assert!(audits
            .iter()
            .any(|a| matches!(a.event, AuditEventType::ProblemCreated { uid: 1000, .. })));
    }

    #[tokio::test]
    async fn stopped_task_cancel_leaves_no_entry() {
        let mut f = fixture();
        let caller = f.client(1000);

        let task = f
            .service
            .new_problem(
                &caller,
                crash_data(),
                Vec::new(),
                NewProblemFlags::REGISTER_TASK | NewProblemFlags::STOP_BEFORE_NOTIFY | NewProblemFlags::START,
            )
            .unwrap();

        let info = wait_for(&f.service, &caller, &task, TaskStatus::Stopped).await;
        let temp = ObjectPath::new(info.details[TEMPORARY_ENTRY_DETAIL].clone());
        let dir = f.service.entry_dir(&temp).unwrap();
        assert!(dir.exists());

        // NEW entries are only listed on request
        assert!(f.service.get_problems(&caller, GetProblemsFlags::empty()).await.unwrap().is_empty());
        assert_eq!(
            f.service.get_problems(&caller, GetProblemsFlags::NEW).await.unwrap(),
            vec![temp.clone()]
        );

        f.service.cancel_task(&caller, &task).await.unwrap();
        assert!(!dir.exists());
        assert!(f.service.entry_dir(&temp).is_none());
        assert!(f.notifier.notified().is_empty());
        assert!(f.service.task_info(&caller, &task).is_err());

        let events = drain(&mut f.events);
        assert!(events.iter().any(|e| matches!(
            e.payload,
            EventPayload::TaskStatusChanged { status: TaskStatus::Canceled, .. }
        )));
    }

    #[tokio::test]
    async fn running_task_cancel_leaves_no_entry() {
        let mut f = fixture();
        let caller = f.client(1000);

        let task = f
            .service
            .new_problem(&caller, crash_data(), Vec::new(), NewProblemFlags::REGISTER_TASK)
            .unwrap();
        f.service.start_task(&caller, &task).unwrap();
        assert_eq!(f.service.task_info(&caller, &task).unwrap().status, TaskStatus::Running);

        f.service.cancel_task(&caller, &task).await.unwrap();
        wait_until(|| f.service.task_info(&caller, &task).is_err()).await;

        let spool = &f.service.settings().service.dump_location;
        assert_eq!(std::fs::read_dir(spool).unwrap().count(), 0);
        assert!(f.service.get_problems(&caller, GetProblemsFlags::NEW).await.unwrap().is_empty());
        assert!(f.notifier.notified().is_empty());

        let events = drain(&mut f.events);
        assert!(events.iter().any(|e| matches!(
            e.payload,
            EventPayload::TaskStatusChanged { status: TaskStatus::Canceled, .. }
        )));
        assert!(!events.iter().any(|e| matches!(
            e.payload,
            EventPayload::TaskStatusChanged { status: TaskStatus::Failed | TaskStatus::Done, .. }
        )));
    }

    #[tokio::test]
    async fn start_during_cancel_is_refused() {
        let f = fixture();
        let caller = f.client(1000);

        let task = f
            .service
            .new_problem(
                &caller,
                crash_data(),
                Vec::new(),
                NewProblemFlags::REGISTER_TASK | NewProblemFlags::STOP_BEFORE_NOTIFY | NewProblemFlags::START,
            )
            .unwrap();
        wait_for(&f.service, &caller, &task, TaskStatus::Stopped).await;

        let cancelling = {
            let service = f.service.clone();
            let caller = caller.clone();
            let task = task.clone();
            tokio::spawn(async move { service.cancel_task(&caller, &task).await })
        };
        tokio::task::yield_now().await;

        assert!(f.service.start_task(&caller, &task).is_err());
        cancelling.await.unwrap().unwrap();

        assert!(f.service.task_info(&caller, &task).is_err());
        let spool = &f.service.settings().service.dump_location;
        assert_eq!(std::fs::read_dir(spool).unwrap().count(), 0);
        assert!(f.notifier.notified().is_empty());
    }

    #[tokio::test]
    async fn stopped_task_resumes() {
        let f = fixture();
        let caller = f.client(1000);

        let task = f
            .service
            .new_problem(
                &caller,
                crash_data(),
                Vec::new(),
                NewProblemFlags::REGISTER_TASK | NewProblemFlags::STOP_BEFORE_NOTIFY,
            )
            .unwrap();
        assert_eq!(f.service.task_info(&caller, &task).unwrap().status, TaskStatus::New);
        assert!(matches!(f.service.finish_task(&caller, &task), Err(ProblemError::InvalidState(_))));

        f.service.start_task(&caller, &task).unwrap();
        wait_for(&f.service, &caller, &task, TaskStatus::Stopped).await;

        f.service.start_task(&caller, &task).unwrap();
        wait_for(&f.service, &caller, &task, TaskStatus::Done).await;
        assert_eq!(f.notifier.notified().len(), 1);
    }

    #[tokio::test]
    async fn autonomous_new_problem() {
        let f = fixture();
        let caller = f.client(1000);

        let path = f
            .service
            .new_problem(&caller, crash_data(), Vec::new(), NewProblemFlags::empty())
            .unwrap();
        assert!(path.is_null());

        wait_until(|| !f.notifier.notified().is_empty()).await;
        let mut found = Vec::new();
        for _ in 0..100 {
            found = f.service.get_problems(&caller, GetProblemsFlags::empty()).await.unwrap();
            if !found.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn notifier_outcomes() {
        let cases = [
            (NotifyOutcome::Dropped, NewProblemCode::Dropped),
            (NotifyOutcome::Invalid, NewProblemCode::InvalidData),
        ];
        for (outcome, code) in cases {
            let f = fixture();
            f.notifier.set_outcome(outcome);
            let caller = f.client(1000);

            let task = f
                .service
                .new_problem(&caller, crash_data(), Vec::new(), NewProblemFlags::REGISTER_TASK | NewProblemFlags::START)
                .unwrap();
            wait_for(&f.service, &caller, &task, TaskStatus::Failed).await;

            let (results, result_code) = f.service.finish_task(&caller, &task).unwrap();
            assert_eq!(result_code, code.code());
            assert!(results.contains_key(ERROR_MESSAGE_RESULT));
            assert!(f.service.get_problems(&caller, GetProblemsFlags::NEW).await.unwrap().is_empty());
            let spool = &f.service.settings().service.dump_location;
            assert_eq!(std::fs::read_dir(spool).unwrap().count(), 0);
        }
    }

    #[tokio::test]
    async fn notification_failure() {
        let f = fixture();
        f.notifier.set_fail(true);
        let caller = f.client(1000);

        let task = f
            .service
            .new_problem(&caller, crash_data(), Vec::new(), NewProblemFlags::REGISTER_TASK | NewProblemFlags::START)
            .unwrap();
        wait_for(&f.service, &caller, &task, TaskStatus::Failed).await;

        let (results, code) = f.service.finish_task(&caller, &task).unwrap();
        assert_eq!(code, NewProblemCode::Failed.code());
        assert_eq!(results[ERROR_MESSAGE_RESULT], "Failed to notify the new problem directory");
    }

    #[tokio::test]
    async fn duplicate_points_at_existing_entry() {
        let mut f = fixture();
        let existing = existing_problem(&f, "ccpp-old", 1000);
        assert_eq!(f.service.load_existing_problems().await.unwrap(), 1);
        f.notifier.set_outcome(NotifyOutcome::Duplicate(existing.clone()));

        let caller = f.client(1000);
        let task = f
            .service
            .new_problem(&caller, crash_data(), Vec::new(), NewProblemFlags::REGISTER_TASK | NewProblemFlags::START)
            .unwrap();
        wait_for(&f.service, &caller, &task, TaskStatus::Done).await;

        let (results, code) = f.service.finish_task(&caller, &task).unwrap();
        assert_eq!(code, NewProblemCode::Duplicate.code());
        let existing_entry = f.service.entry_for_dir(&existing).unwrap();
        assert_eq!(results[ENTRY_RESULT], existing_entry.to_string());

        let problems = f.service.get_problems(&caller, GetProblemsFlags::NEW).await.unwrap();
        assert_eq!(problems, vec![existing_entry.clone()]);
        assert!(drain(&mut f.events).iter().any(|e| matches!(
            &e.payload,
            EventPayload::Crash { entry, .. } if entry == &existing_entry
        )));
    }

    #[tokio::test]
    async fn quota_exceeded_never_grants() {
        let f = fixture_with(|s| s.limits.user_problems = 1);
        existing_problem(&f, "ccpp-mine", 1000);
        f.service.load_existing_problems().await.unwrap();

        let caller = f.client(1000);
        f.service.get_session(&caller).unwrap();
        let err = f
            .service
            .create_problem_entry(crash_data(), Vec::new(), 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, ProblemError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn concurrent_creates_respect_quota() {
        let f = fixture_with(|s| s.limits.user_problems = 1);
        let caller = f.client(1000);
        f.service.get_session(&caller).unwrap();

        let (a, b) = tokio::join!(
            f.service.create_problem_entry(crash_data(), Vec::new(), 1000),
            f.service.create_problem_entry(crash_data(), Vec::new(), 1000),
        );
        let (created, refused): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(|r| r.is_ok());
        assert_eq!(created.len(), 1);
        assert!(matches!(refused[0], Err(ProblemError::QuotaExceeded(_))));

        let spool = &f.service.settings().service.dump_location;
        assert_eq!(std::fs::read_dir(spool).unwrap().count(), 1);
        let err = f
            .service
            .create_problem_entry(crash_data(), Vec::new(), 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, ProblemError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn failed_save_releases_quota() {
        let f = fixture_with(|s| s.limits.user_problems = 1);
        let caller = f.client(1000);
        f.service.get_session(&caller).unwrap();

        let mut broken = crash_data();
        broken.insert("backtrace".to_string(), ElementValue::Handle(7));
        assert!(f.service.create_problem_entry(broken, Vec::new(), 1000).await.is_err());

        f.service
            .create_problem_entry(crash_data(), Vec::new(), 1000)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn throttle_empties_bucket() {
        let f = fixture_with(|s| {
            s.limits.new_problems_batch = 1;
            s.limits.throttling_magnitude = 20;
        });
        let caller = f.client(1000);
        f.service.get_session(&caller).unwrap();

        f.service
            .create_problem_entry(crash_data(), Vec::new(), 1000)
            .await
            .unwrap();
        let err = f
            .service
            .create_problem_entry(crash_data(), Vec::new(), 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, ProblemError::LimitsExceeded(_)));
    }

    #[tokio::test]
    async fn get_problems_filters_foreign() {
        let f = fixture();
        let mine = existing_problem(&f, "ccpp-mine", 1000);
        existing_problem(&f, "ccpp-theirs", 1001);
        f.service.load_existing_problems().await.unwrap();

        let caller = f.client(1000);
        let own = f.service.get_problems(&caller, GetProblemsFlags::empty()).await.unwrap();
        assert_eq!(own, vec![f.service.entry_for_dir(&mine).unwrap()]);

        let all = f.service.get_problems(&caller, GetProblemsFlags::FOREIGN).await.unwrap();
        assert_eq!(all.len(), 2);

        let root = f.client(0);
        let everything = f.service.get_problems(&root, GetProblemsFlags::empty()).await.unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn delete_problems_checks_access() {
        let f = fixture();
        let mine = existing_problem(&f, "ccpp-mine", 1000);
        let theirs = existing_problem(&f, "ccpp-theirs", 1001);
        f.service.load_existing_problems().await.unwrap();
        let mine_entry = f.service.entry_for_dir(&mine).unwrap();
        let theirs_entry = f.service.entry_for_dir(&theirs).unwrap();

        let caller = f.client(1000);
        let err = f
            .service
            .delete_problems(&caller, &[mine_entry.clone(), theirs_entry.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProblemError::AccessDenied(_)));
        assert!(!mine.exists());
        assert!(theirs.exists());

        let err = f.service.delete_problems(&caller, &[mine_entry]).await.unwrap_err();
        assert!(matches!(err, ProblemError::NotFound(_)));

        let audits = f.audit.get_recent_audits(10).unwrap();
        assert!(audits
            .iter()
            .any(|a| matches!(a.event, AuditEventType::ProblemDeleted { caller_uid: 1000, .. })));
    }

    #[tokio::test]
    async fn entry_operations_go_through_registry() {
        let f = fixture();
        let dir = existing_problem(&f, "ccpp-mine", 1000);
        f.service.load_existing_problems().await.unwrap();
        let entry = f.service.entry_for_dir(&dir).unwrap();
        let caller = f.client(1000);

        f.service
            .save_elements(
                &caller,
                &entry,
                ProblemInfo::from([("comment".to_string(), ElementValue::from("steps"))]),
                Vec::new(),
                SaveElementsFlags::ALL_FATAL,
            )
            .await
            .unwrap();

        let (values, fds) = f
            .service
            .read_elements(&caller, &entry, vec!["comment".into()], ReadElementsFlags::empty())
            .await
            .unwrap();
        assert!(fds.is_empty());
        assert_eq!(values["comment"], ElementValue::from("steps"));

        f.service
            .delete_elements(&caller, &entry, vec!["comment".into()])
            .await
            .unwrap();
        let data = f.service.get_problem_data(&caller, &entry).await.unwrap();
        assert!(!data.contains_key("comment"));

        let props = f.service.entry_properties(&caller, &entry).await.unwrap();
        assert_eq!(props.problem_type, "CCpp");

        let stranger = f.client(1001);
        assert!(matches!(
            f.service.get_problem_data(&stranger, &entry).await,
            Err(ProblemError::AccessDenied(_))
        ));
        assert!(matches!(
            f.service.get_problem_data(&caller, &ObjectPath::for_entry("/nowhere")).await,
            Err(ProblemError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn session_limit() {
        let f = fixture_with(|s| s.limits.clients = 2);
        for _ in 0..2 {
            f.service.get_session(&f.client(1000)).unwrap();
        }
        let err = f.service.get_session(&f.client(1000)).unwrap_err();
        assert!(matches!(err, ProblemError::LimitsExceeded(_)));

        // Same client gets the same session back
        let caller = f.client(1001);
        let first = f.service.get_session(&caller).unwrap();
        assert_eq!(f.service.get_session(&caller).unwrap(), first);
    }

    #[tokio::test]
    async fn authority_grants_session() {
        let mut f = fixture();
        f.authority.set_answer(Some(true));
        let caller = f.client(1000).with_pid(77);
        let session = f.service.get_session(&caller).unwrap();
        assert_eq!(f.service.caller_uid(&caller), 1000);

        let result = f.service.authorize(&caller, &session, &BTreeMap::new()).unwrap();
        assert_eq!(result, AuthorizeResult::Accepted);

        wait_until(|| f.service.session_info(&caller, &session).unwrap().is_authorized).await;
        assert_eq!(f.service.caller_uid(&caller), 0);
        assert_eq!(
            f.service.authorize(&caller, &session, &BTreeMap::new()).unwrap(),
            AuthorizeResult::Granted
        );
        assert_eq!(f.authority.requests()[0].pid, Some(77));

        let statuses: Vec<_> = drain(&mut f.events)
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::AuthorizationChanged { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![AuthorizationStatus::Pending, AuthorizationStatus::Authorized]);

        f.service.revoke_authorization(&caller, &session).unwrap();
        assert_eq!(f.service.caller_uid(&caller), 1000);
    }

    #[tokio::test]
    async fn authority_denies_session() {
        let f = fixture();
        let caller = f.client(1000);
        let session = f.service.get_session(&caller).unwrap();

        f.service.authorize(&caller, &session, &BTreeMap::new()).unwrap();
        wait_until(|| !f.authority.requests().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!f.service.session_info(&caller, &session).unwrap().is_authorized);
    }

    #[tokio::test]
    async fn token_passes_authorization_to_peer() {
        let f = fixture();
        let first = f.client(0);
        let first_session = f.service.get_session(&first).unwrap();
        let token = f.service.generate_token(&first, &first_session, 0).unwrap();

        let second = f.client(0);
        let second_session = f.service.get_session(&second).unwrap();
        let details = BTreeMap::from([
            (PEER_BUS_DETAIL.to_string(), first.client_id.to_string()),
            (PEER_TOKEN_DETAIL.to_string(), token.clone()),
        ]);
        assert_eq!(
            f.service.authorize(&second, &second_session, &details).unwrap(),
            AuthorizeResult::Granted
        );
        // Tokens are single use
        assert!(f.service.authorize(&second, &second_session, &details).is_err());
    }

    #[tokio::test]
    async fn peer_authorization_errors() {
        let f = fixture();
        let user = f.client(1000);
        let session = f.service.get_session(&user).unwrap();

        let half = BTreeMap::from([(PEER_BUS_DETAIL.to_string(), "x".to_string())]);
        assert!(matches!(
            f.service.authorize(&user, &session, &half),
            Err(ProblemError::InvalidArgs(_))
        ));

        let unknown = BTreeMap::from([
            (PEER_BUS_DETAIL.to_string(), ClientId::new().to_string()),
            (PEER_TOKEN_DETAIL.to_string(), "token".to_string()),
        ]);
        let err = f.service.authorize(&user, &session, &unknown).unwrap_err();
        assert!(err.to_string().contains("No peer session"));

        let peer = f.client(1000);
        f.service.get_session(&peer).unwrap();
        let details = BTreeMap::from([
            (PEER_BUS_DETAIL.to_string(), peer.client_id.to_string()),
            (PEER_TOKEN_DETAIL.to_string(), "token".to_string()),
        ]);
        let err = f.service.authorize(&user, &session, &details).unwrap_err();
        assert!(err.to_string().contains("Not authorized session"));
    }

    #[tokio::test]
    async fn sessions_are_private() {
        let f = fixture();
        let owner = f.client(1000);
        let session = f.service.get_session(&owner).unwrap();

        let intruder = f.client(1000);
        assert!(f.service.session_info(&intruder, &session).is_err());
        assert!(f.service.generate_token(&intruder, &session, 0).is_err());

        let task = f
            .service
            .new_problem(&owner, crash_data(), Vec::new(), NewProblemFlags::REGISTER_TASK)
            .unwrap();
        assert!(matches!(
            f.service.task_info(&intruder, &task),
            Err(ProblemError::AccessDenied(_))
        ));
        assert_eq!(f.service.session_info(&owner, &session).unwrap().tasks, vec![task]);
    }

    #[tokio::test]
    async fn disconnect_undoes_stopped_tasks() {
        let f = fixture();
        let caller = f.client(1000);

        let task = f
            .service
            .new_problem(
                &caller,
                crash_data(),
                Vec::new(),
                NewProblemFlags::REGISTER_TASK | NewProblemFlags::STOP_BEFORE_NOTIFY | NewProblemFlags::START,
            )
            .unwrap();
        let info = wait_for(&f.service, &caller, &task, TaskStatus::Stopped).await;
        let temp = ObjectPath::new(info.details[TEMPORARY_ENTRY_DETAIL].clone());
        let dir = f.service.entry_dir(&temp).unwrap();

        f.service.client_disconnected(&caller.client_id).await;
        assert!(!dir.exists());
        assert!(f.service.entry_dir(&temp).is_none());

        // The session slot was released and the client is gone for good
        assert!(matches!(
            f.service.get_session(&caller),
            Err(ProblemError::NotFound(_))
        ));
        let next = f.client(1000);
        let again = f.service.get_session(&next).unwrap();
        assert!(f.service.session_info(&next, &again).unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn late_request_does_not_reopen_session() {
        let f = fixture_with(|s| s.limits.clients = 1);
        let caller = f.client(1000);
        f.service.client_disconnected(&caller.client_id).await;

        assert!(f.service.get_session(&caller).is_err());
        let next = f.client(1000);
        f.service.get_session(&next).unwrap();
    }

    #[tokio::test]
    async fn shutdown_notifies_clients() {
        let mut f = fixture();
        let caller = f.client(1000);
        f.service.shutdown();

        let events = drain(&mut f.events);
        assert!(events
            .iter()
            .any(|e| e.client_id == caller.client_id && matches!(e.payload, EventPayload::Shutdown)));
    }
}
