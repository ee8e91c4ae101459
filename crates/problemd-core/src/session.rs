//! Client sessions: authorization state, delegation tokens and task ownership

use problemd_api::{AuthorizationStatus, SessionInfo};
use problemd_util::{ClientId, ObjectPath, ProblemError, Result};
use rand::Rng;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifetime of a token generated with a zero duration
pub const DEFAULT_TOKEN_DURATION_SECS: u64 = 5;

/// Length of a delegation token
pub const TOKEN_LENGTH: usize = 16;

const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Authorization detail naming the peer session
pub const PEER_BUS_DETAIL: &str = "problems2.peer-bus";

/// Authorization detail carrying the peer's token
pub const PEER_TOKEN_DETAIL: &str = "problems2.peer-token";

/// Authorization state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Init,
    /// Waiting for the authority
    Pending,
    Authorized,
}

/// What `begin_authorize` decided
#[derive(Debug)]
pub enum AuthorizeStep {
    /// Already authorized
    Granted,
    /// A check is already running
    Pending,
    /// A new check has to be run; the token aborts it
    Check { request: u64, token: CancellationToken },
}

/// One client's session
#[derive(Debug)]
pub struct Session {
    path: ObjectPath,
    client_id: ClientId,
    uid: u32,
    pid: Option<i32>,
    auth: AuthState,
    auth_request: Option<(u64, CancellationToken)>,
    auth_requests: u64,
    tasks: Vec<ObjectPath>,
    task_indexer: u32,
    /// Token -> expiry in epoch seconds
    tokens: HashMap<String, u64>,
}

impl Session {
    /// Root sessions start authorized
    pub fn new(client_id: ClientId, uid: u32, pid: Option<i32>) -> Self {
        Self {
            path: ObjectPath::for_session(&client_id),
            client_id,
            uid,
            pid,
            auth: if uid == 0 {
                AuthState::Authorized
            } else {
                AuthState::Init
            },
            auth_request: None,
            auth_requests: 0,
            tasks: Vec::new(),
            task_indexer: 0,
            tokens: HashMap::new(),
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth
    }

    pub fn is_authorized(&self) -> bool {
        self.auth == AuthState::Authorized
    }

    /// Reject callers other than the session's own client
    pub fn check_sanity(&self, client_id: &ClientId, uid: u32) -> Result<()> {
        if &self.client_id == client_id && self.uid == uid {
            return Ok(());
        }
        warn!(session = %self.path, uid, "Session does not belong to the caller");
        Err(ProblemError::internal(
            "Your Problems2 Session is broken. Check system logs for more details.",
        ))
    }

    /// Move to `new`, returning the status to announce
    fn change_auth(&mut self, new: AuthState) -> Option<AuthorizationStatus> {
        let old = self.auth;
        if old == new {
            return None;
        }
        self.auth = new;
        info!(session = %self.path, uid = self.uid, from = ?old, to = ?new, "Authorization changed");

        Some(match (old, new) {
            (_, AuthState::Pending) => AuthorizationStatus::Pending,
            (_, AuthState::Authorized) => AuthorizationStatus::Authorized,
            (AuthState::Pending, AuthState::Init) => AuthorizationStatus::Failed,
            (_, AuthState::Init) => AuthorizationStatus::NotAuthorized,
        })
    }

    /// Start authorizing without a peer
    pub fn begin_authorize(&mut self) -> (AuthorizeStep, Option<AuthorizationStatus>) {
        match self.auth {
            AuthState::Authorized => (AuthorizeStep::Granted, None),
            AuthState::Pending => (AuthorizeStep::Pending, None),
            AuthState::Init => {
                self.auth_requests += 1;
                let request = self.auth_requests;
                let token = CancellationToken::new();
                self.auth_request = Some((request, token.clone()));
                let status = self.change_auth(AuthState::Pending);
                (AuthorizeStep::Check { request, token }, status)
            }
        }
    }

    /// Apply the authority's answer to a pending request
    ///
    /// Answers to cancelled or superseded requests are ignored.
    pub fn finish_authorize(&mut self, request: u64, granted: bool) -> Option<AuthorizationStatus> {
        let current = self.auth_request.as_ref().map(|(id, _)| *id);
        if self.auth != AuthState::Pending || current != Some(request) {
            debug!(session = %self.path, request, "Ignoring stale authorization answer");
            return None;
        }
        self.auth_request = None;
        self.change_auth(if granted {
            AuthState::Authorized
        } else {
            AuthState::Init
        })
    }

    /// Authorize through a token handed over by a peer session
    pub fn grant_from_peer(&mut self) -> Option<AuthorizationStatus> {
        if let Some((_, token)) = self.auth_request.take() {
            token.cancel();
        }
        self.change_auth(AuthState::Authorized)
    }

    pub fn revoke_authorization(&mut self) -> Option<AuthorizationStatus> {
        if self.uid == 0 {
            return None;
        }
        if let Some((_, token)) = self.auth_request.take() {
            token.cancel();
        }
        self.change_auth(AuthState::Init)
    }

    pub fn generate_token(&mut self, duration_secs: u64, now: u64) -> Result<String> {
        if !self.is_authorized() {
            return Err(ProblemError::access_denied(
                "Cannot generate token: Session is not authorized",
            ));
        }

        let duration = if duration_secs == 0 {
            DEFAULT_TOKEN_DURATION_SECS
        } else {
            duration_secs
        };

        let mut rng = rand::thread_rng();
        let token: String = (0..TOKEN_LENGTH)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect();

        self.tokens.insert(token.clone(), now.saturating_add(duration));
        debug!(session = %self.path, duration, "Token generated");
        Ok(token)
    }

    pub fn revoke_token(&mut self, token: &str) {
        if self.tokens.remove(token).is_none() {
            warn!(session = %self.path, "Attempt to revoke unknown token");
        }
    }

    /// Consume `token` on behalf of a peer session owned by `uid`
    pub fn pass_authorization(&mut self, uid: u32, token: &str, now: u64) -> Result<()> {
        if !self.is_authorized() {
            return Err(ProblemError::access_denied(
                "Failed to authorize Session: Not authorized session cannot pass authorization",
            ));
        }
        if self.uid != uid {
            return Err(ProblemError::access_denied(
                "Failed to authorize Session: Session owners do not match",
            ));
        }
        let Some(&expires) = self.tokens.get(token) else {
            return Err(ProblemError::access_denied(
                "Failed to authorize Session: No such token",
            ));
        };
        if now > expires {
            return Err(ProblemError::access_denied(
                "Failed to authorize Session: Token has already expired",
            ));
        }
        self.tokens.remove(token);
        Ok(())
    }

    /// Register a new task and return its path
    pub fn add_task(&mut self) -> Result<ObjectPath> {
        if self.task_indexer == u32::MAX - 1 {
            return Err(ProblemError::limits("Reached the limit of task per session."));
        }
        let path = ObjectPath::for_task(&self.path, self.task_indexer);
        self.task_indexer += 1;
        self.tasks.push(path.clone());
        Ok(path)
    }

    pub fn remove_task(&mut self, task: &ObjectPath) {
        self.tasks.retain(|t| t != task);
    }

    pub fn owns_task(&self, task: &ObjectPath) -> bool {
        self.tasks.contains(task)
    }

    pub fn tasks(&self) -> &[ObjectPath] {
        &self.tasks
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            path: self.path.clone(),
            uid: self.uid,
            is_authorized: self.is_authorized(),
            tasks: self.tasks.clone(),
        }
    }
}
