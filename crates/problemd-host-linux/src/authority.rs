//! Authorization through an external checker

use async_trait::async_trait;
use problemd_host_api::{Authority, AuthorizationRequest, HostError, HostResult};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Asks a checker command whether a user may perform an action
///
/// The checker receives `PROBLEMD_UID`, `PROBLEMD_ACTION`, `PROBLEMD_MESSAGE`
/// and, when known, `PROBLEMD_PID`. Exit 0 grants, exit 1 denies, anything
/// else is a failure. Without a checker only root is authorized.
pub struct CommandAuthority {
    argv: Option<Vec<String>>,
}

impl CommandAuthority {
    pub fn new(argv: Option<Vec<String>>) -> Self {
        Self {
            argv: argv.filter(|argv| !argv.is_empty()),
        }
    }

    pub fn root_only() -> Self {
        Self { argv: None }
    }
}

#[async_trait]
impl Authority for CommandAuthority {
    async fn check_authorization(&self, request: &AuthorizationRequest) -> HostResult<bool> {
        let Some(argv) = &self.argv else {
            return Ok(request.uid == 0);
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env("PROBLEMD_UID", request.uid.to_string())
            .env("PROBLEMD_ACTION", &request.action)
            .env("PROBLEMD_MESSAGE", request.message.as_deref().unwrap_or(""))
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        if let Some(pid) = request.pid {
            cmd.env("PROBLEMD_PID", pid.to_string());
        }

        let status = cmd
            .status()
            .await
            .map_err(|e| HostError::SpawnFailed(format!("Failed to spawn {}: {}", argv[0], e)))?;

        debug!(uid = request.uid, action = %request.action, status = ?status.code(), "Authorization checked");
        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            other => {
                warn!(checker = %argv[0], status = ?other, "Authorization checker failed");
                Err(HostError::Internal(format!(
                    "Authorization checker exited with {:?}",
                    other
                )))
            }
        }
    }
}
