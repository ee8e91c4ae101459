//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Global service settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Resource limits
    #[serde(default)]
    pub limits: RawLimits,

    /// Per-event handler settings, keyed by event name
    #[serde(default)]
    pub events: BTreeMap<String, RawEventConfig>,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path
    pub socket_path: Option<PathBuf>,

    /// Data directory for the audit journal
    pub data_dir: Option<PathBuf>,

    /// Directory holding problem directories
    pub dump_location: Option<PathBuf>,

    /// Top-level rule file
    pub rules_file: Option<PathBuf>,

    /// Socket of the post-processing daemon (socket notifier only)
    pub notify_socket: Option<PathBuf>,

    /// How new problems are confirmed
    pub notifier: Option<RawNotifierKind>,

    /// Authorization checker program and its arguments
    pub authority_command: Option<Vec<String>>,

    /// Mode of problem element files
    pub dump_dir_mode: Option<u32>,

    /// Chown problem directories to the service account (requires root)
    pub privileged_owner: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawNotifierKind {
    Socket,
    Rules,
}

/// Raw resource limits; absent values take the defaults
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawLimits {
    /// Open sessions per user
    pub clients: Option<u32>,
    /// Elements per problem
    pub elements: Option<u32>,
    /// Bytes per problem
    pub data_size: Option<u64>,
    /// Problems per user
    pub user_problems: Option<u64>,
    /// New-problem token refill shift
    pub throttling_magnitude: Option<u32>,
    /// New-problem token bucket size
    pub new_problems_batch: Option<u32>,
    /// Inline bytes per ReadElements reply
    pub max_message_size: Option<u64>,
    /// File descriptors per message
    pub max_message_unix_fds: Option<u32>,
}

/// Raw per-event settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawEventConfig {
    /// Exported to handlers as `NAME=VALUE`
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}
