//! Validated settings

use crate::schema::{RawConfig, RawEventConfig, RawLimits, RawNotifierKind, RawServiceConfig};
use problemd_util::{default_data_dir, default_dump_location, default_rules_file, default_socket_path};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Validated settings ready for use by the service
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub service: ServiceConfig,
    pub limits: Limits,
    pub events: BTreeMap<String, EventConfig>,
}

impl Settings {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            limits: Limits::from_raw(raw.limits),
            events: raw
                .events
                .into_iter()
                .map(|(name, cfg)| (name, EventConfig::from_raw(cfg)))
                .collect(),
        }
    }

    /// Handler environment for an event, in a stable order
    pub fn event_options(&self, event: &str) -> Vec<(String, String)> {
        self.events
            .get(event)
            .map(|e| e.options.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

/// How new problem directories get confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierKind {
    /// Ask the post-processing daemon over its socket
    Socket,
    /// Run the `post-create` event locally
    Rules,
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub dump_location: PathBuf,
    pub rules_file: PathBuf,
    pub notify_socket: Option<PathBuf>,
    pub notifier: NotifierKind,
    pub authority_command: Option<Vec<String>>,
    pub dump_dir_mode: u32,
    pub privileged_owner: bool,
}

/// Default mode of problem element files
pub const DEFAULT_DUMP_DIR_MODE: u32 = 0o640;

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw.socket_path.unwrap_or_else(default_socket_path),
            data_dir: raw.data_dir.unwrap_or_else(default_data_dir),
            dump_location: raw.dump_location.unwrap_or_else(default_dump_location),
            rules_file: raw.rules_file.unwrap_or_else(default_rules_file),
            notify_socket: raw.notify_socket,
            notifier: match raw.notifier {
                Some(RawNotifierKind::Socket) => NotifierKind::Socket,
                Some(RawNotifierKind::Rules) | None => NotifierKind::Rules,
            },
            authority_command: raw.authority_command,
            dump_dir_mode: raw.dump_dir_mode.unwrap_or(DEFAULT_DUMP_DIR_MODE),
            privileged_owner: raw.privileged_owner.unwrap_or(false),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_raw(RawServiceConfig::default())
    }
}

/// Resource limits
///
/// `elements`, `data_size` and `user_problems` do not apply to root; use the
/// `*_for` accessors when enforcing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub clients: u32,
    pub elements: u32,
    pub data_size: u64,
    pub user_problems: u64,
    pub throttling_magnitude: u32,
    pub new_problems_batch: u32,
    pub max_message_size: u64,
    pub max_message_unix_fds: u32,
}

impl Limits {
    fn from_raw(raw: RawLimits) -> Self {
        let d = Self::default();
        Self {
            clients: raw.clients.unwrap_or(d.clients),
            elements: raw.elements.unwrap_or(d.elements),
            data_size: raw.data_size.unwrap_or(d.data_size),
            user_problems: raw.user_problems.unwrap_or(d.user_problems),
            throttling_magnitude: raw.throttling_magnitude.unwrap_or(d.throttling_magnitude),
            new_problems_batch: raw.new_problems_batch.unwrap_or(d.new_problems_batch),
            max_message_size: raw.max_message_size.unwrap_or(d.max_message_size),
            max_message_unix_fds: raw.max_message_unix_fds.unwrap_or(d.max_message_unix_fds),
        }
    }

    /// Element count limit for `uid`, 0 meaning unlimited
    pub fn elements_for(&self, uid: u32) -> u32 {
        if uid == 0 { 0 } else { self.elements }
    }

    /// Problem size limit for `uid`, 0 meaning unlimited
    pub fn data_size_for(&self, uid: u32) -> u64 {
        if uid == 0 { 0 } else { self.data_size }
    }

    /// Owned problems limit for `uid`, 0 meaning unlimited
    pub fn user_problems_for(&self, uid: u32) -> u64 {
        if uid == 0 { 0 } else { self.user_problems }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            clients: 5,
            elements: 100,
            data_size: 2 * 1024 * 1024 * 1023,
            user_problems: 1000,
            throttling_magnitude: 4,
            new_problems_batch: 10,
            max_message_size: 128 * 1024 * 1024,
            max_message_unix_fds: 16,
        }
    }
}

/// Validated per-event settings
#[derive(Debug, Clone, Default)]
pub struct EventConfig {
    pub options: BTreeMap<String, String>,
}

impl EventConfig {
    fn from_raw(raw: RawEventConfig) -> Self {
        Self {
            options: raw.options,
        }
    }
}
