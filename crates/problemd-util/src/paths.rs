//! Default paths for problemd components
//!
//! Paths are user-writable by default (no root required):
//! - Socket: `$XDG_RUNTIME_DIR/problemd/problemd.sock` or `/tmp/problemd-$USER/problemd.sock`
//! - Data: `$XDG_DATA_HOME/problemd` or `~/.local/share/problemd`
//! - Dump location: `<data dir>/spool`
//! - Config: `$XDG_CONFIG_HOME/problemd/config.toml` or `~/.config/problemd/config.toml`

use std::path::PathBuf;

/// Environment variable for overriding the socket path
pub const PROBLEMD_SOCKET_ENV: &str = "PROBLEMD_SOCKET";

/// Environment variable for overriding the data directory
pub const PROBLEMD_DATA_DIR_ENV: &str = "PROBLEMD_DATA_DIR";

/// Socket filename within the socket directory
const SOCKET_FILENAME: &str = "problemd.sock";

/// Application subdirectory name
const APP_DIR: &str = "problemd";

/// Get the default socket path.
///
/// Order of precedence:
/// 1. `$PROBLEMD_SOCKET` environment variable (if set)
/// 2. `$XDG_RUNTIME_DIR/problemd/problemd.sock` (if XDG_RUNTIME_DIR is set)
/// 3. `/tmp/problemd-$USER/problemd.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(PROBLEMD_SOCKET_ENV) {
        return PathBuf::from(path);
    }

    socket_path_without_env()
}

/// Get the socket path without checking the PROBLEMD_SOCKET env var.
pub fn socket_path_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Get the default data directory.
///
/// Order of precedence:
/// 1. `$PROBLEMD_DATA_DIR` environment variable (if set)
/// 2. `$XDG_DATA_HOME/problemd` (if XDG_DATA_HOME is set)
/// 3. `~/.local/share/problemd` (fallback)
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(PROBLEMD_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }

    data_dir_without_env()
}

/// Get the data directory without checking the PROBLEMD_DATA_DIR env var.
pub fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share").join(APP_DIR);
    }

    PathBuf::from("/tmp").join(APP_DIR).join("data")
}

/// Directory where new problem directories are created
pub fn default_dump_location() -> PathBuf {
    data_dir_without_env().join("spool")
}

/// Top-level rule file consulted by the rule engine
pub fn default_rules_file() -> PathBuf {
    config_dir().join("report_event.conf")
}

/// Default configuration file
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

fn config_dir() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join(APP_DIR);
    }

    PathBuf::from("/etc").join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_contains_problemd() {
        let path = socket_path_without_env();
        assert!(path.to_string_lossy().contains("problemd"));
        assert!(path.to_string_lossy().ends_with(".sock"));
    }

    #[test]
    fn dump_location_is_below_data_dir() {
        assert!(default_dump_location().starts_with(data_dir_without_env()));
    }

    #[test]
    fn rules_and_config_share_directory() {
        assert_eq!(default_rules_file().parent(), default_config_path().parent());
    }
}
