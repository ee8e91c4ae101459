//! Configuration parsing and validation for problemd
//!
//! Supports TOML configuration with:
//! - Versioned schema
//! - Service paths and collaborator selection
//! - Per-user resource limits and new-problem throttling
//! - Per-event handler options
//! - Validation with clear error messages

mod schema;
mod settings;
mod validation;

pub use schema::*;
pub use settings::*;
pub use validation::*;

use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Load and validate configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<Settings> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "Loading configuration");
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> ConfigResult<Settings> {
    let raw: RawConfig = toml::from_str(content)?;

    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    let errors = validate_config(&raw);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationFailed { errors });
    }

    Ok(Settings::from_raw(raw))
}

/// Current supported config version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_minimal_config() {
        let settings = parse_config("config_version = 1").unwrap();
        assert_eq!(settings.limits.clients, 5);
        assert_eq!(settings.limits.new_problems_batch, 10);
        assert!(settings.events.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let config = r#"
            config_version = 1

            [service]
            dump_location = "/var/spool/problemd"
            notifier = "socket"
            notify_socket = "/run/abrt/abrt.socket"
            authority_command = ["/usr/libexec/problemd-check", "--quiet"]
            dump_dir_mode = 0o640

            [limits]
            clients = 2
            elements = 50
            throttling_magnitude = 2

            [events.report_Bugzilla]
            options = { Bugzilla_URL = "https://bugzilla.example.org" }
        "#;

        let settings = parse_config(config).unwrap();
        assert_eq!(settings.service.notifier, NotifierKind::Socket);
        assert_eq!(settings.service.dump_dir_mode, 0o640);
        assert_eq!(settings.limits.clients, 2);
        assert_eq!(settings.limits.elements, 50);
        assert_eq!(settings.limits.throttling_magnitude, 2);
        assert_eq!(
            settings.event_options("report_Bugzilla"),
            vec![("Bugzilla_URL".to_string(), "https://bugzilla.example.org".to_string())]
        );
    }

    #[test]
    fn reject_wrong_version() {
        let result = parse_config("config_version = 99");
        assert!(matches!(result, Err(ConfigError::UnsupportedVersion(99))));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "config_version = 1\n[limits]\nuser_problems = 7").unwrap();

        let settings = load_config(file.path()).unwrap();
        assert_eq!(settings.limits.user_problems, 7);
    }
}
