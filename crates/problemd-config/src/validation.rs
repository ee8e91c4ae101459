//! Configuration validation

use crate::schema::{RawConfig, RawNotifierKind};
use thiserror::Error;

/// Largest number of descriptors one SCM_RIGHTS message may carry on Linux
pub const MAX_UNIX_FDS_PER_MESSAGE: u32 = 253;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Limit '{name}': {message}")]
    LimitError { name: String, message: String },

    #[error("Event '{event}': {message}")]
    EventError { event: String, message: String },

    #[error("Global config error: {0}")]
    GlobalError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    errors.extend(validate_service(config));
    errors.extend(validate_limits(config));

    for (event, cfg) in &config.events {
        if event.is_empty() {
            errors.push(ValidationError::GlobalError("event name cannot be empty".into()));
        }
        for key in cfg.options.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                errors.push(ValidationError::EventError {
                    event: event.clone(),
                    message: format!("invalid option name '{}'", key),
                });
            }
        }
    }

    errors
}

fn validate_service(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let service = &config.service;

    if service.notifier == Some(RawNotifierKind::Socket) && service.notify_socket.is_none() {
        errors.push(ValidationError::GlobalError(
            "notifier = \"socket\" requires notify_socket".into(),
        ));
    }

    if let Some(command) = &service.authority_command
        && command.first().is_none_or(|c| c.is_empty())
    {
        errors.push(ValidationError::GlobalError(
            "authority_command cannot be empty".into(),
        ));
    }

    if let Some(mode) = service.dump_dir_mode
        && mode > 0o777
    {
        errors.push(ValidationError::GlobalError(format!(
            "dump_dir_mode {:o} is not a permission mode",
            mode
        )));
    }

    errors
}

fn validate_limits(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let limits = &config.limits;

    let mut non_zero = |name: &str, value: Option<u64>| {
        if value == Some(0) {
            errors.push(ValidationError::LimitError {
                name: name.into(),
                message: "must be greater than zero".into(),
            });
        }
    };

    non_zero("clients", limits.clients.map(u64::from));
    non_zero("new_problems_batch", limits.new_problems_batch.map(u64::from));
    non_zero("max_message_size", limits.max_message_size);

    if let Some(magnitude) = limits.throttling_magnitude
        && magnitude >= u64::BITS
    {
        errors.push(ValidationError::LimitError {
            name: "throttling_magnitude".into(),
            message: format!("must be below {}", u64::BITS),
        });
    }

    if let Some(fds) = limits.max_message_unix_fds
        && fds > MAX_UNIX_FDS_PER_MESSAGE
    {
        errors.push(ValidationError::LimitError {
            name: "max_message_unix_fds".into(),
            message: format!("must not exceed {}", MAX_UNIX_FDS_PER_MESSAGE),
        });
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(toml_text: &str) -> RawConfig {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&raw("config_version = 1")).is_empty());
    }

    #[test]
    fn socket_notifier_needs_socket() {
        let errors = validate_config(&raw(
            "config_version = 1\n[service]\nnotifier = \"socket\"",
        ));
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ValidationError::GlobalError(_)));
    }

    #[test]
    fn zero_and_oversized_limits() {
        let errors = validate_config(&raw(
            "config_version = 1\n[limits]\nclients = 0\nmax_message_unix_fds = 1000\nthrottling_magnitude = 64",
        ));
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| matches!(e, ValidationError::LimitError { .. })));
    }

    #[test]
    fn option_names_cannot_contain_equals() {
        let errors = validate_config(&raw(
            "config_version = 1\n[events.post-create]\noptions = { \"A=B\" = \"x\" }",
        ));
        assert!(matches!(&errors[0], ValidationError::EventError { event, .. } if event == "post-create"));
    }

    #[test]
    fn empty_authority_command() {
        let errors = validate_config(&raw(
            "config_version = 1\n[service]\nauthority_command = []",
        ));
        assert_eq!(errors.len(), 1);
    }
}
