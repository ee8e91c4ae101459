//! Config validation CLI tool
//!
//! Validates a problemd configuration file and reports any errors.

use problemd_config::NotifierKind;
use problemd_util::default_config_path;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a problemd configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match problemd_config::load_config(&config_path) {
        Ok(settings) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", problemd_config::CURRENT_CONFIG_VERSION);
            println!("  Dump location: {}", settings.service.dump_location.display());
            println!("  Rules file: {}", settings.service.rules_file.display());
            let notifier = match settings.service.notifier {
                NotifierKind::Socket => format!(
                    "socket ({})",
                    settings
                        .service
                        .notify_socket
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                ),
                NotifierKind::Rules => "rules (post-create)".to_string(),
            };
            println!("  Notifier: {}", notifier);
            println!(
                "  Limits: {} sessions, {} problems, {} elements per user",
                settings.limits.clients, settings.limits.user_problems, settings.limits.elements
            );

            if !settings.events.is_empty() {
                println!();
                println!("Events:");
                for (name, event) in &settings.events {
                    println!("  - {} ({} options)", name, event.options.len());
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                problemd_config::ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                problemd_config::ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                problemd_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                problemd_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        problemd_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
