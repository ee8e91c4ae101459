//! problemd-run-event - run event handlers on problem directories
//!
//! Loads the rule file and either runs one event on every given directory,
//! printing handler output, or lists the events applicable to them.

use anyhow::{Context, Result, bail};
use clap::Parser;
use problemd_config::{Settings, load_config};
use problemd_rules::{RunObserver, RunState, list_possible_events, load_rule_list, run_event_on_dir};
use problemd_util::default_config_path;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Run event handlers on problem directories
#[derive(Parser, Debug)]
#[command(name = "problemd-run-event")]
#[command(about = "Run event handlers on problem directories", long_about = None)]
struct Args {
    /// Event to run
    #[arg(short, long, conflicts_with = "list")]
    event: Option<String>,

    /// List the events starting with PREFIX instead of running one
    #[arg(long, value_name = "PREFIX", num_args = 0..=1, default_missing_value = "")]
    list: Option<String>,

    /// Rule file (default: rules_file from the configuration)
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Problem directories
    dirs: Vec<PathBuf>,
}

struct PrintObserver;

impl RunObserver for PrintObserver {
    fn on_output(&mut self, line: &str) {
        println!("{}", line);
    }
}

fn load_settings(args: &Args) -> Result<Settings> {
    if args.config.exists() {
        return load_config(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config));
    }
    debug!(path = %args.config.display(), "No configuration file, using defaults");
    Ok(Settings::default())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut settings = load_settings(&args)?;
    if let Some(rules) = &args.rules {
        settings.service.rules_file = rules.clone();
    }

    if let Some(prefix) = &args.list {
        let mut dirs: Vec<Option<PathBuf>> = args.dirs.iter().cloned().map(Some).collect();
        if dirs.is_empty() {
            dirs.push(None);
        }
        for dir in dirs {
            let rules = load_rule_list(&settings.service.rules_file);
            let mut dd = None;
            for event in list_possible_events(rules, &mut dd, dir.as_deref(), prefix) {
                println!("{}", event);
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let Some(event) = &args.event else {
        bail!("Either --event or --list is required");
    };
    if args.dirs.is_empty() {
        bail!("No problem directory given");
    }

    let mut state = RunState::from_settings(&settings);
    let mut last_status = 0;
    for dir in &args.dirs {
        let status = run_event_on_dir(&mut state, dir, event, &mut PrintObserver)
            .await
            .with_context(|| format!("Failed to run '{}' on {:?}", event, dir))?;
        info!(event = %event, dir = %dir.display(), status, "Event finished");
        if status != 0 {
            last_status = status;
        }
    }

    if state.children_count == 0 {
        eprintln!("No actions are found for event '{}'", event);
        return Ok(ExitCode::from(1));
    }

    Ok(ExitCode::from(u8::try_from(last_status).unwrap_or(1)))
}
