//! problemd - The problem collection service
//!
//! This is the main entry point for the problemd service.
//! It wires together all the components:
//! - Configuration loading
//! - Audit journal
//! - Post-processing notifier and authorization checker
//! - Problem service core
//! - IPC server

use anyhow::{Context, Result};
use clap::Parser;
use problemd::Dispatcher;
use problemd_config::{NotifierKind, Settings, load_config};
use problemd_core::Service;
use problemd_host_api::ProblemNotifier;
use problemd_host_linux::{CommandAuthority, PostCreateNotifier, SocketNotifier};
use problemd_ipc::IpcServer;
use problemd_store::{AuditLog, SqliteAuditLog};
use problemd_util::default_config_path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// problemd - Crash problem collection service
#[derive(Parser, Debug)]
#[command(name = "problemd")]
#[command(about = "Crash problem collection service", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/problemd/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set PROBLEMD_SOCKET env var)
    #[arg(short, long, env = "PROBLEMD_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set PROBLEMD_DATA_DIR env var)
    #[arg(short, long, env = "PROBLEMD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log in JSON
    #[arg(long)]
    log_json: bool,
}

/// Time given to client writers to flush the shutdown event
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

struct Daemon {
    dispatcher: Dispatcher,
    ipc: Arc<IpcServer>,
    core_events: tokio::sync::mpsc::UnboundedReceiver<problemd_core::CoreEvent>,
}

impl Daemon {
    async fn new(args: &Args) -> Result<Self> {
        let mut settings = if args.config.exists() {
            load_config(&args.config)
                .with_context(|| format!("Failed to load config from {:?}", args.config))?
        } else {
            warn!(config_path = %args.config.display(), "Config file not found, using defaults");
            Settings::default()
        };

        if let Some(socket) = &args.socket {
            settings.service.socket_path = socket.clone();
        }
        if let Some(data_dir) = &args.data_dir {
            settings.service.data_dir = data_dir.clone();
        }

        info!(
            config_path = %args.config.display(),
            dump_location = %settings.service.dump_location.display(),
            notifier = ?settings.service.notifier,
            "Configuration loaded"
        );

        let data_dir = settings.service.data_dir.clone();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        std::fs::create_dir_all(&settings.service.dump_location).with_context(|| {
            format!(
                "Failed to create dump location {:?}",
                settings.service.dump_location
            )
        })?;

        let db_path = data_dir.join("problemd.db");
        let audit: Arc<dyn AuditLog> = Arc::new(
            SqliteAuditLog::open(&db_path)
                .with_context(|| format!("Failed to open audit journal {:?}", db_path))?,
        );
        info!(db_path = %db_path.display(), "Audit journal initialized");

        let notifier: Arc<dyn ProblemNotifier> =
            match (&settings.service.notifier, &settings.service.notify_socket) {
                (NotifierKind::Socket, Some(socket)) => Arc::new(SocketNotifier::new(socket)),
                (NotifierKind::Socket, None) => {
                    warn!("No notify_socket configured, running post-create rules instead");
                    Arc::new(PostCreateNotifier::from_settings(&settings))
                }
                (NotifierKind::Rules, _) => Arc::new(PostCreateNotifier::from_settings(&settings)),
            };
        let authority = Arc::new(CommandAuthority::new(
            settings.service.authority_command.clone(),
        ));

        let socket_path = settings.service.socket_path.clone();
        let limits = settings.limits.clone();

        let (service, core_events) = Service::new(settings, notifier, authority, audit);
        let loaded = service
            .load_existing_problems()
            .await
            .context("Failed to load existing problems")?;
        info!(count = loaded, "Problem registry ready");

        let mut ipc = IpcServer::new(&socket_path).with_limits(
            usize::try_from(limits.max_message_size).unwrap_or(usize::MAX),
            limits.max_message_unix_fds as usize,
        );
        ipc.start().await?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        let ipc = Arc::new(ipc);
        Ok(Self {
            dispatcher: Dispatcher::new(service, ipc.clone()),
            ipc,
            core_events,
        })
    }

    async fn run(self) -> Result<()> {
        let messages = self
            .ipc
            .take_message_receiver()
            .await
            .context("Message receiver already taken")?;

        // Spawn IPC accept task
        let ipc_accept = self.ipc.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to create SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to create SIGHUP handler")?;

        let shutdown = async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
                _ = sighup.recv() => info!("Received SIGHUP, shutting down gracefully"),
            }
        };

        self.dispatcher
            .run(messages, self.core_events, shutdown)
            .await;

        tokio::time::sleep(SHUTDOWN_GRACE).await;
        self.ipc.shutdown();

        info!("Service stopped");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "problemd starting");

    let daemon = Daemon::new(&args).await?;
    daemon.run().await
}
