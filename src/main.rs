use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pokecode::api::{self, AppState};
use pokecode::bus::EventBus;
use pokecode::config::Config;
use pokecode::daemon::{self, PidLock};
use pokecode::runners::ProcessRunnerFactory;
use pokecode::services::{MessageService, QueueService, SessionService};
use pokecode::store::{Store, StoreOptions};
use pokecode::worker::{WorkerConfig, WorkerPool};

/// Interval between background session consistency passes.
const SELF_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "pokecode")]
#[command(version)]
#[command(about = "Local orchestration backend for AI coding agent sessions")]
#[command(long_about = "\
pokecode drives long-running AI coding agents (Claude Code, Codex CLI) on
behalf of mobile and web clients.

It provides:
  - Durable sessions with append-only message history
  - A job queue with one active prompt per session and capped retries
  - A worker pool streaming agent output into the store
  - Server-sent events for live subscribers

FILE LOCATIONS:
    ~/.pokecode/                Base directory for all data
    ~/.pokecode/pokecode.db     Session database (SQLite, WAL)
    ~/.pokecode/pokecode.log    Log file
    ~/.pokecode/config.json     Configuration file
    ~/.pokecode/pokecode.pid    Pid file (locked while serving)
    ~/.pokecode/daemon.json     Daemon descriptor for status/stop

ENVIRONMENT VARIABLES:
    RUST_LOG                  Log filter (overrides logLevel from config)
    POKECODE_PORT             HTTP listen port
    POKECODE_HOST             HTTP bind address
    POKECODE_LOG_LEVEL        Log level
    POKECODE_DATABASE_PATH    SQLite file location")]
struct Cli {
    /// Path to the config file (default: ~/.pokecode/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground.
    Serve,

    /// Stop a running server.
    Stop,

    /// Report whether a server is running.
    Status,

    /// Apply pending database migrations and exit.
    Migrate,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Commands::Serve => run_async(serve(config)),
        Commands::Stop => stop(),
        Commands::Status => status(),
        Commands::Migrate => run_async(migrate(config)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn run_async(future: impl Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(future)
}

/// Install the tracing subscriber: stdout plus the rotating log file.
fn init_tracing(config: &Config) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let log_path = Config::log_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let appender = tracing_appender::rolling::never(
        log_path.parent().unwrap_or_else(|| std::path::Path::new(".")),
        log_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("pokecode.log")),
    );
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    Ok(guard)
}

/// Composition root: store, bus, services, worker pool, HTTP server.
async fn serve(config: Config) -> anyhow::Result<()> {
    let _log_guard = init_tracing(&config)?;
    let pid_lock = PidLock::acquire(&config)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "pokecode starting");

    let store = Arc::new(
        Store::open(&config.database_path, &StoreOptions {
            wal: config.database_wal,
            cache_size: config.database_cache_size,
        })
        .await?,
    );

    let bus = Arc::new(EventBus::new(config.sse_buffer_events));
    let sessions = Arc::new(SessionService::new(Arc::clone(&store)));
    let messages = Arc::new(MessageService::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        config.persist_system_messages,
    ));
    let queue = Arc::new(QueueService::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        config.lease_ttl,
        config.max_job_attempts,
    ));

    // Startup pass repairs any drift left by an unclean shutdown.
    sessions.run_consistency_check().await?;

    let shutdown = CancellationToken::new();
    let self_check = sessions.spawn_self_check(SELF_CHECK_INTERVAL, shutdown.clone());
    let retention = queue.spawn_retention_loop(config.job_retention, shutdown.clone());

    let runners = Arc::new(ProcessRunnerFactory {
        claude_code_path: config.claude_code_path.clone(),
        codex_path: config.codex_path.clone(),
        graceful_shutdown: Duration::from_millis(config.graceful_shutdown_ms),
    });
    let worker = Arc::new(WorkerPool::new(
        Arc::clone(&sessions),
        Arc::clone(&messages),
        Arc::clone(&queue),
        runners,
        WorkerConfig {
            concurrency: config.worker_concurrency,
            polling_interval: Duration::from_millis(config.worker_polling_interval),
        },
        shutdown.clone(),
    ));
    let worker_handle = worker.spawn();

    spawn_signal_handler(shutdown.clone());

    let state = AppState {
        sessions,
        messages,
        queue,
        bus,
        config: Arc::new(config.clone()),
    };
    api::serve(state, &config.host, config.port, shutdown.clone()).await?;

    tracing::info!("shutting down");
    shutdown.cancel();
    worker.shutdown().await;
    let _ = worker_handle.await;
    let _ = self_check.await;
    let _ = retention.await;
    drop(pid_lock);
    Ok(())
}

/// Cancel the shutdown token on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => tracing::info!("received SIGINT"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        shutdown.cancel();
    });
}

fn stop() -> anyhow::Result<()> {
    daemon::stop(Duration::from_secs(15))?;
    println!("stopped");
    Ok(())
}

fn status() -> anyhow::Result<()> {
    match daemon::read_descriptor()? {
        Some(descriptor) if daemon::is_running(&descriptor) => {
            println!(
                "running: pid {pid}, http://{host}:{port}, since {since}, version {version}",
                pid = descriptor.pid,
                host = descriptor.host,
                port = descriptor.port,
                since = descriptor.started_at,
                version = descriptor.version,
            );
            Ok(())
        }
        Some(descriptor) => {
            println!("not running (stale descriptor for pid {pid})", pid = descriptor.pid);
            Ok(())
        }
        None => {
            println!("not running");
            Ok(())
        }
    }
}

async fn migrate(config: Config) -> anyhow::Result<()> {
    // Opening the store applies pending migrations.
    let _store = Store::open(&config.database_path, &StoreOptions {
        wal: config.database_wal,
        cache_size: config.database_cache_size,
    })
    .await?;
    println!("migrations applied");
    Ok(())
}
