use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use recordsync::daemon::{is_daemon_running, quiet_job, stop_daemon, SyncJob};
use recordsync::notify;
use recordsync::{Config, Daemon, LoggingConfig, SqliteStore};

#[derive(Parser)]
#[command(name = "recordsync")]
#[command(about = "Periodic record collection sync with change notifications")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Run one sync cycle now
    Sync {
        /// Also write the new records to this file as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Deliver results through the configured notifier
        #[arg(long)]
        notify: bool,
    },

    /// Run as daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },

    /// Show stored record counts and daemon state
    Status,
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = &cli.command {
        init_logging(cli.verbose, &LoggingConfig::default())?;
        return cmd_init(cli.config.as_deref(), *force);
    }

    let config = load_config(cli.config.as_deref())?;

    // Forking has to happen before the runtime spawns its threads
    if let Commands::Daemon {
        daemon_command: DaemonCommands::Start { foreground: false },
    } = &cli.command
    {
        if is_daemon_running(&config)? {
            println!("⚠️  Daemon is already running!");
            println!("   Use 'recordsync daemon stop' to stop it first");
            return Ok(());
        }
        println!("🚀 Starting recordsync daemon in background...");
        println!("   PID file: {}", config.daemon.pid_file);
        println!("   Log file: {}", config.daemon.log_file);
        daemonize(&config)?;
    }

    init_logging(cli.verbose, &config.logging)?;
    info!("Starting recordsync v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Init { .. } => Ok(()),
            Commands::Sync { output, notify } => cmd_sync(output, notify, &config).await,
            Commands::Daemon { daemon_command } => cmd_daemon(daemon_command, &config).await,
            Commands::Status => cmd_status(&config).await,
        }
    })
}

/// Initialize logging from the configured level, overridden by RUST_LOG or --verbose
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let compact = logging.format == "compact";

    tracing_subscriber::registry()
        .with(compact.then(|| fmt::layer().compact()))
        .with((!compact).then(|| fmt::layer()))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

#[cfg(unix)]
fn daemonize(config: &Config) -> Result<()> {
    Daemon::daemonize(&config.daemon)
}

#[cfg(not(unix))]
fn daemonize(_config: &Config) -> Result<()> {
    anyhow::bail!("Background daemon mode not supported on this platform, use --foreground")
}

/// Write a default configuration file
fn cmd_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };

    if config_path.exists() && !force {
        println!("⚠️  Configuration already exists: {}", config_path.display());
        println!("   Use --force to overwrite it");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let config = Config::default();
    config.save(&config_path)?;

    println!("✅ recordsync initialized successfully!");
    println!("   Config: {}", config_path.display());
    println!("   Database: {}", config.storage.database);
    println!("   Next: set source.username and source.password, then run 'recordsync sync'");

    Ok(())
}

/// Run one cycle in the foreground
async fn cmd_sync(output: Option<PathBuf>, deliver: bool, config: &Config) -> Result<()> {
    println!("🔄 Running sync cycle...");

    let cancel = CancellationToken::new();
    let mut job = if deliver {
        let notifier = notify::from_config(&config.notify, cancel.clone())?;
        SyncJob::from_config(config, notifier)?
    } else {
        quiet_job(config)?
    };

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let new_records = job.run(&cancel).await?;

    println!("✅ Sync completed");
    println!("   Known records: {}", job.cycle().seen().len());
    println!("   New records: {}", new_records.len());

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&new_records)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write output file: {}", path.display()))?;
        println!("   Written to: {}", path.display());
    }

    Ok(())
}

/// Handle daemon commands
async fn cmd_daemon(daemon_command: DaemonCommands, config: &Config) -> Result<()> {
    match daemon_command {
        DaemonCommands::Start { foreground } => {
            if foreground {
                if is_daemon_running(config)? {
                    println!("⚠️  Daemon is already running!");
                    println!("   Use 'recordsync daemon stop' to stop it first");
                    return Ok(());
                }
                println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
            }

            let mut daemon = Daemon::new(config.clone())?;
            daemon.run().await?;
        }

        DaemonCommands::Stop => {
            println!("🛑 Stopping recordsync daemon...");

            if !is_daemon_running(config)? {
                println!("⚠️  No daemon appears to be running");
                return Ok(());
            }

            if stop_daemon(config)? {
                println!("✅ Daemon stop signal sent");
            }
        }

        DaemonCommands::Status => {
            println!("📊 recordsync Daemon Status");

            if is_daemon_running(config)? {
                println!("   🟢 Status: Running");
                println!("   🔄 Sync interval: {}", config.daemon.interval);
                println!("   📄 PID file: {}", config.daemon.pid_file);
            } else {
                println!("   🔴 Status: Not running");
                println!("   💡 Start with: recordsync daemon start");
            }
        }
    }

    Ok(())
}

/// Show stored record counts per collection
async fn cmd_status(config: &Config) -> Result<()> {
    println!("📊 recordsync Status");
    println!("   Database: {}", config.storage.database);

    let store = SqliteStore::open_at(
        Path::new(&config.storage.database),
        &config.storage.allowed_collections,
    )?;

    for collection in &config.source.collections {
        let count = store.count(&collection.name.to_lowercase()).await?;
        let marker = if collection.primary { " (primary)" } else { "" };
        println!("   📁 {}{}: {} records", collection.name, marker, count);
    }

    let running = is_daemon_running(config)?;
    println!(
        "   {} Daemon: {}",
        if running { "🟢" } else { "🔴" },
        if running { "running" } else { "not running" }
    );

    Ok(())
}
