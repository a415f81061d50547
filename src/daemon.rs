//! Daemon Infrastructure - Background service running periodic sync cycles
//!
//! The daemon logs in, runs one [`SyncCycle`] per interval and hands the
//! new records to the configured notifier. It manages a PID file and stops
//! gracefully on Ctrl+C or SIGTERM, cancelling any cycle in progress.

use crate::config::{Config, DaemonConfig, SourceConfig};
use crate::cycle::SyncCycle;
use crate::notify::{self, send_json_document, LogNotifier, Notifier};
use crate::record::Record;
use crate::source::RemoteSession;
use crate::store::SqliteStore;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_DOCUMENT_NAME: &str = "new_records.json";

struct Login {
    session: RemoteSession,
    source: SourceConfig,
    password: Option<String>,
}

/// One runnable sync: login, cycle and result delivery
pub struct SyncJob {
    cycle: SyncCycle,
    notifier: Box<dyn Notifier>,
    document_name: String,
    login: Option<Login>,
}

impl SyncJob {
    pub fn new(cycle: SyncCycle, notifier: Box<dyn Notifier>) -> Self {
        Self {
            cycle,
            notifier,
            document_name: DEFAULT_DOCUMENT_NAME.to_string(),
            login: None,
        }
    }

    pub fn with_document_name(mut self, name: impl Into<String>) -> Self {
        self.document_name = name.into();
        self
    }

    /// Log in with `session` before every cycle
    pub fn with_login(
        mut self,
        session: RemoteSession,
        source: SourceConfig,
        password: Option<String>,
    ) -> Self {
        self.login = Some(Login {
            session,
            source,
            password,
        });
        self
    }

    /// Open the store, build the session and wire everything from `config`
    pub fn from_config(config: &Config, notifier: Box<dyn Notifier>) -> Result<Self> {
        let password = config.source.resolve_password()?;
        let session = RemoteSession::new(config.source.request_timeout())
            .context("Failed to create HTTP session")?;

        let store = SqliteStore::open_at(
            Path::new(&config.storage.database),
            &config.storage.allowed_collections,
        )
        .with_context(|| format!("Failed to open record store {}", config.storage.database))?;

        let cycle = SyncCycle::from_config(config, &session, Arc::new(store))?;

        let document_name = config
            .notify
            .telegram
            .as_ref()
            .map(|t| t.document_name.clone())
            .unwrap_or_else(|| DEFAULT_DOCUMENT_NAME.to_string());

        Ok(Self::new(cycle, notifier)
            .with_document_name(document_name)
            .with_login(session, config.source.clone(), password))
    }

    pub fn cycle(&self) -> &SyncCycle {
        &self.cycle
    }

    /// Run one cycle and report its outcome
    ///
    /// Failures are sent as text notifications and returned; a failed
    /// delivery of the new-records document is only logged.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<Vec<Record>> {
        if let Some(login) = &self.login {
            if let Err(e) = login
                .session
                .login(&login.source, login.password.as_deref())
                .await
            {
                let e = anyhow::Error::new(e).context("Login to remote source failed");
                self.report_failure(&e).await;
                return Err(e);
            }
        }

        let new_records = match self.cycle.run_cycle(cancel).await {
            Ok(records) => records,
            Err(e) => {
                let e = anyhow::Error::new(e);
                self.report_failure(&e).await;
                return Err(e);
            }
        };

        if new_records.is_empty() {
            info!("No new records in '{}'", self.cycle.primary_name());
        } else if let Err(e) =
            send_json_document(self.notifier.as_ref(), &self.document_name, &new_records).await
        {
            error!("Failed to deliver {} new records: {:#}", new_records.len(), e);
        }

        Ok(new_records)
    }

    async fn report_failure(&self, e: &anyhow::Error) {
        let text = format!("Sync of '{}' failed: {:#}", self.cycle.primary_name(), e);
        if let Err(notify_err) = self.notifier.notify(&text).await {
            warn!("Failed to send failure notification: {:#}", notify_err);
        }
    }
}

/// Daemon state and control
pub struct Daemon {
    config: Arc<Config>,
    job: SyncJob,
    shutdown_sender: broadcast::Sender<()>,
    cancel: CancellationToken,
    is_running: Arc<AtomicBool>,
    pid_file_path: Option<PathBuf>,
    stats: CycleStats,
    started_at: Instant,
}

/// Counters over the cycles a daemon has run
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub new_records: u64,
    pub last_cycle: Option<Instant>,
}

/// Daemon statistics and status
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub is_running: bool,
    pub uptime: Duration,
    pub stats: CycleStats,
    pub next_cycle_in: Option<Duration>,
}

/// Stops a running daemon from another task
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: broadcast::Sender<()>,
    cancel: CancellationToken,
    is_running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        let _ = self.sender.send(());
    }
}

impl Daemon {
    /// Create a daemon with the notifier and job described by `config`
    pub fn new(config: Config) -> Result<Self> {
        let cancel = CancellationToken::new();
        let notifier = notify::from_config(&config.notify, cancel.clone())
            .context("Failed to create notifier")?;
        let job = SyncJob::from_config(&config, notifier)
            .context("Failed to create sync job for daemon")?;
        Self::with_job(config, job, cancel)
    }

    /// Create a daemon around an already built job
    pub fn with_job(config: Config, job: SyncJob, cancel: CancellationToken) -> Result<Self> {
        let config = Arc::new(config);
        let (shutdown_sender, _) = broadcast::channel(1);

        let pid_file_path = pid_file_path(&config.daemon)?;

        Ok(Self {
            config,
            job,
            shutdown_sender,
            cancel,
            is_running: Arc::new(AtomicBool::new(false)),
            pid_file_path,
            stats: CycleStats::default(),
            started_at: Instant::now(),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: self.shutdown_sender.clone(),
            cancel: self.cancel.clone(),
            is_running: self.is_running.clone(),
        }
    }

    /// Start the daemon in the foreground
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting recordsync daemon");

        self.write_pid_file().context("Failed to write PID file")?;
        self.is_running.store(true, Ordering::SeqCst);
        self.started_at = Instant::now();

        let shutdown_receiver = self.shutdown_sender.subscribe();

        // Spawn shutdown signal handler
        let handle = self.shutdown_handle();
        let signal_task = tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            handle.shutdown();
        });

        let result = self.daemon_loop(shutdown_receiver).await;

        signal_task.abort();
        self.cleanup().context("Failed to cleanup daemon")?;

        result
    }

    /// Detach into the background (Unix platforms)
    ///
    /// Must run before the async runtime starts; the forked child keeps
    /// only the calling thread.
    #[cfg(unix)]
    pub fn daemonize(config: &DaemonConfig) -> Result<()> {
        use daemonize::Daemonize;

        let log_file = if !config.log_file.is_empty() {
            let path = PathBuf::from(config.log_file.as_str());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            Some(fs::File::create(&path).context("Failed to create log file")?)
        } else {
            None
        };

        let mut daemonize = Daemonize::new();

        if let Some(pid_path) = pid_file_path(config)? {
            daemonize = daemonize.pid_file(pid_path);
        }

        if let Some(log_file) = log_file {
            daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
        }

        daemonize.start().context("Failed to daemonize process")?;

        info!("recordsync daemon started as background service");
        Ok(())
    }

    /// Current daemon status
    pub fn status(&self) -> DaemonStatus {
        let is_running = self.is_running.load(Ordering::SeqCst);

        let next_cycle_in = if is_running {
            self.config.daemon.interval_duration().ok().map(|interval| {
                match self.stats.last_cycle {
                    Some(last) => interval.saturating_sub(last.elapsed()),
                    None => interval,
                }
            })
        } else {
            None
        };

        DaemonStatus {
            is_running,
            uptime: self.started_at.elapsed(),
            stats: self.stats.clone(),
            next_cycle_in,
        }
    }

    pub fn job(&self) -> &SyncJob {
        &self.job
    }

    /// Main daemon loop - runs one cycle per interval
    async fn daemon_loop(&mut self, mut shutdown_receiver: broadcast::Receiver<()>) -> Result<()> {
        let cycle_interval = self
            .config
            .daemon
            .interval_duration()
            .context("Failed to parse daemon sync interval")?;
        let mut interval_timer = interval(cycle_interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Daemon loop started with interval: {:?}", cycle_interval);

        if !self.config.daemon.run_on_start {
            // The first tick completes immediately
            interval_timer.tick().await;
        }

        loop {
            tokio::select! {
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received in daemon loop");
                    break;
                }

                _ = interval_timer.tick() => {
                    if !self.is_running.load(Ordering::SeqCst) {
                        break;
                    }

                    debug!("Starting scheduled sync cycle");
                    self.run_cycle().await;
                }
            }
        }

        info!("Daemon loop exiting");
        Ok(())
    }

    async fn run_cycle(&mut self) {
        let cycle_start = Instant::now();
        let result = self.job.run(&self.cancel).await;

        self.stats.total_cycles += 1;
        self.stats.last_cycle = Some(Instant::now());

        match result {
            Ok(new_records) => {
                self.stats.successful_cycles += 1;
                self.stats.new_records += new_records.len() as u64;
                info!(
                    "Cycle completed successfully in {:.2}s: {} new records",
                    cycle_start.elapsed().as_secs_f64(),
                    new_records.len()
                );
            }
            Err(e) => {
                self.stats.failed_cycles += 1;
                error!("Sync cycle failed: {:?}", e);
            }
        }
    }

    /// Write PID file for daemon process management
    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    /// Remove PID file and perform cleanup
    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!(
            "Daemon cleanup completed after {} cycles ({} failed)",
            self.stats.total_cycles, self.stats.failed_cycles
        );
        Ok(())
    }
}

fn pid_file_path(config: &DaemonConfig) -> Result<Option<PathBuf>> {
    if config.pid_file.is_empty() {
        return Ok(None);
    }
    let expanded = shellexpand::full(&config.pid_file).context("Failed to expand PID file path")?;
    Ok(Some(PathBuf::from(expanded.as_ref())))
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => debug!("Ctrl+C received"),
        _ = terminate => debug!("SIGTERM received"),
    }
}

/// Send SIGTERM to the daemon recorded in the PID file
pub fn stop_daemon(config: &Config) -> Result<bool> {
    let Some(pid_file) = pid_file_path(&config.daemon)? else {
        warn!("No PID file configured, cannot stop daemon");
        return Ok(false);
    };

    if !pid_file.exists() {
        warn!("PID file not found, daemon may not be running");
        return Ok(false);
    }

    let pid = read_pid(&pid_file)?;

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .context("Failed to send SIGTERM to daemon process")?;
        info!("Shutdown signal sent to daemon process {}", pid);
        return Ok(true);
    }

    #[cfg(not(unix))]
    {
        warn!("Daemon stop not implemented for this platform (PID {})", pid);
        return Ok(false);
    }
}

fn read_pid(pid_file: &Path) -> Result<u32> {
    let pid_str = fs::read_to_string(pid_file).context("Failed to read PID file")?;
    pid_str.trim().parse().context("Invalid PID in PID file")
}

/// Check if daemon is currently running by checking PID file
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    let Some(pid_file) = pid_file_path(&config.daemon)? else {
        return Ok(false);
    };

    if !pid_file.exists() {
        return Ok(false);
    }

    let pid = read_pid(&pid_file)?;

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => return Ok(true),
            Err(Errno::ESRCH) => {
                // Stale PID file
                let _ = fs::remove_file(&pid_file);
                return Ok(false);
            }
            Err(_) => return Ok(true),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        return Ok(true);
    }
}

/// Job that only logs its results, for one-off runs without notifications
pub fn quiet_job(config: &Config) -> Result<SyncJob> {
    SyncJob::from_config(config, Box::new(LogNotifier))
}
