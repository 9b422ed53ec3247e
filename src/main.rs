use anyhow::Context;
use mirrorgate::clock::SystemClock;
use mirrorgate::config::Config;
use mirrorgate::db::Database;
use mirrorgate::monitor::{HttpProber, Monitor, MonitorSettings};
use mirrorgate::notifications::NotifierHub;
use mirrorgate::sync::{ConfigSync, ProxySync};
use mirrorgate::{PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mirrorgate=debug".parse().context("invalid log directive")?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mirrorgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let _pid_file = match config.daemon.pid_file.as_ref().map(PathBuf::from) {
        Some(path) => {
            let pid_file = PidFile::create(&path)?;
            info!(path = %path.display(), "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    let db = Arc::new(Database::open(&config.storage.database)?);
    let sync = Arc::new(ConfigSync::from_config(db.clone(), &config)?);
    let notifier = Arc::new(NotifierHub::from_config(&config.notifications)?);
    let prober = Arc::new(HttpProber::from_config(&config.monitor)?);

    info!(channels = ?notifier.channel_names(), "Notification channels configured");

    if config.daemon.sync_on_start {
        run_sync(sync.as_ref(), "startup").await;
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Monitor::new(
        db.clone(),
        prober,
        sync.clone(),
        notifier,
        Arc::new(SystemClock),
        MonitorSettings::from_config(&config.monitor),
    );
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx));

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or forced sync (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to install SIGHUP handler")?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, regenerating proxy configuration...");
                    run_sync(sync.as_ref(), "SIGHUP").await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Let the current iteration finish; probes are never cut off mid-flight
    let _ = shutdown_tx.send(true);
    let grace = config.monitor.http_timeout() * 2 + Duration::from_secs(5);
    match tokio::time::timeout(grace, monitor_handle).await {
        Ok(Ok(())) => info!("Monitor stopped"),
        Ok(Err(e)) => error!(error = %e, "Monitor task failed"),
        Err(_) => warn!(timeout_secs = grace.as_secs(), "Monitor did not stop in time"),
    }

    info!("Shutdown complete");
    Ok(())
}

async fn run_sync(sync: &dyn ProxySync, trigger: &str) {
    match sync.sync().await {
        Ok(report) => match report.failure() {
            None => info!(trigger, files = report.files_written, hosts = report.hosts_in_map, "Proxy configuration synced"),
            Some(failure) => error!(trigger, kind = failure.as_str(), error = %failure, "Proxy sync failed"),
        },
        Err(e) => error!(trigger, error = %e, "Proxy sync failed"),
    }
}

/// PID file with exclusive lock to prevent multiple instances
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open PID file {}", path.display()))?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting mirror monitor");
    info!(
        database = %config.storage.database.display(),
        upstream = %config.proxy.upstream,
        sites_dir = %config.proxy.sites_dir.display(),
        "Storage and proxy"
    );
    info!(
        interval_secs = config.monitor.check_interval_secs,
        timeout_secs = config.monitor.http_timeout_secs,
        grace_secs = config.monitor.grace_period_secs,
        fail_threshold = config.monitor.fail_threshold,
        fail_window_secs = config.monitor.fail_window_secs,
        max_concurrent_probes = config.monitor.max_concurrent_probes,
        "Monitor settings"
    );
}
