//! Daemon mode
//!
//! This module provides background daemon functionality with:
//! - PID file management for single-instance enforcement
//! - Signal handling (SIGTERM/SIGINT for graceful shutdown, SIGHUP to reload
//!   the workflows directory)
//! - The scheduler loop and metrics endpoint, driven by the orchestrator
//!
//! # Example
//!
//! ```no_run
//! use tributary::config::OrchestratorConfig;
//! use tributary::daemon::Daemon;
//! use tributary::orchestrator::Orchestrator;
//! use tributary::units::UnitRegistry;
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = OrchestratorConfig::load(None)?;
//! let orchestrator = Arc::new(Orchestrator::new(config, UnitRegistry::with_builtin()?)?);
//!
//! let mut daemon = Daemon::new(orchestrator, PathBuf::from("/var/run/tributary.pid"))?;
//! daemon.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, TributaryError};
use crate::orchestrator::Orchestrator;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Long-running scheduler process with signal handling and a pid file
pub struct Daemon {
    orchestrator: Arc<Orchestrator>,
    pid_file: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Daemon {
    /// # Errors
    ///
    /// `Other` if another daemon is running with this PID file. A stale PID
    /// file is removed.
    pub fn new(orchestrator: Arc<Orchestrator>, pid_file: PathBuf) -> Result<Self> {
        if let Some(pid) = check_daemon_running(&pid_file)? {
            return Err(TributaryError::Other(format!(
                "Daemon already running with PID {} ({})",
                pid,
                pid_file.display()
            )));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            orchestrator,
            pid_file,
            shutdown_tx,
            shutdown_rx,
        })
    }

    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        info!("Writing PID file: {} (PID: {})", self.pid_file.display(), pid);

        fs::write(&self.pid_file, pid.to_string()).map_err(|e| {
            TributaryError::Io(std::io::Error::other(format!(
                "Failed to write PID file: {}",
                e
            )))
        })
    }

    fn remove_pid_file(&self) -> Result<()> {
        if self.pid_file.exists() {
            info!("Removing PID file: {}", self.pid_file.display());
            fs::remove_file(&self.pid_file)?;
        }
        Ok(())
    }

    /// Run until SIGTERM or SIGINT
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting tributary daemon");

        self.write_pid_file()?;
        let _guard = PidFileGuard {
            pid_file: self.pid_file.clone(),
        };

        let loaded = self.orchestrator.reload().await?;
        info!("Loaded {} workflow(s)", loaded);

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| TributaryError::Other(format!("Failed to setup SIGTERM handler: {}", e)))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| TributaryError::Other(format!("Failed to setup SIGINT handler: {}", e)))?;
        let mut sighup = signal(SignalKind::hangup())
            .map_err(|e| TributaryError::Other(format!("Failed to setup SIGHUP handler: {}", e)))?;

        let orchestrator = Arc::clone(&self.orchestrator);
        let shutdown_rx = self.shutdown_rx.clone();
        let mut driver = tokio::spawn(async move { orchestrator.run_daemon(shutdown_rx).await });

        info!("Daemon started, waiting for signals");

        let early_exit = loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    break None;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                    break None;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading workflows");
                    match self.orchestrator.reload().await {
                        Ok(count) => info!("Reloaded {} workflow(s)", count),
                        Err(e) => error!("Reload failed: {}", e),
                    }
                }
                finished = &mut driver => {
                    break Some(finished);
                }
            }
        };

        let finished = match early_exit {
            Some(finished) => finished,
            None => {
                let _ = self.shutdown_tx.send(true);
                driver.await
            }
        };

        match finished {
            Ok(result) => result?,
            Err(e) => return Err(TributaryError::Other(format!("Daemon task failed: {}", e))),
        }

        self.shutdown()
    }

    /// Signal shutdown and remove the PID file
    pub fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.remove_pid_file()?;
        info!("Daemon shutdown complete");
        Ok(())
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// Removes the PID file when the daemon exits, including on error
struct PidFileGuard {
    pid_file: PathBuf,
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if self.pid_file.exists() {
            debug!("Cleaning up PID file: {}", self.pid_file.display());
            if let Err(e) = fs::remove_file(&self.pid_file) {
                error!("Failed to remove PID file in guard: {}", e);
            }
        }
    }
}

/// PID of the running daemon, if any. Removes a stale PID file.
pub fn check_daemon_running(pid_file: &Path) -> Result<Option<u32>> {
    if !pid_file.exists() {
        return Ok(None);
    }

    let pid: u32 = fs::read_to_string(pid_file)?
        .trim()
        .parse()
        .map_err(|e| TributaryError::Other(format!("Invalid PID in file: {}", e)))?;

    #[cfg(unix)]
    {
        use std::io::ErrorKind;

        // SAFETY: signal 0 only checks that the process exists
        let result = unsafe { libc::kill(pid as i32, 0) };

        if result == 0 {
            Ok(Some(pid))
        } else {
            let err = std::io::Error::last_os_error();
            match err.kind() {
                ErrorKind::PermissionDenied => Ok(Some(pid)),
                ErrorKind::NotFound => {
                    warn!("Stale PID file found, removing");
                    let _ = fs::remove_file(pid_file);
                    Ok(None)
                }
                _ => Err(TributaryError::Other(format!(
                    "Error checking process: {}",
                    err
                ))),
            }
        }
    }

    #[cfg(not(unix))]
    {
        Ok(Some(pid))
    }
}

/// Send SIGTERM to the daemon and wait for it to remove its PID file
pub fn stop_daemon(pid_file: &Path) -> Result<()> {
    let pid = check_daemon_running(pid_file)?
        .ok_or_else(|| TributaryError::Other("Daemon is not running".to_string()))?;

    info!("Stopping daemon (PID: {})", pid);

    #[cfg(unix)]
    {
        // SAFETY: plain kill(2) on a PID confirmed alive just above
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        return Err(TributaryError::Other(
            "Stopping daemon not supported on this platform".to_string(),
        ));
    }

    let timeout = std::time::Duration::from_secs(60);
    let start = std::time::Instant::now();
    while pid_file.exists() && start.elapsed() < timeout {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    if pid_file.exists() {
        warn!("PID file still exists after timeout, daemon may not have stopped cleanly");
    } else {
        info!("Daemon stopped");
    }

    Ok(())
}
