/// Daemon handle: pid file, exclusivity lock and detached launch.
///
/// The pid file lets one-shot CLI commands find the running daemon. It is
/// re-validated on every read; a pid that is dead or no longer a nodekeeper
/// daemon is treated as stale and removed.
use crate::data_dir::DataDir;
use crate::proc_scan;
use crate::registry::TerminateOutcome;
use crate::store::{self, StoreError};
use fs2::FileExt;
use nix::sys::signal::Signal;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const RUN_ARGS: [&str; 2] = ["daemon", "run"];

/// Held for the daemon's lifetime; the lock is released when dropped.
#[derive(Debug)]
pub struct DaemonLock {
    _file: File,
}

#[derive(Debug, Clone)]
pub struct DaemonHandle {
    pid_path: PathBuf,
    lock_path: PathBuf,
    output_path: PathBuf,
}

fn looks_like_daemon(pid: i32) -> bool {
    match proc_scan::cmdline(pid) {
        Some(argv) => argv
            .windows(RUN_ARGS.len())
            .any(|w| w[0] == RUN_ARGS[0] && w[1] == RUN_ARGS[1]),
        None => true,
    }
}

impl DaemonHandle {
    pub fn new(data_dir: &DataDir) -> Self {
        Self {
            pid_path: data_dir.daemon_pid(),
            lock_path: data_dir.daemon_lock(),
            output_path: data_dir.daemon_output(),
        }
    }

    /// Pid of the running daemon, cleaning up corrupt or stale pid files.
    pub fn running_pid(&self) -> Option<i32> {
        let contents = match store::read_optional(&self.pid_path) {
            Ok(Some(c)) => c,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read daemon pid file");
                return None;
            }
        };
        let pid = match contents.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => pid,
            _ => {
                tracing::warn!(contents = %contents.escape_debug(), "corrupt daemon pid file, removing");
                self.remove_pid_file();
                return None;
            }
        };
        if proc_scan::is_alive(pid) && looks_like_daemon(pid) {
            return Some(pid);
        }
        tracing::debug!(pid, "removing stale daemon pid file");
        self.remove_pid_file();
        None
    }

    pub fn record_pid(&self, pid: i32) -> Result<(), StoreError> {
        store::write_atomic(&self.pid_path, &format!("{pid}\n"))
    }

    /// Remove the pid file if it still names `pid`.
    pub fn clear_pid(&self, pid: i32) {
        if let Ok(Some(contents)) = store::read_optional(&self.pid_path) {
            if contents.trim().parse::<i32>().ok() == Some(pid) {
                self.remove_pid_file();
            }
        }
    }

    fn remove_pid_file(&self) {
        let _ = std::fs::remove_file(&self.pid_path);
    }

    /// Take the exclusive daemon lock without blocking.
    pub fn acquire_lock(&self) -> Result<DaemonLock, DaemonError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| DaemonError::Lock {
                path: self.lock_path.clone(),
                source: e,
            })?;
        file.try_lock_exclusive().map_err(|e| DaemonError::Lock {
            path: self.lock_path.clone(),
            source: e,
        })?;
        Ok(DaemonLock { _file: file })
    }

    /// Re-launch this executable as a detached `daemon run`.
    ///
    /// The child publishes its own pid once it holds the lock, so a launch that
    /// loses the lock race never overwrites the running daemon's pid file.
    pub fn spawn_detached(&self, config_path: &Path, force: bool) -> Result<i32, DaemonError> {
        let exe = std::env::current_exe().map_err(|e| DaemonError::Spawn { source: e })?;
        let config_path = std::path::absolute(config_path).unwrap_or_else(|_| config_path.to_path_buf());

        let output = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .map_err(|e| DaemonError::Spawn { source: e })?;
        let output_stderr = output
            .try_clone()
            .map_err(|e| DaemonError::Spawn { source: e })?;

        let mut cmd = Command::new(exe);
        cmd.arg("--config").arg(&config_path).args(RUN_ARGS);
        if force {
            cmd.arg("--force");
        }
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(output_stderr))
            .process_group(0)
            .spawn()
            .map_err(|e| DaemonError::Spawn { source: e })?;
        let pid = child.id() as i32;
        tracing::info!(pid, config = %config_path.display(), force, "daemon launched");
        Ok(pid)
    }

    /// Ask the daemon to stop, escalating to SIGKILL after `timeout`.
    pub fn stop(&self, timeout: Duration) -> Result<TerminateOutcome, DaemonError> {
        let Some(pid) = self.running_pid() else {
            return Ok(TerminateOutcome::AlreadyDead);
        };
        proc_scan::send(pid, Signal::SIGTERM).map_err(|e| DaemonError::Signal { pid, source: e })?;

        let outcome = if wait_for_exit(pid, timeout) {
            TerminateOutcome::GracefullyStopped
        } else {
            tracing::warn!(pid, "daemon did not stop in time, sending SIGKILL");
            proc_scan::send(pid, Signal::SIGKILL)
                .map_err(|e| DaemonError::Signal { pid, source: e })?;
            if wait_for_exit(pid, Duration::from_secs(2)) {
                TerminateOutcome::ForceKilled
            } else {
                TerminateOutcome::StillAlive
            }
        };
        if outcome != TerminateOutcome::StillAlive {
            self.clear_pid(pid);
        }
        Ok(outcome)
    }
}

fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while proc_scan::is_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    true
}

/// Errors from daemon lifecycle operations.
#[derive(Debug)]
pub enum DaemonError {
    /// Another daemon holds the lock, or the lock file is unusable.
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    Spawn {
        source: std::io::Error,
    },
    Signal {
        pid: i32,
        source: nix::errno::Errno,
    },
    Store(StoreError),
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::Lock { path, source } => {
                write!(f, "failed to acquire daemon lock {}: {source}", path.display())
            }
            DaemonError::Spawn { source } => write!(f, "failed to launch daemon: {source}"),
            DaemonError::Signal { pid, source } => {
                write!(f, "failed to signal daemon pid {pid}: {source}")
            }
            DaemonError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::Lock { source, .. } => Some(source),
            DaemonError::Spawn { source } => Some(source),
            DaemonError::Signal { source, .. } => Some(source),
            DaemonError::Store(e) => Some(e),
        }
    }
}

impl From<StoreError> for DaemonError {
    fn from(e: StoreError) -> Self {
        DaemonError::Store(e)
    }
}
