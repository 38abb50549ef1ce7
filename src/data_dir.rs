use crate::config::{NodeId, SupervisorConfig};
use std::path::{Path, PathBuf};

/// Manages the `.nodekeeper/` directory layout.
///
/// All supervisor state lives under a single data directory (default `.nodekeeper/`).
/// Worker logs live under `log_dir`, which defaults to `<data_dir>/logs`.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
    log_dir: PathBuf,
}

impl DataDir {
    /// Create a new DataDir with worker logs under `<root>/logs`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let log_dir = root.join("logs");
        Self { root, log_dir }
    }

    /// Build the layout described by a loaded config.
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            log_dir: config.log_dir(),
            ..Self::new(&config.storage.data_dir)
        }
    }

    /// The root directory (e.g. `.nodekeeper/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Process table: lines of `pid:node`.
    pub fn process_table(&self) -> PathBuf {
        self.root.join("processes")
    }

    /// Monitored-set roster: one node id per line.
    pub fn monitored(&self) -> PathBuf {
        self.root.join("monitored")
    }

    /// Directory holding one cooldown file per node.
    pub fn cooldown_dir(&self) -> PathBuf {
        self.root.join("cooldown")
    }

    /// Daemon pid file.
    pub fn daemon_pid(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    /// Daemon exclusivity lock file.
    pub fn daemon_lock(&self) -> PathBuf {
        self.root.join("daemon.lock")
    }

    /// Captured stdout/stderr of the detached daemon.
    pub fn daemon_output(&self) -> PathBuf {
        self.root.join("daemon.out")
    }

    /// Append-only monitor event log.
    pub fn event_log(&self) -> PathBuf {
        self.root.join("monitor.log")
    }

    /// Append-only restart action log.
    pub fn restart_log(&self) -> PathBuf {
        self.root.join("restarts.log")
    }

    /// Directory holding worker log files.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Log file a worker's combined output is redirected to.
    pub fn node_log(&self, node: NodeId) -> PathBuf {
        self.log_dir.join(format!("node_{node}.log"))
    }

    /// Create root, cooldown/ and the log directory.
    /// Returns Ok(true) if the root was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.cooldown_dir())?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(created)
    }
}
