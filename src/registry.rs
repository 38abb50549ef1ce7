/// Process registry: which OS process runs each worker.
///
/// The table is persisted as `pid:node` lines so a restarted monitor (or a
/// one-shot CLI command) can find workers it did not spawn itself. Cached pids
/// are re-validated before use; entries whose process died or whose pid now
/// belongs to an unrelated program are purged.
use crate::config::{NodeId, SupervisorConfig};
use crate::data_dir::DataDir;
use crate::proc_scan;
use crate::rotate;
use crate::store::{self, StoreError};
use nix::sys::signal::Signal;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// A running worker and its OS process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRecord {
    pub node: NodeId,
    pub pid: i32,
}

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    GracefullyStopped,
    ForceKilled,
    AlreadyDead,
    StillAlive,
}

/// Result of `terminate`, including processes still matching the worker afterward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateReport {
    pub outcome: TerminateOutcome,
    pub pid: Option<i32>,
    pub leftovers: Vec<i32>,
}

/// The persisted `pid:node` table.
#[derive(Debug, Clone)]
pub struct ProcessTable {
    path: PathBuf,
}

/// Parse table contents, returning valid records and the number of rejected lines.
fn parse_table(contents: &str) -> (Vec<ProcessRecord>, usize) {
    let mut records: Vec<ProcessRecord> = Vec::new();
    let mut rejected = 0;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = line.split_once(':').and_then(|(pid, node)| {
            let pid: i32 = pid.trim().parse().ok()?;
            let node: NodeId = node.parse().ok()?;
            (pid > 0).then_some(ProcessRecord { node, pid })
        });
        match parsed {
            Some(record) => {
                // Later lines win for the same node
                records.retain(|r| r.node != record.node);
                records.push(record);
            }
            None => rejected += 1,
        }
    }
    (records, rejected)
}

fn render_table(records: &[ProcessRecord]) -> String {
    records
        .iter()
        .map(|r| format!("{}:{}\n", r.pid, r.node))
        .collect()
}

impl ProcessTable {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load all records, rewriting the file if malformed lines were found.
    pub fn load(&self) -> Result<Vec<ProcessRecord>, StoreError> {
        let Some(contents) = store::read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let (records, rejected) = parse_table(&contents);
        if rejected > 0 {
            tracing::warn!(
                path = %self.path.display(),
                rejected,
                "dropping malformed process table entries"
            );
            self.save(&records)?;
        }
        Ok(records)
    }

    fn save(&self, records: &[ProcessRecord]) -> Result<(), StoreError> {
        store::write_atomic(&self.path, &render_table(records))
    }

    pub fn get(&self, node: NodeId) -> Result<Option<ProcessRecord>, StoreError> {
        Ok(self.load()?.into_iter().find(|r| r.node == node))
    }

    /// Insert or replace the record for `record.node`.
    pub fn insert(&self, record: ProcessRecord) -> Result<(), StoreError> {
        let mut records = self.load()?;
        records.retain(|r| r.node != record.node);
        records.push(record);
        self.save(&records)
    }

    pub fn remove(&self, node: NodeId) -> Result<Option<ProcessRecord>, StoreError> {
        let mut records = self.load()?;
        let existing = records.iter().find(|r| r.node == node).copied();
        if existing.is_some() {
            records.retain(|r| r.node != node);
            self.save(&records)?;
        }
        Ok(existing)
    }
}

/// Spawns, checks and terminates worker processes.
pub struct ProcessRegistry {
    table: ProcessTable,
    config: SupervisorConfig,
    data_dir: DataDir,
}

impl ProcessRegistry {
    pub fn new(config: &SupervisorConfig, data_dir: &DataDir) -> Self {
        Self {
            table: ProcessTable::new(data_dir.process_table()),
            config: config.clone(),
            data_dir: data_dir.clone(),
        }
    }

    fn pid_matches_worker(&self, node: NodeId, pid: i32) -> bool {
        if !proc_scan::is_alive(pid) {
            return false;
        }
        match proc_scan::cmdline(pid) {
            Some(argv) => proc_scan::argv_matches(
                &argv,
                &self.config.fleet.command,
                &self.config.worker_args(node),
            ),
            // Unreadable cmdline: trust liveness alone
            None => true,
        }
    }

    /// The validated record for a node; stale entries are purged.
    pub fn lookup(&self, node: NodeId) -> Result<Option<ProcessRecord>, RegistryError> {
        let Some(record) = self.table.get(node)? else {
            return Ok(None);
        };
        if self.pid_matches_worker(node, record.pid) {
            return Ok(Some(record));
        }
        tracing::debug!(node = %node, pid = record.pid, "purging stale process record");
        self.table.remove(node)?;
        Ok(None)
    }

    /// Whether the worker is running. Unreadable state counts as not running.
    pub fn is_alive(&self, node: NodeId) -> bool {
        match self.lookup(node) {
            Ok(record) => record.is_some(),
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "failed to read process table");
                false
            }
        }
    }

    /// All validated records, in table order.
    pub fn records(&self) -> Result<Vec<ProcessRecord>, RegistryError> {
        let mut live = Vec::new();
        for record in self.table.load()? {
            if let Some(valid) = self.lookup(record.node)? {
                live.push(valid);
            }
        }
        Ok(live)
    }

    /// Launch the worker with output redirected to its log file.
    ///
    /// The log is rotated first if oversized. The process must still be alive
    /// after the settle period, otherwise the start counts as failed.
    pub fn spawn(&self, node: NodeId) -> Result<ProcessRecord, RegistryError> {
        let log_path = self.data_dir.node_log(node);
        let rotation = &self.config.rotation;
        if let Err(e) =
            rotate::rotate_if_oversized(&log_path, rotation.max_size_bytes, rotation.max_backups)
        {
            tracing::warn!(node = %node, error = %e, "log rotation failed, continuing");
        }

        std::fs::create_dir_all(self.data_dir.log_dir()).map_err(|e| RegistryError::LogFile {
            path: self.data_dir.log_dir().to_path_buf(),
            source: e,
        })?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| RegistryError::LogFile {
                path: log_path.clone(),
                source: e,
            })?;
        let log_file_stderr = log_file.try_clone().map_err(|e| RegistryError::LogFile {
            path: log_path.clone(),
            source: e,
        })?;

        let args = self.config.worker_args(node);
        tracing::info!(
            node = %node,
            command = %self.config.fleet.command,
            args = ?args,
            log = %log_path.display(),
            "spawning worker"
        );

        let child = Command::new(&self.config.fleet.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_stderr))
            .process_group(0)
            .spawn()
            .map_err(|e| RegistryError::Spawn { node, source: e })?;
        let pid = child.id() as i32;
        // Not waited on here; liveness checks reap it once it exits
        drop(child);

        std::thread::sleep(Duration::from_millis(self.config.process.settle_millis));
        if !proc_scan::is_alive(pid) {
            return Err(RegistryError::SpawnFailed { node, pid });
        }

        let record = ProcessRecord { node, pid };
        self.table.insert(record)?;
        tracing::info!(node = %node, pid, "worker started");
        Ok(record)
    }

    /// Stop a worker: children first, then the worker, escalating to SIGKILL
    /// once `grace` has elapsed.
    pub fn terminate(&self, node: NodeId, grace: Duration) -> Result<TerminateReport, RegistryError> {
        let Some(record) = self.lookup(node)? else {
            return Ok(TerminateReport {
                outcome: TerminateOutcome::AlreadyDead,
                pid: None,
                leftovers: self.leftovers(node),
            });
        };
        let pid = record.pid;

        let mut children = proc_scan::children(pid);
        for child in &children {
            signal_quietly(*child, Signal::SIGTERM);
        }
        proc_scan::send(pid, Signal::SIGTERM).map_err(|e| RegistryError::Signal { pid, source: e })?;
        tracing::debug!(node = %node, pid, children = children.len(), "sent SIGTERM");

        let exited = wait_for_exit(pid, grace);

        // Children that outlived the grace period are killed whatever the worker did
        let stragglers: Vec<i32> = children
            .iter()
            .copied()
            .filter(|child| proc_scan::is_alive(*child))
            .collect();
        for child in &stragglers {
            signal_quietly(*child, Signal::SIGKILL);
        }
        if !stragglers.is_empty() {
            tracing::warn!(node = %node, pids = ?stragglers, "child processes ignored SIGTERM, sent SIGKILL");
        }

        let mut outcome = if exited {
            TerminateOutcome::GracefullyStopped
        } else {
            tracing::warn!(node = %node, pid, "worker ignored SIGTERM, sending SIGKILL");
            children.extend(proc_scan::children(pid));
            for child in &children {
                signal_quietly(*child, Signal::SIGKILL);
            }
            proc_scan::send(pid, Signal::SIGKILL)
                .map_err(|e| RegistryError::Signal { pid, source: e })?;
            if wait_for_exit(pid, KILL_WAIT) {
                TerminateOutcome::ForceKilled
            } else {
                TerminateOutcome::StillAlive
            }
        };

        if outcome != TerminateOutcome::StillAlive {
            self.table.remove(node)?;
        }

        let mut leftovers = self.leftovers(node);
        for child in stragglers {
            if !leftovers.contains(&child) {
                leftovers.push(child);
            }
        }
        if !leftovers.is_empty() {
            tracing::warn!(node = %node, pids = ?leftovers, "processes for worker still running after stop");
        }
        if outcome == TerminateOutcome::StillAlive && !proc_scan::is_alive(pid) {
            outcome = TerminateOutcome::ForceKilled;
            self.table.remove(node)?;
        }

        Ok(TerminateReport {
            outcome,
            pid: Some(pid),
            leftovers,
        })
    }

    /// Processes whose command line still identifies this worker.
    pub fn leftovers(&self, node: NodeId) -> Vec<i32> {
        proc_scan::matching(&self.config.fleet.command, &self.config.worker_args(node))
    }
}

fn signal_quietly(pid: i32, sig: Signal) {
    if let Err(e) = proc_scan::send(pid, sig) {
        tracing::debug!(pid, signal = ?sig, error = %e, "failed to signal child process");
    }
}

fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !proc_scan::is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Errors from registry operations.
#[derive(Debug)]
pub enum RegistryError {
    Store(StoreError),
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The worker binary could not be executed.
    Spawn {
        node: NodeId,
        source: std::io::Error,
    },
    /// The worker exited during the settle period.
    SpawnFailed { node: NodeId, pid: i32 },
    Signal {
        pid: i32,
        source: nix::errno::Errno,
    },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Store(e) => write!(f, "{e}"),
            RegistryError::LogFile { path, source } => {
                write!(f, "failed to open log file {}: {source}", path.display())
            }
            RegistryError::Spawn { node, source } => {
                write!(f, "failed to spawn worker for node {node}: {source}")
            }
            RegistryError::SpawnFailed { node, pid } => {
                write!(f, "worker for node {node} (pid {pid}) exited during startup")
            }
            RegistryError::Signal { pid, source } => {
                write!(f, "failed to signal pid {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Store(e) => Some(e),
            RegistryError::LogFile { source, .. } => Some(source),
            RegistryError::Spawn { source, .. } => Some(source),
            RegistryError::SpawnFailed { .. } => None,
            RegistryError::Signal { source, .. } => Some(source),
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        RegistryError::Store(e)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn node(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    /// Config whose worker is a shell loop tagged with `marker` and the node id.
    pub(crate) fn shell_worker_config(dir: &TempDir, marker: &str, script: &str) -> SupervisorConfig {
        let mut cfg = SupervisorConfig::default();
        cfg.fleet.nodes = vec![node(1), node(2)];
        cfg.fleet.command = "sh".to_string();
        cfg.fleet.args = vec![
            "-c".to_string(),
            script.to_string(),
            format!("{marker}-{{node}}"),
        ];
        cfg.storage.data_dir = dir.path().join(".nodekeeper");
        cfg.process.settle_millis = 200;
        cfg.process.grace_timeout_secs = 2;
        cfg.process.restart_settle_millis = 100;
        cfg
    }

    fn registry(cfg: &SupervisorConfig) -> ProcessRegistry {
        let dd = DataDir::from_config(cfg);
        dd.init().unwrap();
        ProcessRegistry::new(cfg, &dd)
    }

    #[test]
    fn test_parse_table_skips_malformed_lines() {
        let (records, rejected) = parse_table("101:1\ngarbage\n0:2\n102:x\n\n103:3\n");
        assert_eq!(
            records,
            vec![
                ProcessRecord { node: node(1), pid: 101 },
                ProcessRecord { node: node(3), pid: 103 },
            ]
        );
        assert_eq!(rejected, 3);
    }

    #[test]
    fn test_parse_table_last_entry_wins() {
        let (records, rejected) = parse_table("101:1\n202:1\n");
        assert_eq!(records, vec![ProcessRecord { node: node(1), pid: 202 }]);
        assert_eq!(rejected, 0);
    }

    #[test]
    fn test_table_load_repairs_corrupt_file() {
        let dir = tempdir().unwrap();
        let table = ProcessTable::new(dir.path().join("processes"));
        std::fs::write(dir.path().join("processes"), "junk line\n55:4\n").unwrap();

        let records = table.load().unwrap();
        assert_eq!(records, vec![ProcessRecord { node: node(4), pid: 55 }]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("processes")).unwrap(),
            "55:4\n"
        );
    }

    #[test]
    fn test_table_insert_and_remove() {
        let dir = tempdir().unwrap();
        let table = ProcessTable::new(dir.path().join("processes"));
        table.insert(ProcessRecord { node: node(1), pid: 10 }).unwrap();
        table.insert(ProcessRecord { node: node(2), pid: 20 }).unwrap();
        table.insert(ProcessRecord { node: node(1), pid: 11 }).unwrap();

        assert_eq!(table.get(node(1)).unwrap().unwrap().pid, 11);
        assert_eq!(table.remove(node(1)).unwrap().unwrap().pid, 11);
        assert!(table.get(node(1)).unwrap().is_none());
        assert!(table.remove(node(1)).unwrap().is_none());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("processes")).unwrap(),
            "20:2\n"
        );
    }

    #[test]
    fn test_spawn_then_terminate_gracefully() {
        let dir = tempdir().unwrap();
        let cfg = shell_worker_config(&dir, "nk-reg-graceful", "while :; do sleep 1; done");
        let reg = registry(&cfg);

        let record = reg.spawn(node(1)).unwrap();
        assert!(reg.is_alive(node(1)));
        assert!(!reg.is_alive(node(2)));
        assert_eq!(reg.records().unwrap(), vec![record]);

        let report = reg.terminate(node(1), Duration::from_secs(2)).unwrap();
        assert_eq!(report.outcome, TerminateOutcome::GracefullyStopped);
        assert_eq!(report.pid, Some(record.pid));
        assert!(!reg.is_alive(node(1)));
        assert!(reg.records().unwrap().is_empty());
    }

    #[test]
    fn test_spawn_writes_output_to_node_log() {
        let dir = tempdir().unwrap();
        let cfg = shell_worker_config(
            &dir,
            "nk-reg-output",
            "echo 'Success 2026-01-01 00:00:00 hello'; while :; do sleep 1; done",
        );
        let reg = registry(&cfg);
        reg.spawn(node(2)).unwrap();

        let log = DataDir::from_config(&cfg).node_log(node(2));
        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("Success 2026-01-01 00:00:00 hello"));

        reg.terminate(node(2), Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_spawn_failed_when_worker_exits_during_settle() {
        let dir = tempdir().unwrap();
        let cfg = shell_worker_config(&dir, "nk-reg-exit", "exit 3");
        let reg = registry(&cfg);

        let err = reg.spawn(node(1)).unwrap_err();
        assert!(matches!(err, RegistryError::SpawnFailed { .. }));
        assert!(!reg.is_alive(node(1)));
    }

    #[test]
    fn test_spawn_missing_binary() {
        let dir = tempdir().unwrap();
        let mut cfg = shell_worker_config(&dir, "nk-reg-missing", "true");
        cfg.fleet.command = "/nonexistent/worker-binary".to_string();
        let reg = registry(&cfg);
        let err = reg.spawn(node(1)).unwrap_err();
        assert!(matches!(err, RegistryError::Spawn { .. }));
    }

    #[test]
    fn test_terminate_kills_children() {
        let dir = tempdir().unwrap();
        let cfg = shell_worker_config(
            &dir,
            "nk-reg-children",
            "sleep 300 & while :; do sleep 1; done",
        );
        let reg = registry(&cfg);
        let record = reg.spawn(node(1)).unwrap();
        let children = proc_scan::children(record.pid);
        assert!(!children.is_empty());

        reg.terminate(node(1), Duration::from_secs(2)).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        for child in children {
            assert!(!proc_scan::is_alive(child), "child {child} survived");
        }
    }

    #[test]
    fn test_terminate_kills_child_that_ignores_sigterm() {
        let dir = tempdir().unwrap();
        let cfg = shell_worker_config(
            &dir,
            "nk-reg-stubborn-child",
            r#"sh -c 'trap "" TERM; while :; do sleep 1; done' & while :; do sleep 1; done"#,
        );
        let reg = registry(&cfg);
        let record = reg.spawn(node(1)).unwrap();
        let children = proc_scan::children(record.pid);
        assert!(!children.is_empty());

        let report = reg.terminate(node(1), Duration::from_millis(500)).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(!proc_scan::is_alive(record.pid));
        for child in &children {
            assert!(!proc_scan::is_alive(*child), "child {child} survived");
        }
        assert!(
            children.iter().any(|child| report.leftovers.contains(child)),
            "stubborn child missing from leftovers {:?}",
            report.leftovers
        );
    }

    #[test]
    fn test_spawn_rotates_oversized_log() {
        let dir = tempdir().unwrap();
        let mut cfg = shell_worker_config(&dir, "nk-reg-rotate", "while :; do sleep 1; done");
        cfg.rotation.max_size_bytes = 64;
        cfg.rotation.max_backups = 2;
        let reg = registry(&cfg);

        let log = DataDir::from_config(&cfg).node_log(node(1));
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        let old = "Success 2026-01-01 00:00:00 previous run\n".repeat(10);
        std::fs::write(&log, &old).unwrap();

        reg.spawn(node(1)).unwrap();
        let rotated = log.with_file_name("node_1.log.1");
        assert_eq!(std::fs::read_to_string(&rotated).unwrap(), old);
        assert!(std::fs::metadata(&log).unwrap().len() < old.len() as u64);

        reg.terminate(node(1), Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_terminate_escalates_to_sigkill() {
        let dir = tempdir().unwrap();
        let cfg = shell_worker_config(
            &dir,
            "nk-reg-stubborn",
            "trap '' TERM; while :; do sleep 1; done",
        );
        let reg = registry(&cfg);
        reg.spawn(node(1)).unwrap();

        let report = reg.terminate(node(1), Duration::from_millis(500)).unwrap();
        assert_eq!(report.outcome, TerminateOutcome::ForceKilled);
        assert!(!reg.is_alive(node(1)));
    }

    #[test]
    fn test_terminate_unknown_worker_is_already_dead() {
        let dir = tempdir().unwrap();
        let cfg = shell_worker_config(&dir, "nk-reg-absent", "true");
        let reg = registry(&cfg);
        let report = reg.terminate(node(2), Duration::from_secs(1)).unwrap();
        assert_eq!(report.outcome, TerminateOutcome::AlreadyDead);
        assert_eq!(report.pid, None);
    }

    #[test]
    fn test_reused_pid_is_purged() {
        let dir = tempdir().unwrap();
        let cfg = shell_worker_config(&dir, "nk-reg-reused", "true");
        let reg = registry(&cfg);

        // Our own pid is alive but is not the worker
        let dd = DataDir::from_config(&cfg);
        std::fs::write(dd.process_table(), format!("{}:1\n", std::process::id())).unwrap();

        assert!(!reg.is_alive(node(1)));
        assert_eq!(std::fs::read_to_string(dd.process_table()).unwrap(), "");
    }

    #[test]
    fn test_dead_pid_is_purged() {
        let dir = tempdir().unwrap();
        let cfg = shell_worker_config(&dir, "nk-reg-dead", "true");
        let reg = registry(&cfg);

        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let dd = DataDir::from_config(&cfg);
        std::fs::write(dd.process_table(), format!("{pid}:2\n")).unwrap();
        assert!(reg.lookup(node(2)).unwrap().is_none());
    }
}
