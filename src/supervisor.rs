//! Supervision loop and worker lifecycle primitives.
//!
//! One `Supervisor` is built from the config at startup and passed by
//! reference to every command. The daemon calls `run_cycle` on a fixed
//! interval; CLI commands call the start/stop/restart primitives directly.

use crate::classifier::{ClassifyError, LogClassifier, RateWindow};
use crate::config::{ConfigError, NodeId, SupervisorConfig};
use crate::cooldown::{CooldownGate, CooldownVerdict};
use crate::daemon::{DaemonError, DaemonHandle};
use crate::data_dir::DataDir;
use crate::events::{EventLog, RestartLog};
use crate::governor::{HealthPolicy, RestartDecision, RestartGovernor, WorkerHealth};
use crate::monitored::{Membership, MonitoredSet};
use crate::registry::{
    ProcessRecord, ProcessRegistry, RegistryError, TerminateOutcome, TerminateReport,
};
use crate::signals::ShutdownSignal;
use crate::store::{self, StoreError};
use chrono::Local;
use std::time::Duration;

/// Whether a start/stop also updates the monitored set.
///
/// `AutoEnroll`: start enrolls the node when the daemon is running, stop
/// removes it. `PreserveExisting`: membership is left untouched, which is what
/// restarts use so supervision is never dropped across them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentPolicy {
    AutoEnroll,
    PreserveExisting,
}

/// Live view of workers for the governor.
pub struct FleetHealth<'a> {
    registry: &'a ProcessRegistry,
    classifier: &'a LogClassifier,
    window_secs: u64,
}

impl WorkerHealth for FleetHealth<'_> {
    fn is_alive(&self, node: NodeId) -> bool {
        self.registry.is_alive(node)
    }

    fn rate_window(&self, node: NodeId, now: i64) -> Result<RateWindow, ClassifyError> {
        self.classifier.classify(node, self.window_secs, now)
    }
}

/// What happened during one supervision cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub idle: bool,
    pub decisions: Vec<RestartDecision>,
    pub restarted: Vec<ProcessRecord>,
    pub failures: Vec<(NodeId, String)>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    data_dir: DataDir,
    registry: ProcessRegistry,
    classifier: LogClassifier,
    gate: CooldownGate,
    monitored: MonitoredSet,
    daemon: DaemonHandle,
    events: EventLog,
    restarts: RestartLog,
}

impl Supervisor {
    /// Build all components and make sure the data directory exists.
    pub fn new(config: &SupervisorConfig) -> Result<Self, SupervisorError> {
        let data_dir = DataDir::from_config(config);
        data_dir.init().map_err(|e| {
            SupervisorError::Store(StoreError::Write {
                path: data_dir.root().to_path_buf(),
                source: e,
            })
        })?;

        let event_log = config.logging.event_log;
        Ok(Self {
            registry: ProcessRegistry::new(config, &data_dir),
            classifier: LogClassifier::new(data_dir.clone(), config.classifier.clone()),
            gate: CooldownGate::new(data_dir.cooldown_dir(), config.monitor.restart_cooldown_secs),
            monitored: MonitoredSet::new(data_dir.monitored()),
            daemon: DaemonHandle::new(&data_dir),
            events: EventLog::new(data_dir.event_log(), event_log),
            restarts: RestartLog::new(data_dir.restart_log(), event_log),
            config: config.clone(),
            data_dir,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn classifier(&self) -> &LogClassifier {
        &self.classifier
    }

    pub fn gate(&self) -> &CooldownGate {
        &self.gate
    }

    pub fn monitored(&self) -> &MonitoredSet {
        &self.monitored
    }

    pub fn daemon(&self) -> &DaemonHandle {
        &self.daemon
    }

    /// Configured node ids in declaration order.
    pub fn fleet(&self) -> &[NodeId] {
        &self.config.fleet.nodes
    }

    pub fn require(&self, node: NodeId) -> Result<NodeId, SupervisorError> {
        Ok(self.config.require(node)?)
    }

    /// Start a worker. Refuses if it is already running.
    pub fn start_worker(
        &self,
        node: NodeId,
        policy: EnrollmentPolicy,
    ) -> Result<ProcessRecord, SupervisorError> {
        let node = self.require(node)?;
        if let Some(existing) = self.registry.lookup(node)? {
            return Err(SupervisorError::AlreadyRunning {
                node,
                pid: existing.pid,
            });
        }

        let record = self.registry.spawn(node).map_err(|e| match e {
            RegistryError::SpawnFailed { node, pid } => {
                let tail = store::tail_lines(&self.data_dir.node_log(node), 3).unwrap_or_default();
                let detail = if tail.is_empty() {
                    format!("pid {pid} exited during startup")
                } else {
                    format!("pid {pid} exited during startup; last output: {}", tail.join(" | "))
                };
                SupervisorError::SpawnFailed { node, detail }
            }
            RegistryError::Spawn { node, source } => SupervisorError::SpawnFailed {
                node,
                detail: source.to_string(),
            },
            other => SupervisorError::Registry(other),
        });
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                self.events.warn(&format!("Failed to start node {node}: {e}"));
                return Err(e);
            }
        };
        self.events
            .record(&format!("Node {node} started (pid {})", record.pid));

        if policy == EnrollmentPolicy::AutoEnroll && self.daemon.running_pid().is_some() {
            self.enroll(node)?;
        }
        Ok(record)
    }

    /// Stop a worker, children first, escalating to SIGKILL after the grace period.
    pub fn stop_worker(
        &self,
        node: NodeId,
        policy: EnrollmentPolicy,
    ) -> Result<TerminateReport, SupervisorError> {
        let node = self.require(node)?;
        let grace = Duration::from_secs(self.config.process.grace_timeout_secs);
        let report = self.registry.terminate(node, grace)?;

        match report.outcome {
            TerminateOutcome::GracefullyStopped => {
                self.events.record(&format!("Node {node} stopped"));
            }
            TerminateOutcome::ForceKilled => {
                self.events.record(&format!("Node {node} force killed"));
            }
            TerminateOutcome::AlreadyDead => {
                tracing::debug!(node = %node, "stop requested for worker that is not running");
            }
            TerminateOutcome::StillAlive => {
                self.events.warn(&format!(
                    "Node {node} (pid {}) survived SIGKILL",
                    report.pid.unwrap_or_default()
                ));
            }
        }
        if !report.leftovers.is_empty() {
            self.events.warn(&format!(
                "Processes for node {node} still running after stop: {:?}",
                report.leftovers
            ));
        }

        if policy == EnrollmentPolicy::AutoEnroll {
            self.unenroll(node)?;
        }
        Ok(report)
    }

    /// Stop then start a worker, keeping its monitored-set membership.
    pub fn restart_worker(&self, node: NodeId, reason: &str) -> Result<ProcessRecord, SupervisorError> {
        let node = self.require(node)?;
        self.restarts.record(node, reason);

        let report = self.stop_worker(node, EnrollmentPolicy::PreserveExisting)?;
        if report.outcome == TerminateOutcome::StillAlive {
            return Err(SupervisorError::StillAlive {
                node,
                pid: report.pid.unwrap_or_default(),
            });
        }
        std::thread::sleep(Duration::from_millis(self.config.process.restart_settle_millis));
        self.start_worker(node, EnrollmentPolicy::PreserveExisting)
    }

    /// Add a node to the monitored set.
    pub fn enroll(&self, node: NodeId) -> Result<Membership, SupervisorError> {
        let node = self.require(node)?;
        let change = self.monitored.add(node)?;
        if change.changed() {
            self.events.record(&format!("Node {node} added to monitoring"));
        }
        Ok(change)
    }

    /// Remove a node from the monitored set.
    pub fn unenroll(&self, node: NodeId) -> Result<Membership, SupervisorError> {
        let change = self.monitored.remove(node)?;
        if change.changed() {
            self.events.record(&format!("Node {node} removed from monitoring"));
        }
        Ok(change)
    }

    /// Reset the monitored set to the live workers, or the whole fleet with `force`.
    pub fn rebuild_monitored(&self, force: bool) -> Result<Vec<NodeId>, SupervisorError> {
        let nodes: Vec<NodeId> = if force {
            self.fleet().to_vec()
        } else {
            let live: Vec<NodeId> = self.registry.records()?.iter().map(|r| r.node).collect();
            self.fleet()
                .iter()
                .copied()
                .filter(|n| live.contains(n))
                .collect()
        };
        self.monitored.replace(&nodes)?;

        let listed: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
        self.events.record(&format!(
            "Monitored set rebuilt{}: {}",
            if force { " (force)" } else { "" },
            if listed.is_empty() { "none".to_string() } else { listed.join(", ") }
        ));
        Ok(nodes)
    }

    /// Rate window for a node over `window_secs` ending at `now`.
    pub fn rates(&self, node: NodeId, window_secs: u64, now: i64) -> Result<RateWindow, SupervisorError> {
        let node = self.require(node)?;
        Ok(self.classifier.classify(node, window_secs, now)?)
    }

    /// One supervision pass over the monitored set.
    ///
    /// Failures are isolated per node: a classification or restart error is
    /// logged and recorded, and the remaining nodes are still processed.
    pub fn run_cycle(&self, cycle: u64, now: i64) -> CycleReport {
        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };

        let nodes = match self.monitored.list() {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read monitored set, skipping cycle");
                report.idle = true;
                return report;
            }
        };
        self.heartbeat(cycle, nodes.len());
        if nodes.is_empty() {
            tracing::debug!(cycle, "no monitored nodes");
            report.idle = true;
            return report;
        }

        let health = FleetHealth {
            registry: &self.registry,
            classifier: &self.classifier,
            window_secs: self.config.monitor.rate_window_secs,
        };
        let governor = RestartGovernor::new(
            &health,
            &self.gate,
            HealthPolicy::from_config(&self.config.monitor),
        );

        for node in nodes {
            if self.config.require(node).is_err() {
                self.events.warn(&format!(
                    "Node {node} is not configured, removing from monitoring"
                ));
                if let Err(e) = self.monitored.remove(node) {
                    tracing::warn!(node = %node, error = %e, "failed to drop unconfigured node");
                }
                continue;
            }

            let decision = match governor.evaluate(node, now) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(node = %node, error = %e, "health evaluation failed");
                    report.failures.push((node, e.to_string()));
                    continue;
                }
            };

            if decision.cooldown == Some(CooldownVerdict::Repaired) {
                self.events.warn(&format!(
                    "Cooldown record for node {node} was corrupt and has been reset"
                ));
            }
            if let Some(reason) = decision.reason {
                if decision.triggered {
                    match self.restart_worker(node, &decision.detail) {
                        Ok(record) => report.restarted.push(record),
                        Err(e) => {
                            self.events
                                .warn(&format!("Restart of node {node} failed: {e}"));
                            report.failures.push((node, e.to_string()));
                        }
                    }
                } else if let Some(CooldownVerdict::Denied { remaining_secs }) = decision.cooldown {
                    self.events.record(&format!(
                        "Node {node} {reason} ({}), restart deferred: cooldown {remaining_secs}s remaining",
                        decision.detail
                    ));
                }
            }
            report.decisions.push(decision);
        }
        report
    }

    fn heartbeat(&self, cycle: u64, monitored: usize) {
        let every = self.config.monitor.heartbeat_every;
        if every > 0 && cycle % every == 0 {
            self.events.record(&format!(
                "Heartbeat: cycle {cycle}, {monitored} node(s) monitored"
            ));
        }
    }

    /// Run cycles until shutdown is requested. The flag is checked only
    /// between cycles, after each interval sleep.
    pub async fn run(&self, shutdown: &ShutdownSignal) {
        let interval = Duration::from_secs(self.config.monitor.check_interval_secs);
        let mut cycle: u64 = 0;
        while !shutdown.is_requested() {
            cycle += 1;
            let now = Local::now().timestamp();
            let report = tokio::task::block_in_place(|| self.run_cycle(cycle, now));
            tracing::debug!(
                cycle = report.cycle,
                idle = report.idle,
                evaluated = report.decisions.len(),
                restarted = report.restarted.len(),
                failures = report.failures.len(),
                "cycle complete"
            );
            tokio::time::sleep(interval).await;
        }
    }

    /// Daemon entry point: take the lock, publish our pid, rebuild the
    /// monitored set, and loop until signalled.
    pub async fn serve(&self, force: bool) -> Result<(), SupervisorError> {
        let _lock = self.daemon.acquire_lock()?;
        let pid = std::process::id() as i32;
        self.daemon.record_pid(pid)?;

        let shutdown = ShutdownSignal::install().map_err(SupervisorError::Signals)?;
        let enrolled = self.rebuild_monitored(force)?;
        self.events.record(&format!(
            "Monitor started (pid {pid}, interval {}s, {} node(s) monitored)",
            self.config.monitor.check_interval_secs,
            enrolled.len()
        ));

        self.run(&shutdown).await;

        self.events.record("Monitor stopped");
        self.daemon.clear_pid(pid);
        Ok(())
    }
}

/// Errors surfaced by supervisor operations.
#[derive(Debug)]
pub enum SupervisorError {
    NotFound {
        node: NodeId,
        configured: Vec<NodeId>,
    },
    AlreadyRunning {
        node: NodeId,
        pid: i32,
    },
    SpawnFailed {
        node: NodeId,
        detail: String,
    },
    StillAlive {
        node: NodeId,
        pid: i32,
    },
    Signals(std::io::Error),
    Config(ConfigError),
    Registry(RegistryError),
    Store(StoreError),
    Classify(ClassifyError),
    Daemon(DaemonError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::NotFound { node, configured } => {
                let valid: Vec<String> = configured.iter().map(|n| n.to_string()).collect();
                write!(
                    f,
                    "node {node} is not configured (valid nodes: {})",
                    valid.join(", ")
                )
            }
            SupervisorError::AlreadyRunning { node, pid } => {
                write!(f, "node {node} is already running (pid {pid})")
            }
            SupervisorError::SpawnFailed { node, detail } => {
                write!(f, "node {node} failed to start: {detail}")
            }
            SupervisorError::StillAlive { node, pid } => {
                write!(f, "node {node} (pid {pid}) could not be stopped")
            }
            SupervisorError::Signals(e) => write!(f, "failed to install signal handlers: {e}"),
            SupervisorError::Config(e) => write!(f, "{e}"),
            SupervisorError::Registry(e) => write!(f, "{e}"),
            SupervisorError::Store(e) => write!(f, "{e}"),
            SupervisorError::Classify(e) => write!(f, "{e}"),
            SupervisorError::Daemon(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Signals(e) => Some(e),
            SupervisorError::Config(e) => Some(e),
            SupervisorError::Registry(e) => Some(e),
            SupervisorError::Store(e) => Some(e),
            SupervisorError::Classify(e) => Some(e),
            SupervisorError::Daemon(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for SupervisorError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::UnknownNode { node, configured } => {
                SupervisorError::NotFound { node, configured }
            }
            other => SupervisorError::Config(other),
        }
    }
}

impl From<RegistryError> for SupervisorError {
    fn from(e: RegistryError) -> Self {
        SupervisorError::Registry(e)
    }
}

impl From<StoreError> for SupervisorError {
    fn from(e: StoreError) -> Self {
        SupervisorError::Store(e)
    }
}

impl From<ClassifyError> for SupervisorError {
    fn from(e: ClassifyError) -> Self {
        SupervisorError::Classify(e)
    }
}

impl From<DaemonError> for SupervisorError {
    fn from(e: DaemonError) -> Self {
        SupervisorError::Daemon(e)
    }
}
