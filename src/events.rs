/// Append-only plain-text logs: the monitor event log and the restart action log.
///
/// Lines are `[YYYY-MM-DD HH:MM:SS] message` with no color codes. Every entry is
/// mirrored to `tracing`; file writes are skipped when the event log is disabled.
use crate::config::NodeId;
use crate::store;
use chrono::Local;
use std::path::PathBuf;

fn stamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Monitor event log (`monitor.log`).
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    enabled: bool,
}

impl EventLog {
    pub fn new(path: PathBuf, enabled: bool) -> Self {
        Self { path, enabled }
    }

    /// Record a monitor event.
    pub fn record(&self, message: &str) {
        tracing::info!(event = message, "monitor event");
        if !self.enabled {
            return;
        }
        let line = format!("[{}] {message}", stamp());
        if let Err(e) = store::append_line(&self.path, &line) {
            tracing::warn!(error = %e, "failed to append to event log");
        }
    }

    /// Record an anomaly that was repaired or tolerated.
    pub fn warn(&self, message: &str) {
        tracing::warn!(event = message, "monitor anomaly");
        if !self.enabled {
            return;
        }
        let line = format!("[{}] WARNING: {message}", stamp());
        if let Err(e) = store::append_line(&self.path, &line) {
            tracing::warn!(error = %e, "failed to append to event log");
        }
    }
}

/// Restart action log (`restarts.log`), one line per restart performed.
#[derive(Debug, Clone)]
pub struct RestartLog {
    path: PathBuf,
    enabled: bool,
}

impl RestartLog {
    pub fn new(path: PathBuf, enabled: bool) -> Self {
        Self { path, enabled }
    }

    pub fn record(&self, node: NodeId, reason: &str) {
        tracing::warn!(node = %node, reason, "restarting worker");
        if !self.enabled {
            return;
        }
        let line = format!("[{}] RESTART: Node {node} - {reason}", stamp());
        if let Err(e) = store::append_line(&self.path, &line) {
            tracing::warn!(error = %e, "failed to append to restart log");
        }
    }
}
