/// Status reports for workers and the daemon, rendered as text or JSON.
use crate::classifier::RateWindow;
use crate::config::NodeId;
use crate::store;
use crate::supervisor::{Supervisor, SupervisorError};
use serde::Serialize;

/// Snapshot of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub node: NodeId,
    pub pid: Option<i32>,
    pub running: bool,
    pub monitored: bool,
    pub cooldown_remaining_secs: Option<u64>,
    pub rates: RateWindow,
    pub success_rate: Option<f64>,
}

/// Snapshot of the supervision daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<i32>,
    pub monitored: Vec<NodeId>,
    pub recent_events: Vec<String>,
    pub recent_restarts: Vec<String>,
}

/// Collect the status of one configured worker at `now`.
pub fn worker_status(
    sup: &Supervisor,
    node: NodeId,
    now: i64,
) -> Result<WorkerStatus, SupervisorError> {
    let node = sup.require(node)?;
    let record = sup.registry().lookup(node)?;
    let rates = sup
        .classifier()
        .classify(node, sup.config().monitor.rate_window_secs, now)?;
    Ok(WorkerStatus {
        node,
        pid: record.map(|r| r.pid),
        running: record.is_some(),
        monitored: sup.monitored().contains(node)?,
        cooldown_remaining_secs: sup.gate().remaining(node, now),
        success_rate: rates.success_rate(),
        rates,
    })
}

/// Collect the daemon status with the last `lines` entries of each log.
pub fn daemon_status(sup: &Supervisor, lines: usize) -> Result<DaemonStatus, SupervisorError> {
    let pid = sup.daemon().running_pid();
    let data_dir = sup.data_dir();
    Ok(DaemonStatus {
        running: pid.is_some(),
        pid,
        monitored: sup.monitored().list()?,
        recent_events: store::tail_lines(&data_dir.event_log(), lines)?,
        recent_restarts: store::tail_lines(&data_dir.restart_log(), lines)?,
    })
}

fn percent(rate: Option<f64>) -> String {
    rate.map(|r| format!("{r:.1}%")).unwrap_or_else(|| "n/a".to_string())
}

/// Aligned table, one row per worker.
pub fn render_workers(rows: &[WorkerStatus]) -> String {
    let mut out = format!(
        "{:<6} {:<8} {:<8} {:<10} {:>8} {:>6} {:>11} {:>9}\n",
        "NODE", "PID", "STATE", "MONITORED", "SUCCESS", "TOTAL", "LAST EVENT", "COOLDOWN"
    );
    for row in rows {
        out.push_str(&format!(
            "{:<6} {:<8} {:<8} {:<10} {:>8} {:>6} {:>11} {:>9}\n",
            row.node,
            row.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            if row.running { "running" } else { "stopped" },
            if row.monitored { "yes" } else { "no" },
            percent(row.success_rate),
            row.rates.total,
            format!("{}s", row.rates.secs_since_last_event),
            row.cooldown_remaining_secs
                .map(|s| format!("{s}s"))
                .unwrap_or_else(|| "-".to_string()),
        ));
    }
    out
}

pub fn render_daemon(status: &DaemonStatus) -> String {
    let mut out = match status.pid {
        Some(pid) => format!("Daemon: running (pid {pid})\n"),
        None => "Daemon: not running\n".to_string(),
    };
    let monitored: Vec<String> = status.monitored.iter().map(|n| n.to_string()).collect();
    out.push_str(&format!(
        "Monitored nodes: {}\n",
        if monitored.is_empty() { "none".to_string() } else { monitored.join(", ") }
    ));
    for (title, lines) in [
        ("Recent events", &status.recent_events),
        ("Recent restarts", &status.recent_restarts),
    ] {
        out.push_str(&format!("\n{title}:\n"));
        if lines.is_empty() {
            out.push_str("  (none)\n");
        }
        for line in lines {
            out.push_str(&format!("  {line}\n"));
        }
    }
    out
}

/// One-line summary of a rate window.
pub fn render_rates(node: NodeId, window: &RateWindow, window_secs: u64) -> String {
    format!(
        "Node {node}: {} success, {} error, {} refresh (total {}) in last {}s, success rate {}, last event {}s ago",
        window.success,
        window.error,
        window.refresh,
        window.total,
        window_secs,
        percent(window.success_rate()),
        window.secs_since_last_event
    )
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(value)
}
