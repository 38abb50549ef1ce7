use crate::classifier::{ClassifyError, RateWindow};
use crate::config::{MonitorConfig, NodeId};
use crate::cooldown::{CooldownGate, CooldownVerdict};
use serde::Serialize;
use std::fmt;

/// Why a node should be restarted, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestartReason {
    NotRunning,
    Hanging,
    LowSuccessRate,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestartReason::NotRunning => "not running",
            RestartReason::Hanging => "hanging",
            RestartReason::LowSuccessRate => "low success rate",
        };
        f.write_str(s)
    }
}

/// Decision returned by the governor for one node in one cycle.
///
/// `reason` is kept even when the cooldown gate denied the restart, so the
/// condition stays observable; `triggered` is true only when a restart
/// should actually happen now.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartDecision {
    pub node: NodeId,
    pub reason: Option<RestartReason>,
    pub triggered: bool,
    pub detail: String,
    pub cooldown: Option<CooldownVerdict>,
}

impl RestartDecision {
    fn healthy(node: NodeId) -> Self {
        Self {
            node,
            reason: None,
            triggered: false,
            detail: "healthy".to_string(),
            cooldown: None,
        }
    }
}

/// What the governor needs to know about a worker.
pub trait WorkerHealth {
    fn is_alive(&self, node: NodeId) -> bool;

    fn rate_window(&self, node: NodeId, now: i64) -> Result<RateWindow, ClassifyError>;
}

/// Thresholds applied to a node's rate window.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub inactivity_threshold_secs: u64,
    pub success_rate_threshold: f64,
    pub min_log_entries: u64,
    pub window_secs: u64,
}

impl HealthPolicy {
    pub fn from_config(monitor: &MonitorConfig) -> Self {
        Self {
            inactivity_threshold_secs: monitor.inactivity_threshold_secs,
            success_rate_threshold: monitor.success_rate_threshold,
            min_log_entries: monitor.min_log_entries,
            window_secs: monitor.rate_window_secs,
        }
    }

    /// First unhealthy condition visible in a live worker's window.
    pub fn diagnose(&self, window: &RateWindow) -> Option<(RestartReason, String)> {
        if window.secs_since_last_event > self.inactivity_threshold_secs {
            return Some((
                RestartReason::Hanging,
                format!(
                    "No log activity for {}s (threshold {}s)",
                    window.secs_since_last_event, self.inactivity_threshold_secs
                ),
            ));
        }
        if window.total >= self.min_log_entries {
            if let Some(rate) = window.success_rate() {
                if rate < self.success_rate_threshold {
                    return Some((
                        RestartReason::LowSuccessRate,
                        format!(
                            "Success rate {rate:.1}% below {}% ({} of {} entries in last {}s)",
                            self.success_rate_threshold,
                            window.success,
                            window.total,
                            self.window_secs
                        ),
                    ));
                }
            }
        }
        None
    }
}

/// Decides per node and per cycle whether a restart is due.
pub struct RestartGovernor<'a, P: WorkerHealth> {
    health: &'a P,
    gate: &'a CooldownGate,
    policy: HealthPolicy,
}

impl<'a, P: WorkerHealth> RestartGovernor<'a, P> {
    pub fn new(health: &'a P, gate: &'a CooldownGate, policy: HealthPolicy) -> Self {
        Self {
            health,
            gate,
            policy,
        }
    }

    /// Evaluate one node at `now` (epoch seconds).
    ///
    /// Conditions are checked in order: not running, hanging, low success
    /// rate. The first match is gated by the cooldown; at most one restart
    /// results per call.
    pub fn evaluate(&self, node: NodeId, now: i64) -> Result<RestartDecision, ClassifyError> {
        let (reason, detail) = if !self.health.is_alive(node) {
            (RestartReason::NotRunning, "Process not running".to_string())
        } else {
            let window = self.health.rate_window(node, now)?;
            match self.policy.diagnose(&window) {
                Some(found) => found,
                None => return Ok(RestartDecision::healthy(node)),
            }
        };

        let verdict = self.gate.try_acquire(node, now);
        if !verdict.is_permitted() {
            tracing::debug!(node = %node, reason = %reason, ?verdict, "restart suppressed by cooldown");
        }
        Ok(RestartDecision {
            node,
            reason: Some(reason),
            triggered: verdict.is_permitted(),
            detail,
            cooldown: Some(verdict),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn node(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    /// Health source with fixed answers per node.
    #[derive(Default)]
    struct FakeHealth {
        alive: HashMap<NodeId, bool>,
        windows: HashMap<NodeId, RateWindow>,
    }

    impl FakeHealth {
        fn with(mut self, n: u32, alive: bool, window: RateWindow) -> Self {
            self.alive.insert(node(n), alive);
            self.windows.insert(node(n), window);
            self
        }
    }

    impl WorkerHealth for FakeHealth {
        fn is_alive(&self, node: NodeId) -> bool {
            self.alive.get(&node).copied().unwrap_or(false)
        }

        fn rate_window(&self, node: NodeId, _now: i64) -> Result<RateWindow, ClassifyError> {
            Ok(self.windows.get(&node).copied().unwrap_or_default())
        }
    }

    fn policy() -> HealthPolicy {
        HealthPolicy {
            inactivity_threshold_secs: 300,
            success_rate_threshold: 60.0,
            min_log_entries: 20,
            window_secs: 300,
        }
    }

    fn window(success: u64, error: u64, idle: u64) -> RateWindow {
        RateWindow {
            success,
            error,
            refresh: 0,
            total: success + error,
            secs_since_last_event: idle,
        }
    }

    #[test]
    fn test_healthy_worker_no_restart() {
        let dir = tempdir().unwrap();
        let gate = CooldownGate::new(dir.path(), 300);
        let health = FakeHealth::default().with(1, true, window(30, 5, 10));
        let decision = RestartGovernor::new(&health, &gate, policy())
            .evaluate(node(1), 1000)
            .unwrap();
        assert_eq!(decision.reason, None);
        assert!(!decision.triggered);
        // Healthy evaluation never consumes the cooldown
        assert!(gate.try_acquire(node(1), 1000).is_permitted());
    }

    #[test]
    fn test_hanging_wins_over_low_success_rate() {
        let dir = tempdir().unwrap();
        let gate = CooldownGate::new(dir.path(), 300);
        let health = FakeHealth::default().with(1, true, window(0, 40, 400));
        let decision = RestartGovernor::new(&health, &gate, policy())
            .evaluate(node(1), 1000)
            .unwrap();
        assert_eq!(decision.reason, Some(RestartReason::Hanging));
        assert!(decision.triggered);
        assert!(decision.detail.contains("400s"));
    }

    #[test]
    fn test_hanging_regardless_of_success_rate() {
        let dir = tempdir().unwrap();
        let gate = CooldownGate::new(dir.path(), 300);
        let health = FakeHealth::default().with(1, true, window(50, 0, 400));
        let decision = RestartGovernor::new(&health, &gate, policy())
            .evaluate(node(1), 1000)
            .unwrap();
        assert_eq!(decision.reason, Some(RestartReason::Hanging));
    }

    #[test]
    fn test_inactivity_at_threshold_is_not_hanging() {
        let dir = tempdir().unwrap();
        let gate = CooldownGate::new(dir.path(), 300);
        let health = FakeHealth::default().with(1, true, window(5, 0, 300));
        let decision = RestartGovernor::new(&health, &gate, policy())
            .evaluate(node(1), 1000)
            .unwrap();
        assert_eq!(decision.reason, None);
    }

    #[test]
    fn test_not_running_wins_over_hanging() {
        let dir = tempdir().unwrap();
        let gate = CooldownGate::new(dir.path(), 300);
        let health = FakeHealth::default().with(1, false, window(0, 40, 4000));
        let decision = RestartGovernor::new(&health, &gate, policy())
            .evaluate(node(1), 1000)
            .unwrap();
        assert_eq!(decision.reason, Some(RestartReason::NotRunning));
        assert!(decision.triggered);
    }

    #[test]
    fn test_never_started_counts_as_not_running() {
        let dir = tempdir().unwrap();
        let gate = CooldownGate::new(dir.path(), 300);
        let health = FakeHealth::default();
        let decision = RestartGovernor::new(&health, &gate, policy())
            .evaluate(node(8), 1000)
            .unwrap();
        assert_eq!(decision.reason, Some(RestartReason::NotRunning));
    }

    #[test]
    fn test_low_success_rate_needs_min_entries() {
        let dir = tempdir().unwrap();
        let gate = CooldownGate::new(dir.path(), 300);
        let few = FakeHealth::default().with(1, true, window(2, 17, 5));
        let decision = RestartGovernor::new(&few, &gate, policy())
            .evaluate(node(1), 1000)
            .unwrap();
        assert_eq!(decision.reason, None);

        let enough = FakeHealth::default().with(1, true, window(5, 20, 5));
        let decision = RestartGovernor::new(&enough, &gate, policy())
            .evaluate(node(1), 1000)
            .unwrap();
        assert_eq!(decision.reason, Some(RestartReason::LowSuccessRate));
        assert!(decision.detail.contains("20.0%"));
    }

    #[test]
    fn test_success_rate_at_threshold_is_healthy() {
        let dir = tempdir().unwrap();
        let gate = CooldownGate::new(dir.path(), 300);
        let health = FakeHealth::default().with(1, true, window(12, 8, 5));
        let decision = RestartGovernor::new(&health, &gate, policy())
            .evaluate(node(1), 1000)
            .unwrap();
        assert_eq!(decision.reason, None);
    }

    #[test]
    fn test_cooldown_keeps_reason_but_suppresses_trigger() {
        let dir = tempdir().unwrap();
        let gate = CooldownGate::new(dir.path(), 300);
        let health = FakeHealth::default().with(1, false, RateWindow::default());
        let governor = RestartGovernor::new(&health, &gate, policy());

        let first = governor.evaluate(node(1), 1000).unwrap();
        assert!(first.triggered);

        let second = governor.evaluate(node(1), 1100).unwrap();
        assert_eq!(second.reason, Some(RestartReason::NotRunning));
        assert!(!second.triggered);
        assert_eq!(
            second.cooldown,
            Some(CooldownVerdict::Denied { remaining_secs: 200 })
        );

        let third = governor.evaluate(node(1), 1300).unwrap();
        assert!(third.triggered);
    }
}
