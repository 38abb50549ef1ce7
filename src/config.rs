use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Operator-assigned worker identity. Always a positive integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(raw: u32) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u32 = s
            .trim()
            .parse()
            .map_err(|_| format!("invalid node id '{s}'"))?;
        NodeId::new(raw).ok_or_else(|| "node id must be positive".to_string())
    }
}

impl TryFrom<u32> for NodeId {
    type Error = String;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        NodeId::new(raw).ok_or_else(|| "node id must be positive".to_string())
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> u32 {
        id.0
    }
}

/// Top-level configuration loaded from nodekeeper.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct SupervisorConfig {
    pub fleet: FleetConfig,
    pub storage: StorageConfig,
    pub monitor: MonitorConfig,
    pub process: ProcessConfig,
    pub classifier: ClassifierConfig,
    pub rotation: RotationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetConfig {
    pub nodes: Vec<NodeId>,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub check_interval_secs: u64,
    pub inactivity_threshold_secs: u64,
    pub success_rate_threshold: f64,
    pub min_log_entries: u64,
    pub rate_window_secs: u64,
    pub restart_cooldown_secs: u64,
    pub heartbeat_every: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub settle_millis: u64,
    pub grace_timeout_secs: u64,
    pub restart_settle_millis: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub tail_lines: usize,
    pub prefilter_slack_secs: u64,
    pub max_scan_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RotationConfig {
    pub max_size_bytes: u64,
    pub max_backups: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub event_log: bool,
}

// --- Default implementations ---

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            command: "worker".to_string(),
            args: vec!["--node".to_string(), "{node}".to_string()],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".nodekeeper"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            inactivity_threshold_secs: 300,
            success_rate_threshold: 60.0,
            min_log_entries: 20,
            rate_window_secs: 300,
            restart_cooldown_secs: 300,
            heartbeat_every: 10,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            settle_millis: 2000,
            grace_timeout_secs: 10,
            restart_settle_millis: 2000,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            tail_lines: 50,
            prefilter_slack_secs: 60,
            max_scan_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 50 * 1024 * 1024,
            max_backups: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { event_log: true }
    }
}

impl SupervisorConfig {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse config from TOML text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet.nodes.is_empty() {
            return Err(ConfigError::Invalid("fleet.nodes must list at least one node".into()));
        }
        let mut seen = HashSet::new();
        for node in &self.fleet.nodes {
            if !seen.insert(*node) {
                return Err(ConfigError::Invalid(format!(
                    "fleet.nodes lists node {node} more than once"
                )));
            }
        }
        if self.fleet.command.trim().is_empty() {
            return Err(ConfigError::Invalid("fleet.command is empty".into()));
        }
        // Without the placeholder every worker shares one command line and
        // processes cannot be attributed to a node
        if !self.fleet.args.iter().any(|arg| arg.contains("{node}")) {
            return Err(ConfigError::Invalid(
                "fleet.args must contain a {node} placeholder".into(),
            ));
        }
        let threshold = self.monitor.success_rate_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "monitor.success_rate_threshold must be within 0..=100, got {threshold}"
            )));
        }
        if self.monitor.check_interval_secs == 0 {
            return Err(ConfigError::Invalid("monitor.check_interval_secs must be > 0".into()));
        }
        if self.monitor.rate_window_secs == 0 {
            return Err(ConfigError::Invalid("monitor.rate_window_secs must be > 0".into()));
        }
        Ok(())
    }

    /// Resolve an operator-supplied node to a configured fleet member.
    pub fn require(&self, node: NodeId) -> Result<NodeId, ConfigError> {
        if self.fleet.nodes.contains(&node) {
            Ok(node)
        } else {
            Err(ConfigError::UnknownNode {
                node,
                configured: self.fleet.nodes.clone(),
            })
        }
    }

    /// Worker argv for a node, with `{node}` placeholders substituted.
    pub fn worker_args(&self, node: NodeId) -> Vec<String> {
        let id = node.to_string();
        self.fleet
            .args
            .iter()
            .map(|arg| arg.replace("{node}", &id))
            .collect()
    }

    /// Directory holding per-node log files.
    pub fn log_dir(&self) -> PathBuf {
        if self.storage.log_dir.is_absolute() {
            self.storage.log_dir.clone()
        } else {
            self.storage.data_dir.join(&self.storage.log_dir)
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
    UnknownNode {
        node: NodeId,
        configured: Vec<NodeId>,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
            ConfigError::UnknownNode { node, configured } => {
                let valid: Vec<String> = configured.iter().map(|n| n.to_string()).collect();
                write!(
                    f,
                    "node {node} is not configured (valid nodes: {})",
                    valid.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) | ConfigError::UnknownNode { .. } => None,
        }
    }
}
