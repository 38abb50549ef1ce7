/// Per-node restart cooldown persisted as one epoch-seconds integer per file.
///
/// Eligibility depends only on the last permitted restart: a denied check
/// never touches the stored timestamp.
use crate::config::NodeId;
use crate::store::{self, StoreError};
use std::path::PathBuf;

/// Stored state of a node's cooldown file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooldownRecord {
    Absent,
    LastRestart(i64),
    Corrupt(String),
}

/// Outcome of a permit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownVerdict {
    Permitted,
    /// Permitted after replacing a malformed record.
    Repaired,
    Denied { remaining_secs: u64 },
}

impl CooldownVerdict {
    pub fn is_permitted(self) -> bool {
        !matches!(self, CooldownVerdict::Denied { .. })
    }
}

fn parse_record(contents: &str) -> CooldownRecord {
    // Only the exact form we write is accepted: digits and one optional newline
    let digits = contents.strip_suffix('\n').unwrap_or(contents);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return CooldownRecord::Corrupt(contents.to_string());
    }
    match digits.parse::<i64>() {
        Ok(ts) => CooldownRecord::LastRestart(ts),
        Err(_) => CooldownRecord::Corrupt(contents.to_string()),
    }
}

/// Rate limiter preventing repeated restarts of the same node.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    dir: PathBuf,
    cooldown_secs: u64,
}

impl CooldownGate {
    pub fn new(dir: impl Into<PathBuf>, cooldown_secs: u64) -> Self {
        Self {
            dir: dir.into(),
            cooldown_secs,
        }
    }

    fn path(&self, node: NodeId) -> PathBuf {
        self.dir.join(format!("node_{node}"))
    }

    /// Read the stored record without modifying it.
    pub fn read(&self, node: NodeId) -> Result<CooldownRecord, StoreError> {
        Ok(match store::read_optional(&self.path(node))? {
            None => CooldownRecord::Absent,
            Some(contents) => parse_record(&contents),
        })
    }

    /// Seconds until the node may restart again, or `None` if it may now.
    pub fn remaining(&self, node: NodeId, now: i64) -> Option<u64> {
        match self.read(node) {
            Ok(CooldownRecord::LastRestart(last)) => {
                let elapsed = now - last;
                let cooldown = self.cooldown_secs as i64;
                (elapsed < cooldown).then(|| (cooldown - elapsed) as u64)
            }
            _ => None,
        }
    }

    /// Permit a restart at `now` if the cooldown has elapsed, recording `now`.
    ///
    /// Unreadable or malformed records fail open: the check is permitted and the
    /// record rewritten. A failed write still permits and is logged.
    pub fn try_acquire(&self, node: NodeId, now: i64) -> CooldownVerdict {
        let verdict = match self.read(node) {
            Ok(CooldownRecord::LastRestart(last)) => {
                let elapsed = now - last;
                let cooldown = self.cooldown_secs as i64;
                if elapsed < cooldown {
                    return CooldownVerdict::Denied {
                        remaining_secs: (cooldown - elapsed) as u64,
                    };
                }
                CooldownVerdict::Permitted
            }
            Ok(CooldownRecord::Absent) => CooldownVerdict::Permitted,
            Ok(CooldownRecord::Corrupt(contents)) => {
                tracing::warn!(
                    node = %node,
                    contents = %contents.escape_debug(),
                    "corrupt cooldown record, resetting"
                );
                CooldownVerdict::Repaired
            }
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "unreadable cooldown record, resetting");
                CooldownVerdict::Repaired
            }
        };

        if let Err(e) = store::write_atomic(&self.path(node), &format!("{}\n", now.max(0))) {
            tracing::warn!(node = %node, error = %e, "failed to persist cooldown record");
        }
        verdict
    }
}
