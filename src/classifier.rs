/// Log classification: count outcome lines in a trailing time window.
///
/// A significant line starts with a category word and usually carries a
/// timestamp, e.g. `Success 2026-10-18 14:03:22 share accepted`:
/// - `Success`, `Error`, `Refresh` (case-sensitive, optional trailing `:`)
/// - timestamp `YYYY-MM-DD HH:MM:SS` anywhere in the line, local time
use crate::config::{ClassifierConfig, NodeId};
use crate::data_dir::DataDir;
use crate::store::{self, StoreError};
use chrono::{Local, NaiveDateTime, TimeZone};
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::LazyLock;

static TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}").unwrap());

/// Outcome category of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Category {
    Success,
    Error,
    Refresh,
}

impl Category {
    /// Category named by the first token of a line, if any.
    pub fn from_line(line: &str) -> Option<Self> {
        let token = line.split_whitespace().next()?;
        match token.strip_suffix(':').unwrap_or(token) {
            "Success" => Some(Category::Success),
            "Error" => Some(Category::Error),
            "Refresh" => Some(Category::Refresh),
            _ => None,
        }
    }
}

/// Outcome counts over the window plus staleness of the latest event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateWindow {
    pub success: u64,
    pub error: u64,
    pub refresh: u64,
    pub total: u64,
    pub secs_since_last_event: u64,
}

impl RateWindow {
    /// Success percentage, or `None` when the window is empty.
    pub fn success_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.success as f64 * 100.0 / self.total as f64)
    }

    fn count(&mut self, category: Category) {
        match category {
            Category::Success => self.success += 1,
            Category::Error => self.error += 1,
            Category::Refresh => self.refresh += 1,
        }
        self.total += 1;
    }
}

/// Epoch seconds of the first `YYYY-MM-DD HH:MM:SS` timestamp in a line (local time).
pub fn parse_timestamp(line: &str) -> Option<i64> {
    let m = TIMESTAMP.find(line)?;
    let naive = NaiveDateTime::parse_from_str(m.as_str(), "%Y-%m-%d %H:%M:%S").ok()?;
    // Ambiguous local times (DST fold) resolve to the earlier instant
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

/// Count categorized lines inside `[now - window_secs, now]`.
///
/// Lines are assumed to be appended in time order. A line whose most recent
/// preceding timestamp is older than the window start minus `slack_secs` is
/// skipped before precise checks. Timestamped category lines count when the
/// timestamp is inside the window; untimestamped ones count if they survived
/// that pre-filter.
fn count_window(lines: &[&str], window_secs: u64, slack_secs: u64, now: i64) -> RateWindow {
    let window_start = now.saturating_sub(i64::try_from(window_secs).unwrap_or(i64::MAX));
    let cutoff = window_start.saturating_sub(i64::try_from(slack_secs).unwrap_or(i64::MAX));

    let mut window = RateWindow::default();
    let mut anchor: Option<i64> = None;
    for line in lines {
        let ts = parse_timestamp(line);
        if ts.is_some() {
            anchor = ts;
        }
        if anchor.is_some_and(|t| t < cutoff) {
            continue;
        }
        let Some(category) = Category::from_line(line) else {
            continue;
        };
        if ts.is_some_and(|t| t < window_start) {
            continue;
        }
        window.count(category);
    }
    window
}

/// Latest timestamp among the last `tail` lines.
fn latest_timestamp(lines: &[&str], tail: usize) -> Option<i64> {
    let start = lines.len().saturating_sub(tail);
    lines[start..].iter().filter_map(|l| parse_timestamp(l)).max()
}

/// Reads worker logs and produces rate windows.
#[derive(Debug, Clone)]
pub struct LogClassifier {
    data_dir: DataDir,
    config: ClassifierConfig,
}

impl LogClassifier {
    pub fn new(data_dir: DataDir, config: ClassifierConfig) -> Self {
        Self { data_dir, config }
    }

    /// Rate window for a node's log ending at `now` (epoch seconds).
    pub fn classify(
        &self,
        node: NodeId,
        window_secs: u64,
        now: i64,
    ) -> Result<RateWindow, ClassifyError> {
        self.classify_file(&self.data_dir.node_log(node), window_secs, now)
    }

    /// Rate window for an arbitrary log file.
    ///
    /// A missing or empty file yields all zeros, which reads as "just started".
    pub fn classify_file(
        &self,
        path: &Path,
        window_secs: u64,
        now: i64,
    ) -> Result<RateWindow, ClassifyError> {
        let Some(contents) = store::read_tail(path, self.config.max_scan_bytes)? else {
            return Ok(RateWindow::default());
        };
        let lines: Vec<&str> = contents.lines().collect();
        if lines.iter().all(|l| l.trim().is_empty()) {
            return Ok(RateWindow::default());
        }

        let mut window = count_window(
            &lines,
            window_secs,
            self.config.prefilter_slack_secs,
            now,
        );
        window.secs_since_last_event = match latest_timestamp(&lines, self.config.tail_lines) {
            Some(latest) => (now - latest).max(0) as u64,
            None => modified_age(path, now),
        };

        tracing::debug!(
            file = %path.display(),
            success = window.success,
            error = window.error,
            refresh = window.refresh,
            secs_since_last_event = window.secs_since_last_event,
            "classified log window"
        );
        Ok(window)
    }
}

/// Seconds since the file was last written, 0 if unknown.
fn modified_age(path: &Path, now: i64) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| (now - d.as_secs() as i64).max(0) as u64)
        .unwrap_or(0)
}

/// Errors from reading a worker log.
#[derive(Debug)]
pub enum ClassifyError {
    Read(StoreError),
}

impl std::fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassifyError::Read(e) => write!(f, "failed to classify log: {e}"),
        }
    }
}

impl std::error::Error for ClassifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClassifyError::Read(e) => Some(e),
        }
    }
}

impl From<StoreError> for ClassifyError {
    fn from(e: StoreError) -> Self {
        ClassifyError::Read(e)
    }
}
