/// The monitored set: nodes the daemon currently supervises.
///
/// Persisted as one node id per line, in enrollment order. Every mutation is a
/// read followed by an atomic replace.
use crate::config::NodeId;
use crate::store::{self, StoreError};
use std::path::{Path, PathBuf};

/// Effect of an add/remove request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Added,
    AlreadyPresent,
    Removed,
    NotPresent,
}

impl Membership {
    /// Whether the set actually changed.
    pub fn changed(self) -> bool {
        matches!(self, Membership::Added | Membership::Removed)
    }
}

#[derive(Debug, Clone)]
pub struct MonitoredSet {
    path: PathBuf,
}

fn render(nodes: &[NodeId]) -> String {
    nodes.iter().map(|n| format!("{n}\n")).collect()
}

impl MonitoredSet {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Members in enrollment order. Malformed or duplicate lines are dropped
    /// and the file rewritten.
    pub fn list(&self) -> Result<Vec<NodeId>, StoreError> {
        let Some(contents) = store::read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let mut nodes = Vec::new();
        let mut dirty = false;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<NodeId>() {
                Ok(node) if !nodes.contains(&node) => nodes.push(node),
                _ => dirty = true,
            }
        }
        if dirty {
            tracing::warn!(path = %self.path.display(), "repairing malformed monitored set");
            self.replace(&nodes)?;
        }
        Ok(nodes)
    }

    pub fn contains(&self, node: NodeId) -> Result<bool, StoreError> {
        Ok(self.list()?.contains(&node))
    }

    pub fn add(&self, node: NodeId) -> Result<Membership, StoreError> {
        let mut nodes = self.list()?;
        if nodes.contains(&node) {
            return Ok(Membership::AlreadyPresent);
        }
        nodes.push(node);
        self.replace(&nodes)?;
        Ok(Membership::Added)
    }

    pub fn remove(&self, node: NodeId) -> Result<Membership, StoreError> {
        let mut nodes = self.list()?;
        if !nodes.contains(&node) {
            return Ok(Membership::NotPresent);
        }
        nodes.retain(|n| *n != node);
        self.replace(&nodes)?;
        Ok(Membership::Removed)
    }

    /// Overwrite the whole roster.
    pub fn replace(&self, nodes: &[NodeId]) -> Result<(), StoreError> {
        store::write_atomic(&self.path, &render(nodes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn node(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn set(dir: &tempfile::TempDir) -> MonitoredSet {
        MonitoredSet::new(dir.path().join("monitored"))
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        assert!(set(&dir).list().unwrap().is_empty());
        assert!(!set(&dir).contains(node(1)).unwrap());
    }

    #[test]
    fn test_add_is_idempotent() {
        let dir = tempdir().unwrap();
        let s = set(&dir);
        assert_eq!(s.add(node(3)).unwrap(), Membership::Added);
        let once = std::fs::read_to_string(s.path()).unwrap();
        assert_eq!(s.add(node(3)).unwrap(), Membership::AlreadyPresent);
        assert_eq!(std::fs::read_to_string(s.path()).unwrap(), once);
        assert_eq!(s.list().unwrap(), vec![node(3)]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let s = set(&dir);
        s.add(node(1)).unwrap();
        s.add(node(2)).unwrap();
        assert_eq!(s.remove(node(1)).unwrap(), Membership::Removed);
        assert_eq!(s.remove(node(1)).unwrap(), Membership::NotPresent);
        assert_eq!(s.list().unwrap(), vec![node(2)]);
    }

    #[test]
    fn test_enrollment_order_preserved() {
        let dir = tempdir().unwrap();
        let s = set(&dir);
        for n in [5, 1, 3] {
            s.add(node(n)).unwrap();
        }
        assert_eq!(s.list().unwrap(), vec![node(5), node(1), node(3)]);
        assert_eq!(std::fs::read_to_string(s.path()).unwrap(), "5\n1\n3\n");
    }

    #[test]
    fn test_malformed_lines_repaired() {
        let dir = tempdir().unwrap();
        let s = set(&dir);
        std::fs::write(s.path(), "2\nfoo\n0\n2\n\n7\n").unwrap();
        assert_eq!(s.list().unwrap(), vec![node(2), node(7)]);
        assert_eq!(std::fs::read_to_string(s.path()).unwrap(), "2\n7\n");
    }

    #[test]
    fn test_replace_overwrites_roster() {
        let dir = tempdir().unwrap();
        let s = set(&dir);
        s.add(node(9)).unwrap();
        s.replace(&[node(1), node(2)]).unwrap();
        assert_eq!(s.list().unwrap(), vec![node(1), node(2)]);
        s.replace(&[]).unwrap();
        assert!(s.list().unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(s.path()).unwrap(), "");
    }

    #[test]
    fn test_membership_changed() {
        assert!(Membership::Added.changed());
        assert!(Membership::Removed.changed());
        assert!(!Membership::AlreadyPresent.changed());
        assert!(!Membership::NotPresent.changed());
    }
}
