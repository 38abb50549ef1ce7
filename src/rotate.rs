//! Size-triggered rotation of worker log files.
//!
//! `node_3.log` becomes `node_3.log.1`, older backups shift to `.2`, `.3`, ...
//! and anything numbered above `max_backups` is deleted.

use std::path::{Path, PathBuf};

fn backup_path(path: &Path, n: u32) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{n}"));
    PathBuf::from(os)
}

/// Rotate `path` if it is larger than `max_size_bytes`.
///
/// Returns `Ok(true)` when a rotation happened. A missing file is a no-op.
pub fn rotate_if_oversized(
    path: &Path,
    max_size_bytes: u64,
    max_backups: u32,
) -> std::io::Result<bool> {
    let size = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size <= max_size_bytes {
        return Ok(false);
    }

    if max_backups == 0 {
        std::fs::remove_file(path)?;
    } else {
        for n in (1..max_backups).rev() {
            let from = backup_path(path, n);
            if from.exists() {
                std::fs::rename(&from, backup_path(path, n + 1))?;
            }
        }
        std::fs::rename(path, backup_path(path, 1))?;
    }

    prune_backups(path, max_backups);
    tracing::info!(
        file = %path.display(),
        size,
        max_size_bytes,
        "rotated oversized log file"
    );
    Ok(true)
}

/// Delete numbered backups beyond `max_backups`.
/// Errors on individual files are logged but do not stop processing.
fn prune_backups(path: &Path, max_backups: u32) {
    let pattern = format!("{}.*", glob::Pattern::escape(&path.to_string_lossy()));
    let entries = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!(error = %e, "invalid backup glob pattern");
            return;
        }
    };

    for entry in entries.flatten() {
        // Only numeric suffixes are backups: "node_1.log.7"
        let index: u32 = match entry
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
        {
            Some(n) => n,
            None => continue,
        };
        if index > max_backups {
            if let Err(e) = std::fs::remove_file(&entry) {
                tracing::warn!(
                    error = %e,
                    file = %entry.display(),
                    "failed to prune log backup"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node_1.log");
        assert!(!rotate_if_oversized(&path, 10, 3).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_small_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node_1.log");
        std::fs::write(&path, "short").unwrap();
        assert!(!rotate_if_oversized(&path, 10, 3).unwrap());
        assert!(path.exists());
        assert!(!backup_path(&path, 1).exists());
    }

    #[test]
    fn test_exact_threshold_not_rotated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node_1.log");
        std::fs::write(&path, "0123456789").unwrap();
        assert!(!rotate_if_oversized(&path, 10, 3).unwrap());
    }

    #[test]
    fn test_rotation_shifts_backups() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node_1.log");
        std::fs::write(&path, "current contents over limit").unwrap();
        std::fs::write(backup_path(&path, 1), "one").unwrap();
        std::fs::write(backup_path(&path, 2), "two").unwrap();

        assert!(rotate_if_oversized(&path, 10, 3).unwrap());

        assert!(!path.exists());
        assert_eq!(
            std::fs::read_to_string(backup_path(&path, 1)).unwrap(),
            "current contents over limit"
        );
        assert_eq!(std::fs::read_to_string(backup_path(&path, 2)).unwrap(), "one");
        assert_eq!(std::fs::read_to_string(backup_path(&path, 3)).unwrap(), "two");
    }

    #[test]
    fn test_oldest_backup_dropped_at_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node_1.log");
        std::fs::write(&path, "current contents over limit").unwrap();
        std::fs::write(backup_path(&path, 1), "one").unwrap();
        std::fs::write(backup_path(&path, 2), "two").unwrap();

        assert!(rotate_if_oversized(&path, 10, 2).unwrap());

        assert_eq!(
            std::fs::read_to_string(backup_path(&path, 1)).unwrap(),
            "current contents over limit"
        );
        assert_eq!(std::fs::read_to_string(backup_path(&path, 2)).unwrap(), "one");
        assert!(!backup_path(&path, 3).exists());
    }

    #[test]
    fn test_stale_backups_beyond_limit_pruned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node_1.log");
        std::fs::write(&path, "current contents over limit").unwrap();
        std::fs::write(backup_path(&path, 7), "ancient").unwrap();
        std::fs::write(dir.path().join("node_1.log.notes"), "keep me").unwrap();

        rotate_if_oversized(&path, 10, 2).unwrap();

        assert!(!backup_path(&path, 7).exists());
        assert!(dir.path().join("node_1.log.notes").exists());
    }

    #[test]
    fn test_zero_backups_discards_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node_1.log");
        std::fs::write(&path, "current contents over limit").unwrap();

        assert!(rotate_if_oversized(&path, 10, 0).unwrap());
        assert!(!path.exists());
        assert!(!backup_path(&path, 1).exists());
    }
}
