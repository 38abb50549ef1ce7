//! Durable plain-text state files shared between the daemon and one-shot CLI commands.
//!
//! Every rewrite goes through a temp file in the same directory followed by a
//! rename, so a concurrent reader sees either the old or the new contents.
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Atomically replace `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::Write {
        path: dir.to_path_buf(),
        source: e,
    })?;
    tmp.write_all(contents.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| StoreError::Write {
            path: tmp.path().to_path_buf(),
            source: e,
        })?;

    tmp.persist(path).map_err(|e| StoreError::Rename {
        to: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Append one line to a monotonic log, creating it if needed.
pub fn append_line(path: &Path, line: &str) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;
    writeln!(file, "{line}").map_err(|e| StoreError::Write {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Read a text file, treating a missing file as `None`.
pub fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Read at most the trailing `max_bytes` of a file, dropping a leading partial line.
pub fn read_tail(path: &Path, max_bytes: u64) -> Result<Option<String>, StoreError> {
    let map_err = |e: std::io::Error| StoreError::Read {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(map_err(e)),
    };
    let len = file.metadata().map_err(map_err)?.len();
    let skip = len.saturating_sub(max_bytes);
    if skip > 0 {
        file.seek(SeekFrom::Start(skip)).map_err(map_err)?;
    }
    let mut buf = Vec::with_capacity(len.min(max_bytes) as usize);
    file.read_to_end(&mut buf).map_err(map_err)?;

    let text = String::from_utf8_lossy(&buf).into_owned();
    if skip > 0 {
        return Ok(Some(match text.find('\n') {
            Some(idx) => text[idx + 1..].to_string(),
            None => String::new(),
        }));
    }
    Ok(Some(text))
}

/// Last `n` lines of a text file. Missing files yield an empty list.
pub fn tail_lines(path: &Path, n: usize) -> Result<Vec<String>, StoreError> {
    let Some(contents) = read_optional(path)? else {
        return Ok(Vec::new());
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}

/// Errors from state file operations.
#[derive(Debug)]
pub enum StoreError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            StoreError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
            StoreError::Rename { to, source } => {
                write!(f, "failed to move temp file into {}: {source}", to.display())
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Read { source, .. } => Some(source),
            StoreError::Write { source, .. } => Some(source),
            StoreError::Rename { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_creates_and_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitored");

        write_atomic(&path, "1\n2\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\n2\n");

        write_atomic(&path, "3\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "3\n");

        // Only the target file remains; the temp file was renamed away
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_write_atomic_to_nonexistent_dir_fails() {
        let result = write_atomic(Path::new("/nonexistent/dir/state"), "x");
        assert!(result.is_err());
    }

    #[test]
    fn test_append_line_accumulates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        append_line(&path, "first").unwrap();
        append_line(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_read_optional_missing_is_none() {
        let dir = tempdir().unwrap();
        assert!(read_optional(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn test_read_tail_drops_partial_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.log");
        std::fs::write(&path, "aaaaaaaaaa\nbbbb\ncccc\n").unwrap();

        let tail = read_tail(&path, 12).unwrap().unwrap();
        assert_eq!(tail, "bbbb\ncccc\n");

        let whole = read_tail(&path, 1024).unwrap().unwrap();
        assert_eq!(whole, "aaaaaaaaaa\nbbbb\ncccc\n");
    }

    #[test]
    fn test_tail_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("restarts.log");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        assert_eq!(tail_lines(&path, 2).unwrap(), vec!["c", "d"]);
        assert_eq!(tail_lines(&path, 10).unwrap().len(), 4);
        assert!(tail_lines(&dir.path().join("missing"), 3).unwrap().is_empty());
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Write {
            path: PathBuf::from("/tmp/test"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no perms"),
        };
        let msg = err.to_string();
        assert!(msg.contains("failed to write /tmp/test"));
        assert!(msg.contains("no perms"));
    }
}
