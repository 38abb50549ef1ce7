//! Process inspection through `/proc` and `nix` signals.
//!
//! Liveness is `kill(pid, 0)` plus a zombie check, since workers spawned by this
//! process stay as zombies until reaped.
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

/// Reap `pid` if it is an exited child of ours. Not-our-child is ignored.
fn reap(pid: i32) {
    let _ = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG));
}

/// `(state, ppid)` from `/proc/<pid>/stat`.
fn read_stat(pid: i32) -> Option<(char, i32)> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parens; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

fn is_zombie(pid: i32) -> bool {
    matches!(read_stat(pid), Some(('Z', _)) | Some(('X', _)))
}

/// Whether a process with this pid exists and has not exited.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    reap(pid);
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => !is_zombie(pid),
        // exists but belongs to another user
        Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// Send a signal, treating "no such process" as success.
pub fn send(pid: i32, sig: Signal) -> Result<(), Errno> {
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Command line of a process, or `None` if it cannot be read.
pub fn cmdline(pid: i32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }
    Some(
        raw.split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect(),
    )
}

fn all_pids() -> Vec<i32> {
    let entries = match std::fs::read_dir("/proc") {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect()
}

/// Live direct children of `pid`.
pub fn children(pid: i32) -> Vec<i32> {
    all_pids()
        .into_iter()
        .filter(|candidate| match read_stat(*candidate) {
            Some((state, ppid)) => ppid == pid && state != 'Z',
            None => false,
        })
        .collect()
}

/// Whether `argv` looks like the worker launched as `program args...`.
///
/// With arguments, `args` must appear as a contiguous run inside `argv`.
/// Without arguments, the executable file names are compared.
pub fn argv_matches(argv: &[String], program: &str, args: &[String]) -> bool {
    if args.is_empty() {
        let want = std::path::Path::new(program).file_name();
        return argv
            .first()
            .map(|first| std::path::Path::new(first).file_name() == want)
            .unwrap_or(false);
    }
    argv.windows(args.len()).any(|window| window == args)
}

/// Live processes (other than ourselves) whose command line matches the worker.
pub fn matching(program: &str, args: &[String]) -> Vec<i32> {
    let me = std::process::id() as i32;
    all_pids()
        .into_iter()
        .filter(|pid| *pid != me)
        .filter(|pid| {
            cmdline(*pid)
                .map(|argv| argv_matches(&argv, program, args))
                .unwrap_or(false)
        })
        .filter(|pid| !is_zombie(*pid))
        .collect()
}
