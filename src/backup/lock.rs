use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const LOCK_FILE: &str = ".ccpack.lock";

#[derive(Error, Debug)]
pub enum LockError {
    #[error("another run is in progress (lock file {}, pid {})", .path.display(), .pid.map_or("unknown".into(), |p| p.to_string()))]
    Held { path: PathBuf, pid: Option<u32> },
    #[error("cannot create lock file {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Exclusive marker for one run over a content directory. Removed on drop.
///
/// The file holds the owner's pid and start time. A lock whose owner is no
/// longer running is broken by the next [`RunLock::acquire`]; where liveness
/// cannot be determined the lock is kept and [`RunLock::break_lock`] is the
/// way out.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(root: &Path) -> Result<Self, LockError> {
        let path = root.join(LOCK_FILE);
        match Self::create(&path) {
            Err(LockError::Held { pid, .. }) if pid.is_some_and(|p| !pid_alive(p)) => {
                warn!(path = %path.display(), pid, "breaking lock left by a process that is no longer running");
                remove(&path)?;
                Self::create(&path)
            }
            other => other,
        }
    }

    /// Remove the lock file regardless of its owner. Returns whether one existed.
    pub fn break_lock(root: &Path) -> Result<bool, LockError> {
        let path = root.join(LOCK_FILE);
        let existed = path.is_file();
        if existed {
            warn!(path = %path.display(), pid = holder(&path), "forcibly removing lock file");
            remove(&path)?;
        }
        Ok(existed)
    }

    fn create(path: &Path) -> Result<Self, LockError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::Held { pid: holder(path), path: path.to_owned() })
            }
            Err(source) => return Err(LockError::Io { path: path.to_owned(), source }),
        };
        let _ = writeln!(file, "{}\n{}", std::process::id(), Utc::now().to_rfc3339());
        Ok(Self { path: path.to_owned() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove lock file");
        }
    }
}

fn remove(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockError::Io { path: path.to_owned(), source }),
    }
}

/// Pid recorded on the first line of a lock file.
fn holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.lines().next()?.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(windows)]
fn pid_alive(pid: u32) -> bool {
    // Unknown counts as alive.
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")))
        .unwrap_or(true)
}

#[cfg(not(any(target_os = "linux", windows)))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(dir.path()).unwrap();
        match RunLock::acquire(dir.path()) {
            Err(LockError::Held { pid, .. }) => assert_eq!(pid, Some(std::process::id())),
            other => panic!("unexpected {other:?}"),
        }
        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
        RunLock::acquire(dir.path()).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lock_of_dead_process_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        fs::write(&path, format!("{}\n2026-01-01T00:00:00+00:00\n", u32::MAX - 1)).unwrap();

        let lock = RunLock::acquire(dir.path()).unwrap();
        assert_eq!(holder(&path), Some(std::process::id()));
        drop(lock);
    }

    #[test]
    fn unreadable_owner_is_kept_until_broken() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), b"").unwrap();

        assert!(matches!(RunLock::acquire(dir.path()), Err(LockError::Held { pid: None, .. })));
        assert!(RunLock::break_lock(dir.path()).unwrap());
        assert!(!RunLock::break_lock(dir.path()).unwrap());
        RunLock::acquire(dir.path()).unwrap();
    }
}
