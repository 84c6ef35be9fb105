//! Single-instance guard for watcher runs.
//!
//! An exclusive, non-blocking OS lock on `kpiwatch.lock`. The holder writes a
//! `{pid, acquired_at}` heartbeat into the file so a contender can tell a live
//! run from one that died without cleaning up.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Contents of the lock file while held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Result of trying to take the lock.
#[derive(Debug)]
pub enum Acquire {
    Held(WatchLock),
    /// Another live run holds the lock.
    Busy,
}

/// Held lock. Dropping it removes the file and releases the OS lock.
#[derive(Debug)]
pub struct WatchLock {
    file: File,
    path: PathBuf,
}

impl WatchLock {
    /// Try to take the lock at `path` without blocking.
    ///
    /// On contention the holder's heartbeat is inspected; if the owner is
    /// gone or the heartbeat is older than `stale_after`, the file is
    /// unlinked and acquisition retried once on a fresh inode.
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Acquire, LockError> {
        if let Some(lock) = try_lock(path)? {
            return Ok(Acquire::Held(lock));
        }

        if !is_stale(path, stale_after) {
            debug!(path = %path.display(), "lock held by another run");
            return Ok(Acquire::Busy);
        }

        warn!(path = %path.display(), "reclaiming stale lock");
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        match try_lock(path)? {
            Some(lock) => Ok(Acquire::Held(lock)),
            None => Ok(Acquire::Busy),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_heartbeat(&self) -> std::io::Result<()> {
        let hb = Heartbeat {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let content = serde_json::to_vec(&hb).map_err(std::io::Error::other)?;
        self.file.set_len(0)?;
        let mut f = &self.file;
        f.write_all(&content)?;
        f.sync_data()
    }
}

impl Drop for WatchLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        let _ = FileExt::unlock(&self.file);
    }
}

/// Reopen attempts when the path is swapped between open and lock.
const MAX_REOPEN: usize = 3;

/// Outcome of locking one opened handle.
#[derive(Debug)]
enum Attempt {
    Locked(WatchLock),
    Contended,
    /// Lock taken on an inode that is no longer the one at `path`; a releasing
    /// holder unlinked it between our open and our lock.
    Replaced,
}

fn try_lock(path: &Path) -> Result<Option<WatchLock>, LockError> {
    let io_err = |source: std::io::Error| LockError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    for _ in 0..MAX_REOPEN {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        match lock_opened(file, path)? {
            Attempt::Locked(lock) => return Ok(Some(lock)),
            Attempt::Contended => return Ok(None),
            Attempt::Replaced => debug!(path = %path.display(), "lock file replaced, reopening"),
        }
    }
    Ok(None)
}

fn lock_opened(file: File, path: &Path) -> Result<Attempt, LockError> {
    let io_err = |source: std::io::Error| LockError::Io {
        path: path.to_path_buf(),
        source,
    };

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => return Ok(Attempt::Contended),
        Err(source) => return Err(io_err(source)),
    }

    if !still_linked(&file, path).map_err(io_err)? {
        let _ = FileExt::unlock(&file);
        return Ok(Attempt::Replaced);
    }

    let lock = WatchLock {
        file,
        path: path.to_path_buf(),
    };
    lock.write_heartbeat().map_err(io_err)?;
    debug!(path = %path.display(), pid = std::process::id(), "lock acquired");
    Ok(Attempt::Locked(lock))
}

/// Whether `path` still names the inode behind `file`.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> std::io::Result<bool> {
    Ok(path.exists())
}

/// Read the heartbeat of the current holder, if it wrote one.
pub fn read_heartbeat(path: &Path) -> Option<Heartbeat> {
    let content = fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    match read_heartbeat(path) {
        Some(hb) => {
            if !pid_alive(hb.pid) {
                return true;
            }
            let age = (Utc::now() - hb.acquired_at).to_std().unwrap_or_default();
            age > stale_after
        }
        // Holder has not written its heartbeat yet, or it is unreadable.
        None => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > stale_after),
    }
}

/// Whether a process with `pid` exists.
fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        // Signal 0 only checks for existence and permission.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        true
    }
}
