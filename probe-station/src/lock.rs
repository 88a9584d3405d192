//! Per-probe exclusive locks.
//!
//! Each probe has a lock file, `<lock_dir>/probe_<id>.lock`, and a session
//! holds a non-blocking exclusive `flock(2)` on it for as long as the probe is
//! in use. The file lock, not any in-memory table, is what makes a probe busy,
//! so exclusion also holds between independent processes.
//!
//! A held lock is represented by a [`LockHandle`]. The handle is move-only and
//! [`LockHandle::release`] consumes it, so a lock handed to a session monitor
//! cannot also be released by the dispatcher that acquired it.

use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    tracing::prelude::*,
};

/// Factory for per-probe locks rooted at one directory.
#[derive(Debug, Clone)]
pub struct ProbeLock {
    dir: PathBuf,
}

impl ProbeLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the lock file for a probe.
    pub fn path(&self, probe_id: u32) -> PathBuf {
        self.dir.join(format!("probe_{}.lock", probe_id))
    }

    /// Try once to take the probe's lock.
    ///
    /// Never waits: if another holder exists this returns
    /// [`Error::ProbeBusy`] immediately.
    pub fn acquire(&self, probe_id: u32) -> Result<LockHandle> {
        let path = self.path(probe_id);
        let file = open_lock_file(&self.dir, &path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                debug!(probe = probe_id, path = %path.display(), "Probe lock acquired");
                Ok(LockHandle {
                    probe_id,
                    path,
                    flock,
                })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(Error::ProbeBusy(probe_id)),
            Err((_, errno)) => Err(Error::Io(io::Error::from(errno))),
        }
    }

    /// Whether the probe's lock could be taken right now.
    ///
    /// Takes and immediately releases the lock. Only a snapshot: another
    /// caller may acquire it straight afterwards.
    pub fn is_free(&self, probe_id: u32) -> Result<bool> {
        match self.acquire(probe_id) {
            Ok(handle) => {
                handle.release()?;
                Ok(true)
            }
            Err(Error::ProbeBusy(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// The directory and file are created on every attempt so that a lock
// directory wiped by tmpfs cleanup does not wedge the station.
fn open_lock_file(dir: &Path, path: &Path) -> Result<File> {
    fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    Ok(file)
}

/// A held probe lock.
///
/// Dropping the handle also releases the lock (the file descriptor is
/// closed), which covers panics and cancelled tasks.
pub struct LockHandle {
    probe_id: u32,
    path: PathBuf,
    flock: Flock<File>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("probe_id", &self.probe_id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LockHandle {
    pub fn probe_id(&self) -> u32 {
        self.probe_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock. Consumes the handle.
    pub fn release(self) -> Result<()> {
        let LockHandle {
            probe_id,
            path,
            flock,
        } = self;
        match flock.unlock() {
            Ok(_file) => {
                debug!(probe = probe_id, path = %path.display(), "Probe lock released");
                Ok(())
            }
            // The Flock returned here unlocks again when dropped and the
            // descriptor is closed either way.
            Err((_flock, errno)) => {
                warn!(probe = probe_id, error = %errno, "Explicit unlock failed");
                Err(Error::Io(io::Error::from(errno)))
            }
        }
    }
}
