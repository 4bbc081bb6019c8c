//! Single-owner lock on a data directory.
//!
//! The `LOCK` file holds the owning process id as JSON. A lock whose owner
//! is no longer running is stale and is reclaimed. The file is removed when
//! the [`DirLock`] is dropped.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const LOCK_FILE: &str = "LOCK";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    /// Microseconds since the UNIX epoch.
    acquired_at: u64,
}

/// Exclusive ownership of a data directory for the life of the value.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock in `dir`, reclaiming it if its owner has exited.
    pub fn acquire(dir: &Path) -> Result<Self, EngineError> {
        let path = dir.join(LOCK_FILE);
        // Two attempts: the second follows removal of a stale lock.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_at: crate::concept::now_micros(),
                    };
                    let json = serde_json::to_vec(&info).map_err(|e| EngineError::InvalidConfig {
                        message: format!("failed to encode lock file: {e}"),
                    })?;
                    file.write_all(&json)
                        .and_then(|_| file.sync_all())
                        .map_err(|e| data_dir_error(&path, e))?;
                    tracing::debug!(path = %path.display(), pid = info.pid, "acquired data directory lock");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| serde_json::from_str::<LockInfo>(&s).ok());
                    match owner {
                        Some(info) if info.pid == std::process::id() || process_alive(info.pid) => {
                            return Err(EngineError::Locked {
                                path: dir.display().to_string(),
                                pid: info.pid,
                            });
                        }
                        stale => {
                            tracing::warn!(
                                path = %path.display(),
                                pid = ?stale.map(|i| i.pid),
                                "reclaiming stale data directory lock"
                            );
                            match std::fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                                Err(e) => return Err(data_dir_error(&path, e)),
                            }
                        }
                    }
                }
                Err(e) => return Err(data_dir_error(&path, e)),
            }
        }
        Err(EngineError::Locked {
            path: dir.display().to_string(),
            pid: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

fn data_dir_error(path: &Path, source: std::io::Error) -> EngineError {
    EngineError::DataDir {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // pid 0 addresses our process group and negative values address other
    // groups; neither names a single owner.
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: kill with signal 0 doesn't actually send a signal;
    // it only checks whether the process exists.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to another user.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // On non-unix, fall back to trusting the lock file.
    true
}
