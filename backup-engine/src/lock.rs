//! Single-operation lock.
//!
//! At most one backup or restore runs at a time, in this process and across
//! processes sharing the catalog. The in-process state answers "what is
//! running"; an exclusive `flock` on the lock file excludes other processes.
//! The kernel drops the flock when its holder exits, so a crashed holder
//! never leaves the lock taken. The file itself stays in place and carries
//! `<pid> <kind>` of the current holder for error messages.

use crate::utils::errors::{EngineError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Backup,
    Restore,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Backup => f.write_str("backup"),
            OperationKind::Restore => f.write_str("restore"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationLock {
    path: PathBuf,
    current: Arc<Mutex<Option<OperationKind>>>,
}

impl OperationLock {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Operation currently held by this process.
    pub fn current(&self) -> Option<OperationKind> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fails with `AlreadyRunning` instead of waiting.
    pub fn try_acquire(&self, kind: OperationKind) -> Result<OperationGuard> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = *current {
            return Err(EngineError::AlreadyRunning {
                running: running.to_string(),
            });
        }

        let file = open_lock_file(&self.path)?;
        let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => file,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                let running = match read_holder(&self.path) {
                    Some((pid, running)) => format!("{} (pid {})", running, pid),
                    None => "another process".to_string(),
                };
                return Err(EngineError::AlreadyRunning { running });
            }
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        };

        if file.metadata()?.len() > 0 {
            debug!(path = %self.path.display(), "Taking over lock file left by an earlier holder");
        }
        file.set_len(0)?;
        writeln!(file, "{} {}", std::process::id(), kind)?;
        file.sync_all()?;

        *current = Some(kind);
        debug!(operation = %kind, "Operation lock acquired");
        Ok(OperationGuard {
            file,
            path: self.path.clone(),
            current: Arc::clone(&self.current),
        })
    }
}

/// Releases the lock on drop.
#[derive(Debug)]
pub struct OperationGuard {
    file: Flock<File>,
    path: PathBuf,
    current: Arc<Mutex<Option<OperationKind>>>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        // Clear the holder line; the flock itself goes with the descriptor.
        if let Err(e) = self.file.set_len(0) {
            warn!(path = %self.path.display(), error = %e, "Failed to clear operation lock");
        }
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn read_holder(path: &Path) -> Option<(u32, String)> {
    let content = fs::read_to_string(path).ok()?;
    let mut parts = content.split_whitespace();
    let pid = parts.next()?.parse().ok()?;
    let kind = parts.next().unwrap_or("operation").to_string();
    Some((pid, kind))
}
