//! Repository-scoped run lock.
//!
//! A run holds an exclusive OS lock on `<git-dir>/cinecron.lock` from before
//! preparation until its publish finishes. The file itself stays in place;
//! only the lock on it matters. The kernel drops that lock when the holding
//! process exits for any reason, so a killed run never wedges the next one.
//! The file's contents name the current holder for diagnostics.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::{clog_debug, clog_warn, Error, Result};

pub const LOCK_FILE: &str = "cinecron.lock";

/// Contents of the lock file while a run holds it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockInfo {
    pub pid: u32,
    pub run_id: Uuid,
    pub acquired_at: DateTime<Utc>,
}

/// Held lock; dropping it releases the repository.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    /// Lock path for a repository's git directory.
    pub fn path_for(git_dir: &Path) -> PathBuf {
        git_dir.join(LOCK_FILE)
    }

    /// Make a single attempt. `Ok(None)` means another run holds the lock.
    pub fn try_acquire(path: &Path, run_id: Uuid) -> Result<Option<Self>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if is_contended(&e) {
                return Ok(None);
            }
            return Err(e.into());
        }

        // Contents left behind mean the previous holder died without releasing.
        if let Some(previous) = parse_info(&mut file) {
            clog_warn!(
                "Recovered run lock {} left by pid {} (run {})",
                path.display(),
                previous.pid,
                previous.run_id
            );
        }

        let info = LockInfo {
            pid: std::process::id(),
            run_id,
            acquired_at: Utc::now(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serde_json::to_string(&info)?.as_bytes())?;
        file.sync_all()?;
        clog_debug!("RunLock acquired path={} run={}", path.display(), run_id);
        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
        }))
    }

    /// Wait for the lock, polling until `config.wait_secs` have passed.
    pub async fn acquire(path: &Path, run_id: Uuid, config: &LockConfig) -> Result<Self> {
        let started = Instant::now();
        let mut announced = false;
        let mut warned = false;
        loop {
            if let Some(lock) = Self::try_acquire(path, run_id)? {
                return Ok(lock);
            }
            let holder = read_info(path);
            if !announced {
                clog_debug!(
                    "Run lock {} held by {:?}; waiting",
                    path.display(),
                    holder.as_ref().map(|i| i.run_id)
                );
                announced = true;
            }
            if let Some(info) = holder.filter(|_| !warned) {
                let held_for = (Utc::now() - info.acquired_at).to_std().unwrap_or(Duration::ZERO);
                if held_for > config.warn_after() {
                    clog_warn!(
                        "Run lock {} held by pid {} for {:?}; that run may be hung",
                        path.display(),
                        info.pid,
                        held_for
                    );
                    warned = true;
                }
            }
            let waited = started.elapsed();
            if waited >= config.wait() {
                return Err(Error::LockTimeout {
                    path: path.display().to_string(),
                    waited,
                });
            }
            tokio::time::sleep(config.poll()).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Clear the holder record first so an empty file means a clean release.
        if let Err(e) = self.file.set_len(0) {
            clog_warn!("Failed to clear run lock {}: {}", self.path.display(), e);
        }
        match FileExt::unlock(&self.file) {
            Ok(()) => clog_debug!("RunLock released path={}", self.path.display()),
            Err(e) => clog_warn!("Failed to release run lock {}: {}", self.path.display(), e),
        }
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn parse_info(file: &mut File) -> Option<LockInfo> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    serde_json::from_str(&text).ok()
}

/// Holder recorded in the lock file, if any.
pub fn read_info(path: &Path) -> Option<LockInfo> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}
