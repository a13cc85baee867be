//! Run lock.
//!
//! A run binds fixed health/server ports and owns a directory under the temp
//! root, so two runs against the same temp root would tear each other down.
//! The lock makes that exclusion explicit: one file, created atomically,
//! naming the holder. A lock left by a process that no longer exists is
//! reclaimed.
//!
//! An environment left running by `up` keeps the lock after the orchestrator
//! exits: the lock is parked, and from then on its holder counts as alive for
//! as long as the environment's processes do. Only a teardown claim takes a
//! parked lock over while the environment is still running.

use crate::supervisor::is_alive;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another run (pid {pid}, run {run_id}) holds {path}")]
    Held {
        pid: u32,
        run_id: Uuid,
        path: PathBuf,
    },

    #[error("Environment of run {run_id} is still up ({path}); run `spire-testbed down` first")]
    Parked { run_id: Uuid, path: PathBuf },

    #[error("Run lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What the lock is taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Bring up a new environment. Blocked by any live holder.
    Run,
    /// Tear down whatever is there. Takes over a parked lock.
    Teardown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Holder {
    /// The orchestrator process named by `pid`.
    #[default]
    Process,
    /// The environment that process left running.
    Environment,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    run_id: Uuid,
    acquired_at: DateTime<Utc>,
    #[serde(default)]
    holder: Holder,
}

/// Held for the duration of one run. Dropping it releases the lock unless it
/// was parked.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    run_id: Uuid,
    parked: bool,
}

impl RunLock {
    /// Take the lock at `path`, reclaiming it from a dead holder.
    ///
    /// `environment_alive` decides whether a parked lock's environment still
    /// runs; it is only consulted for [`Claim::Run`].
    pub fn acquire(
        path: &Path,
        claim: Claim,
        environment_alive: impl Fn() -> bool,
    ) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let run_id = Uuid::new_v4();
        // Second attempt only after reclaiming a stale lock.
        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        run_id,
                        acquired_at: Utc::now(),
                        holder: Holder::Process,
                    };
                    file.write_all(&encode(&info).map_err(io_err)?)
                        .map_err(io_err)?;
                    file.sync_all().map_err(io_err)?;
                    debug!(path = %path.display(), %run_id, ?claim, "Run lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        run_id,
                        parked: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    Self::reclaim_if_stale(path, claim, &environment_alive)?;
                }
                Err(e) => return Err(io_err(e)),
            }
        }

        Err(io_err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "lock reappeared while reclaiming",
        )))
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Hand the lock to the environment this run leaves running. The file
    /// stays behind until a teardown claims it.
    pub fn park(mut self) -> Result<Uuid, LockError> {
        let info = LockInfo {
            pid: std::process::id(),
            run_id: self.run_id,
            acquired_at: Utc::now(),
            holder: Holder::Environment,
        };
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };
        fs::write(&self.path, encode(&info).map_err(io_err)?).map_err(io_err)?;
        self.parked = true;
        info!(
            path = %self.path.display(),
            run_id = %self.run_id,
            "Run lock parked with the environment"
        );
        Ok(self.run_id)
    }

    fn reclaim_if_stale(
        path: &Path,
        claim: Claim,
        environment_alive: &dyn Fn() -> bool,
    ) -> Result<(), LockError> {
        let holder = fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockInfo>(&bytes).ok());

        match holder {
            Some(info) if info.holder == Holder::Process && is_alive(info.pid) => {
                Err(LockError::Held {
                    pid: info.pid,
                    run_id: info.run_id,
                    path: path.to_path_buf(),
                })
            }
            Some(info) if info.holder == Holder::Environment && claim == Claim::Teardown => {
                info!(run_id = %info.run_id, "Taking over parked lock for teardown");
                remove_lock_file(path)
            }
            Some(info) if info.holder == Holder::Environment && environment_alive() => {
                Err(LockError::Parked {
                    run_id: info.run_id,
                    path: path.to_path_buf(),
                })
            }
            Some(info) => {
                info!(pid = info.pid, run_id = %info.run_id, "Reclaiming lock from dead run");
                remove_lock_file(path)
            }
            None => {
                warn!(path = %path.display(), "Reclaiming unreadable lock file");
                remove_lock_file(path)
            }
        }
    }
}

fn encode(info: &LockInfo) -> io::Result<Vec<u8>> {
    serde_json::to_vec(info).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn remove_lock_file(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.parked {
            return;
        }
        if let Err(e) = remove_lock_file(&self.path) {
            warn!(error = %e, "Failed to release run lock");
        }
    }
}
