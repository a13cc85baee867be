//! Process supervisor for the external SPIRE binaries.
//!
//! `start` returns as soon as the OS has accepted the launch. Readiness is a
//! separate, explicit step (see [`crate::probe`]). The pid is persisted to a
//! marker file before `start` returns so that a crashed or restarted
//! orchestrator can still find and kill the process.
//!
//! Each child leads its own process group, so a Ctrl+C at the terminal reaches
//! only the orchestrator, which then tears down in order. `stop` is
//! fire-and-forget SIGTERM to that group, which also reaches the real binary
//! when the configured one is a wrapper script. The SPIRE binaries shut down
//! on their own schedule and nothing downstream depends on observing their
//! exit.

use crate::layout::{Layout, Service};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to open log sink {path}: {source}")]
    LogSink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to launch {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Launched {binary} but the OS reported no pid")]
    MissingPid { binary: PathBuf },

    #[error("Pid marker {path} could not be written or read: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// How to launch one stage's process. Built once per stage.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub service: Service,
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Combined stdout and stderr go here. Truncated on launch.
    pub log_path: PathBuf,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// A launched process. Also the on-disk format of a pid marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub service: Service,
    pub pid: u32,
    pub binary: PathBuf,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// How much later than its recorded `started_at` a process may appear to have
/// started and still be the one recorded. Covers the coarse boot-time and
/// clock-tick resolution of procfs.
const START_TIME_SLACK_SECS: i64 = 2;

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// SIGTERM delivered.
    Signalled,
    /// No such process; nothing to do.
    NotRunning,
    /// The pid is alive but runs a different program (pid reuse after an
    /// unclean shutdown). Left alone.
    Stale,
}

/// Launches and terminates external processes.
///
/// Implementations must be safe to call from teardown while a readiness wait
/// is still sleeping elsewhere.
pub trait Supervisor: Send + Sync {
    /// Launch `spec` and persist its pid marker. Does not wait for readiness.
    fn start(&self, spec: &ServiceSpec) -> Result<ProcessHandle, SupervisorError>;

    /// Send a termination signal. A pid that no longer exists is not an error.
    fn stop(&self, handle: &ProcessHandle) -> Result<StopOutcome, SupervisorError>;

    /// Whether the process behind `handle` still runs.
    fn is_running(&self, handle: &ProcessHandle) -> bool;
}

/// Real supervisor backed by tokio process spawning and `kill(2)`.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    layout: Layout,
    /// Pids launched through this instance and not yet stopped. These are
    /// known to be ours, so the pid-reuse check is skipped for them.
    launched: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessSupervisor {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            launched: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn launched_here(&self, pid: u32) -> bool {
        self.launched
            .lock()
            .map(|launched| launched.contains(&pid))
            .unwrap_or(false)
    }

    fn forget(&self, pid: u32) {
        if let Ok(mut launched) = self.launched.lock() {
            launched.remove(&pid);
        }
    }
}

impl Supervisor for ProcessSupervisor {
    #[instrument(skip_all, fields(service = %spec.service, binary = %spec.binary.display()))]
    fn start(&self, spec: &ServiceSpec) -> Result<ProcessHandle, SupervisorError> {
        let log_sink = |source| SupervisorError::LogSink {
            path: spec.log_path.clone(),
            source,
        };
        if let Some(parent) = spec.log_path.parent() {
            fs::create_dir_all(parent).map_err(log_sink)?;
        }
        let stdout = File::create(&spec.log_path).map_err(log_sink)?;
        let stderr = stdout.try_clone().map_err(log_sink)?;

        // Args may carry the join token, so only their count is logged.
        debug!(
            args = spec.args.len(),
            log = %spec.log_path.display(),
            "Launching process"
        );

        let child = tokio::process::Command::new(&spec.binary)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                binary: spec.binary.clone(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| SupervisorError::MissingPid {
            binary: spec.binary.clone(),
        })?;
        // Dropping the handle detaches the child; tokio reaps it once it exits.
        drop(child);

        let handle = ProcessHandle {
            service: spec.service,
            pid,
            binary: spec.binary.clone(),
            log_path: spec.log_path.clone(),
            started_at: Utc::now(),
        };

        let marker = self.layout.pid_marker(spec.service);
        if let Err(e) = write_pid_marker(&marker, &handle) {
            // An unrecorded process would outlive every later teardown.
            warn!(pid, error = %e, "Pid marker write failed, terminating process");
            if let Err(kill_err) = signal_group(pid, libc::SIGTERM) {
                warn!(pid, error = %kill_err, "Failed to terminate unrecorded process");
            }
            return Err(e);
        }

        if let Ok(mut launched) = self.launched.lock() {
            launched.insert(pid);
        }
        info!(pid, marker = %marker.display(), "Process launched");
        Ok(handle)
    }

    #[instrument(skip_all, fields(service = %handle.service, pid = handle.pid))]
    fn stop(&self, handle: &ProcessHandle) -> Result<StopOutcome, SupervisorError> {
        if !self.launched_here(handle.pid) && pid_reused(handle) == Some(true) {
            warn!(
                binary = %handle.binary.display(),
                started_at = %handle.started_at,
                "Pid now belongs to a later process, not signalling"
            );
            return Ok(StopOutcome::Stale);
        }

        let outcome = match signal_group(handle.pid, libc::SIGTERM) {
            Ok(true) => StopOutcome::Signalled,
            Ok(false) => StopOutcome::NotRunning,
            Err(source) => {
                return Err(SupervisorError::Signal {
                    pid: handle.pid,
                    source,
                })
            }
        };
        self.forget(handle.pid);
        debug!(?outcome, "Stop requested");
        Ok(outcome)
    }

    fn is_running(&self, handle: &ProcessHandle) -> bool {
        is_alive(handle.pid)
            && (self.launched_here(handle.pid) || pid_reused(handle) != Some(true))
    }
}

/// Persist a pid marker as JSON, creating parent directories.
pub fn write_pid_marker(path: &Path, handle: &ProcessHandle) -> Result<(), SupervisorError> {
    let marker_err = |source| SupervisorError::Marker {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(marker_err)?;
    }
    let payload = serde_json::to_vec(handle)
        .map_err(|e| marker_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    fs::write(path, payload).map_err(marker_err)
}

/// Read a pid marker. A missing file is `Ok(None)`.
pub fn read_pid_marker(path: &Path) -> Result<Option<ProcessHandle>, SupervisorError> {
    let marker_err = |source| SupervisorError::Marker {
        path: path.to_path_buf(),
        source,
    };
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(marker_err(e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| marker_err(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Whether a pid refers to an existing process (including one owned by
/// another user).
pub fn is_alive(pid: u32) -> bool {
    match send_signal(pid, 0) {
        Ok(exists) => exists,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

/// Deliver `signal` to `pid`. `Ok(false)` means no such process.
fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<bool> {
    // pid 0 and negative values address process groups, never a single child.
    let pid = match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => pid,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to signal pid {pid}"),
            ))
        }
    };

    // SAFETY: kill(2) takes two integers and touches no memory. `pid` is a
    // positive value checked above, so only a single process is addressed.
    let ret = unsafe { libc::kill(pid, signal) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// SIGTERM the process group `pid` leads, or just `pid` when it leads none
/// (a marker written before children got their own group).
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<bool> {
    let raw = match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return send_signal(pid, signal),
    };
    // SAFETY: getpgid(2) takes one integer and touches no memory.
    if unsafe { libc::getpgid(raw) } != raw {
        return send_signal(pid, signal);
    }

    // SAFETY: as in `send_signal`; `-raw` is negative and non-zero, so it
    // addresses exactly the group this child leads.
    let ret = unsafe { libc::kill(-raw, signal) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Whether `handle.pid` now belongs to a process started after the recorded
/// one.
///
/// The kernel start time survives `exec`, so wrapper scripts and renamed
/// binaries still match. `None` when it cannot be determined (no procfs,
/// already exited).
fn pid_reused(handle: &ProcessHandle) -> Option<bool> {
    let started = process_start_time(handle.pid)?;
    Some(started - handle.started_at > TimeDelta::seconds(START_TIME_SLACK_SECS))
}

/// Wall-clock start time of `pid` from `/proc/<pid>/stat` and the boot time.
fn process_start_time(pid: u32) -> Option<DateTime<Utc>> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parentheses; the remaining
    // fields start after the last ')' with field 3, so starttime (field 22)
    // is the 20th.
    let (_, fields) = stat.rsplit_once(')')?;
    let ticks: u64 = fields.split_whitespace().nth(19)?.parse().ok()?;

    let boot_secs: i64 = fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;

    // SAFETY: sysconf(3) only reads a system constant.
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    let ticks_per_sec = u64::try_from(ticks_per_sec).ok().filter(|t| *t > 0)?;
    let since_boot_ms = i64::try_from(ticks.checked_mul(1000)? / ticks_per_sec).ok()?;

    DateTime::from_timestamp(boot_secs, 0)?
        .checked_add_signed(TimeDelta::try_milliseconds(since_boot_ms)?)
}
