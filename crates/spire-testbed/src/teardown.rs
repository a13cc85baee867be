//! Idempotent, best-effort teardown.
//!
//! Every step runs regardless of what happened before it, and nothing here
//! returns an error: a cleanup problem is logged and reported, never allowed
//! to replace the test outcome that triggered the teardown. Running it with
//! nothing to clean up is a no-op.
//!
//! Pids are taken from both the in-memory handles and the on-disk markers,
//! so a teardown in a fresh process (after a crash, or `spire-testbed down`
//! after `spire-testbed up`) still finds what an earlier run started.

use crate::layout::{Layout, Service};
use crate::supervisor::{read_pid_marker, ProcessHandle, StopOutcome, Supervisor};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{info, instrument, warn};

/// What a teardown did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Processes that received a termination signal.
    pub stopped: Vec<(Service, u32)>,
    /// Human-readable description of every step that failed.
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Teardown<'a> {
    layout: &'a Layout,
    supervisor: &'a dyn Supervisor,
}

impl<'a> Teardown<'a> {
    pub fn new(layout: &'a Layout, supervisor: &'a dyn Supervisor) -> Self {
        Self { layout, supervisor }
    }

    /// Stop every known process and delete every run artifact.
    #[instrument(skip_all, fields(state_dir = %self.layout.state_dir().display()))]
    pub fn run(&self, tracked: &[ProcessHandle]) -> TeardownReport {
        let mut report = TeardownReport::default();

        for service in Service::TEARDOWN_ORDER {
            self.stop_service(service, tracked, &mut report);
        }

        for marker in self.layout.marker_files() {
            remove_file(&marker, &mut report);
        }

        for service in Service::TEARDOWN_ORDER {
            remove_dir(&self.layout.private_dir(service), &mut report);
        }

        for service in Service::TEARDOWN_ORDER {
            remove_file(&self.layout.log_file(service), &mut report);
        }

        // Only succeeds once everything inside is gone; a leftover file from
        // something else is not ours to delete.
        match fs::remove_dir(self.layout.state_dir()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "State directory not removed"),
        }

        if report.is_clean() {
            info!(stopped = report.stopped.len(), "Teardown complete");
        } else {
            warn!(
                stopped = report.stopped.len(),
                failures = report.failures.len(),
                "Teardown finished with failures"
            );
        }
        report
    }

    fn stop_service(
        &self,
        service: Service,
        tracked: &[ProcessHandle],
        report: &mut TeardownReport,
    ) {
        let mut handles: Vec<ProcessHandle> = tracked
            .iter()
            .filter(|h| h.service == service)
            .cloned()
            .collect();

        match read_pid_marker(&self.layout.pid_marker(service)) {
            Ok(Some(recorded)) => {
                if !handles.iter().any(|h| h.pid == recorded.pid) {
                    info!(%service, pid = recorded.pid, "Recovered pid from marker");
                    handles.push(recorded);
                }
            }
            Ok(None) => {}
            // Deleted with the other markers below; nothing to kill.
            Err(e) => warn!(%service, error = %e, "Ignoring unreadable pid marker"),
        }

        for handle in handles {
            match self.supervisor.stop(&handle) {
                Ok(StopOutcome::Signalled) => report.stopped.push((service, handle.pid)),
                Ok(StopOutcome::NotRunning | StopOutcome::Stale) => {}
                Err(e) => {
                    warn!(%service, pid = handle.pid, error = %e, "Failed to stop process");
                    report
                        .failures
                        .push(format!("stop {service} (pid {}): {e}", handle.pid));
                }
            }
        }
    }
}

/// Read any pid markers left on disk.
pub fn recover_markers(layout: &Layout) -> Vec<ProcessHandle> {
    Service::TEARDOWN_ORDER
        .iter()
        .filter_map(|service| match read_pid_marker(&layout.pid_marker(*service)) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%service, error = %e, "Ignoring unreadable pid marker");
                None
            }
        })
        .collect()
}

fn remove_file(path: &Path, report: &mut TeardownReport) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
            report.failures.push(format!("remove {}: {e}", path.display()));
        }
    }
}

fn remove_dir(path: &Path, report: &mut TeardownReport) {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove directory");
            report.failures.push(format!("remove {}: {e}", path.display()));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::supervisor::{write_pid_marker, SupervisorError};
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSupervisor {
        stopped: Mutex<Vec<u32>>,
    }

    impl Supervisor for RecordingSupervisor {
        fn start(
            &self,
            spec: &crate::supervisor::ServiceSpec,
        ) -> Result<ProcessHandle, SupervisorError> {
            Err(SupervisorError::MissingPid {
                binary: spec.binary.clone(),
            })
        }

        fn stop(&self, handle: &ProcessHandle) -> Result<StopOutcome, SupervisorError> {
            self.stopped.lock().unwrap().push(handle.pid);
            Ok(StopOutcome::Signalled)
        }

        fn is_running(&self, handle: &ProcessHandle) -> bool {
            !self.stopped.lock().unwrap().contains(&handle.pid)
        }
    }

    fn handle(service: Service, pid: u32) -> ProcessHandle {
        ProcessHandle {
            service,
            pid,
            binary: PathBuf::from(service.to_string()),
            log_path: PathBuf::from("/dev/null"),
            started_at: Utc::now(),
        }
    }

    fn populate(layout: &Layout) {
        for (service, pid) in [(Service::Server, 100), (Service::Agent, 200)] {
            write_pid_marker(&layout.pid_marker(service), &handle(service, pid)).unwrap();
        }
        fs::write(layout.join_token_file(), "token").unwrap();
        for service in Service::TEARDOWN_ORDER {
            fs::create_dir_all(layout.data_dir(service)).unwrap();
            fs::write(layout.data_dir(service).join("state"), "x").unwrap();
            fs::write(layout.log_file(service), "log").unwrap();
        }
    }

    #[test]
    fn test_removes_everything_and_stops_agent_first() {
        let temp = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let layout = Layout::new(work.path(), temp.path());
        populate(&layout);
        let supervisor = RecordingSupervisor::default();

        let report = Teardown::new(&layout, &supervisor).run(&[]);

        assert!(report.is_clean());
        assert_eq!(*supervisor.stopped.lock().unwrap(), vec![200, 100]);
        assert!(!layout.state_dir().exists());
        assert!(!layout.log_file(Service::Server).exists());
    }

    #[test]
    fn test_tracked_and_marker_pid_are_not_double_stopped() {
        let temp = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let layout = Layout::new(work.path(), temp.path());
        populate(&layout);
        let supervisor = RecordingSupervisor::default();

        Teardown::new(&layout, &supervisor).run(&[handle(Service::Server, 100)]);

        assert_eq!(*supervisor.stopped.lock().unwrap(), vec![200, 100]);
    }

    #[test]
    fn test_empty_layout_is_noop() {
        let temp = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let layout = Layout::new(work.path(), temp.path());
        let supervisor = RecordingSupervisor::default();

        for _ in 0..3 {
            let report = Teardown::new(&layout, &supervisor).run(&[]);
            assert_eq!(report, TeardownReport::default());
        }
        assert!(supervisor.stopped.lock().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_marker_is_deleted_without_stopping() {
        let temp = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let layout = Layout::new(work.path(), temp.path());
        fs::create_dir_all(layout.state_dir()).unwrap();
        fs::write(layout.pid_marker(Service::Agent), "garbage").unwrap();
        let supervisor = RecordingSupervisor::default();

        let report = Teardown::new(&layout, &supervisor).run(&[]);

        assert!(report.is_clean());
        assert!(supervisor.stopped.lock().unwrap().is_empty());
        assert!(!layout.pid_marker(Service::Agent).exists());
    }

    #[test]
    fn test_recover_markers() {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path(), temp.path());
        assert!(recover_markers(&layout).is_empty());

        let server = handle(Service::Server, 7);
        write_pid_marker(&layout.pid_marker(Service::Server), &server).unwrap();
        let recovered = recover_markers(&layout);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered.first().unwrap().pid, 7);
    }
}
