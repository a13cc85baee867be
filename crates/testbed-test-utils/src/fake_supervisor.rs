//! Supervisor that launches nothing.
//!
//! Pid markers are still written to the real layout, so teardown and
//! recovery paths see exactly what a real launch would leave behind.

use crate::events::{Event, EventLog};
use chrono::Utc;
use spire_testbed::supervisor::{
    write_pid_marker, ProcessHandle, ServiceSpec, StopOutcome, Supervisor, SupervisorError,
};
use spire_testbed::{Layout, Service};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Fake pids start far above any real `pid_max`.
const FIRST_FAKE_PID: u32 = 1 << 30;

#[derive(Debug)]
pub struct FakeSupervisor {
    layout: Layout,
    events: EventLog,
    fail_launch: HashSet<Service>,
    next_pid: AtomicU32,
    running: Mutex<HashSet<u32>>,
    started: Mutex<Vec<ServiceSpec>>,
}

impl FakeSupervisor {
    pub fn new(layout: Layout, events: EventLog) -> Self {
        Self {
            layout,
            events,
            fail_launch: HashSet::new(),
            next_pid: AtomicU32::new(FIRST_FAKE_PID),
            running: Mutex::new(HashSet::new()),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Launching `service` fails as if its binary did not exist.
    #[must_use]
    pub fn failing_launch(mut self, service: Service) -> Self {
        self.fail_launch.insert(service);
        self
    }

    /// Specs of every successful launch, in order.
    pub fn started(&self) -> Vec<ServiceSpec> {
        self.started.lock().unwrap().clone()
    }

    /// Fake pids launched and not yet stopped.
    pub fn running(&self) -> usize {
        self.running.lock().unwrap().len()
    }
}

impl Supervisor for FakeSupervisor {
    fn start(&self, spec: &ServiceSpec) -> Result<ProcessHandle, SupervisorError> {
        if self.fail_launch.contains(&spec.service) {
            return Err(SupervisorError::Spawn {
                binary: spec.binary.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            });
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let handle = ProcessHandle {
            service: spec.service,
            pid,
            binary: spec.binary.clone(),
            log_path: spec.log_path.clone(),
            started_at: Utc::now(),
        };
        write_pid_marker(&self.layout.pid_marker(spec.service), &handle)?;

        self.running.lock().unwrap().insert(pid);
        self.started.lock().unwrap().push(spec.clone());
        self.events.push(Event::Started(spec.service));
        Ok(handle)
    }

    fn stop(&self, handle: &ProcessHandle) -> Result<StopOutcome, SupervisorError> {
        self.events.push(Event::Stopped(handle.service, handle.pid));
        if self.running.lock().unwrap().remove(&handle.pid) {
            Ok(StopOutcome::Signalled)
        } else {
            Ok(StopOutcome::NotRunning)
        }
    }

    fn is_running(&self, handle: &ProcessHandle) -> bool {
        self.running.lock().unwrap().contains(&handle.pid)
    }
}
