//! Per-test roots and a builder for a full set of fakes.

use crate::events::EventLog;
use crate::fake_admin::FakeAdmin;
use crate::fake_probe::ScriptedProbe;
use crate::fake_runner::FakeRunner;
use crate::fake_supervisor::FakeSupervisor;
use spire_testbed::{Components, Config, Layout, Service};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Isolated work and temp roots plus a config pointing at them.
///
/// Timeouts are short (5s stage, 100ms poll); under `start_paused` they cost
/// no wall-clock time.
pub struct TestBed {
    work_dir: TempDir,
    temp_dir: TempDir,
    pub config: Config,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_vars(&[])
    }

    /// Additional `TESTBED_*` variables on top of the test defaults.
    pub fn with_vars(extra: &[(&str, &str)]) -> Self {
        let work_dir = tempfile::tempdir().expect("work dir");
        let temp_dir = tempfile::tempdir().expect("temp dir");

        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert(
            "TESTBED_WORK_DIR".to_string(),
            work_dir.path().display().to_string(),
        );
        vars.insert(
            "TESTBED_TEMP_DIR".to_string(),
            temp_dir.path().display().to_string(),
        );
        vars.insert("TESTBED_STAGE_TIMEOUT_SECONDS".to_string(), "5".to_string());
        vars.insert("TESTBED_POLL_INTERVAL_MS".to_string(), "100".to_string());
        vars.insert("TESTBED_COMMAND_TIMEOUT_SECONDS".to_string(), "1".to_string());
        for (key, value) in extra {
            vars.insert((*key).to_string(), (*value).to_string());
        }

        let config = Config::from_vars(&vars).expect("test config");
        Self {
            work_dir,
            temp_dir,
            config,
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.work_dir.path(), self.temp_dir.path())
    }

    /// Fakes for a run that succeeds on the first probe of every check.
    pub fn fakes(&self) -> FakeComponentsBuilder {
        FakeComponentsBuilder::new(self.layout(), self.config.workload_id.to_string())
    }

    /// True when no run artifact is left under the temp and work roots.
    pub fn is_clean(&self) -> bool {
        let layout = self.layout();
        !layout.state_dir().exists()
            && !layout.lock_file().exists()
            && Service::TEARDOWN_ORDER
                .iter()
                .all(|s| !layout.log_file(*s).exists())
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles to every fake of one orchestrator, for assertions.
pub struct FakeComponents {
    pub events: EventLog,
    pub supervisor: Arc<FakeSupervisor>,
    pub admin: Arc<FakeAdmin>,
    pub server_probe: Arc<ScriptedProbe>,
    pub agent_probe: Arc<ScriptedProbe>,
    pub identity_probe: Arc<ScriptedProbe>,
    pub runner: Arc<FakeRunner>,
}

impl FakeComponents {
    /// Orchestrator components backed by these fakes.
    pub fn components(&self) -> Components {
        Components {
            supervisor: self.supervisor.clone(),
            admin: self.admin.clone(),
            server_probe: self.server_probe.clone(),
            agent_probe: self.agent_probe.clone(),
            identity_probe: self.identity_probe.clone(),
            runner: self.runner.clone(),
        }
    }
}

pub struct FakeComponentsBuilder {
    layout: Layout,
    workload_id: String,
    failing_launch: Vec<Service>,
    server_ready_after: Option<u32>,
    agent_ready_after: Option<u32>,
    identity_after: Option<u32>,
    token_failure: Option<String>,
    entry_failure: Option<String>,
    test_exit_code: i32,
}

impl FakeComponentsBuilder {
    fn new(layout: Layout, workload_id: String) -> Self {
        Self {
            layout,
            workload_id,
            failing_launch: Vec::new(),
            server_ready_after: Some(1),
            agent_ready_after: Some(1),
            identity_after: Some(1),
            token_failure: None,
            entry_failure: None,
            test_exit_code: 0,
        }
    }

    #[must_use]
    pub fn failing_launch(mut self, service: Service) -> Self {
        self.failing_launch.push(service);
        self
    }

    #[must_use]
    pub fn server_ready_after(mut self, probes: u32) -> Self {
        self.server_ready_after = Some(probes);
        self
    }

    #[must_use]
    pub fn server_never_ready(mut self) -> Self {
        self.server_ready_after = None;
        self
    }

    #[must_use]
    pub fn agent_ready_after(mut self, probes: u32) -> Self {
        self.agent_ready_after = Some(probes);
        self
    }

    #[must_use]
    pub fn agent_never_ready(mut self) -> Self {
        self.agent_ready_after = None;
        self
    }

    #[must_use]
    pub fn identity_after(mut self, probes: u32) -> Self {
        self.identity_after = Some(probes);
        self
    }

    #[must_use]
    pub fn identity_never_visible(mut self) -> Self {
        self.identity_after = None;
        self
    }

    #[must_use]
    pub fn failing_token(mut self, stderr: impl Into<String>) -> Self {
        self.token_failure = Some(stderr.into());
        self
    }

    #[must_use]
    pub fn failing_entry(mut self, stderr: impl Into<String>) -> Self {
        self.entry_failure = Some(stderr.into());
        self
    }

    #[must_use]
    pub fn tests_exiting(mut self, exit_code: i32) -> Self {
        self.test_exit_code = exit_code;
        self
    }

    pub fn build(self) -> FakeComponents {
        let events = EventLog::new();

        let mut supervisor = FakeSupervisor::new(self.layout, events.clone());
        for service in self.failing_launch {
            supervisor = supervisor.failing_launch(service);
        }

        let mut admin = FakeAdmin::new(events.clone());
        if let Some(stderr) = self.token_failure {
            admin = admin.failing_token(stderr);
        }
        if let Some(stderr) = self.entry_failure {
            admin = admin.failing_entry(stderr);
        }

        FakeComponents {
            supervisor: Arc::new(supervisor),
            admin: Arc::new(admin),
            server_probe: Arc::new(ScriptedProbe::healthy_after(
                "server",
                events.clone(),
                self.server_ready_after,
            )),
            agent_probe: Arc::new(ScriptedProbe::healthy_after(
                "agent",
                events.clone(),
                self.agent_ready_after,
            )),
            identity_probe: Arc::new(ScriptedProbe::identity_after(
                "identity",
                events.clone(),
                &self.workload_id,
                self.identity_after,
            )),
            runner: Arc::new(FakeRunner::exiting(events.clone(), self.test_exit_code)),
            events,
        }
    }
}
