//! Lifecycle orchestrator.
//!
//! Drives one run through its stages strictly in order:
//!
//! ```text
//! Idle -> ServerStarting -> ServerReady -> CredentialIssued -> AgentStarting
//!      -> AgentReady -> IdentityPropagated -> TestsRunning -> TornDown
//! ```
//!
//! A stage's precondition is the previous stage's postcondition, so the only
//! concurrency is the cancellable sleep inside a readiness wait. Any fatal
//! error tears the run down before it is returned.
//!
//! A readiness timeout is not fatal by default: the run logs it and attempts
//! the next stage, whose own failure then aborts the run with a more specific
//! error. `abort_on_timeout` makes the timeout itself fatal.

use crate::admin::{AdminClient, EntryReceipt, JoinToken, RegistrationEntry, ServerCli};
use crate::config::Config;
use crate::errors::TestbedError;
use crate::layout::{Layout, Service};
use crate::lock::{Claim, LockError, RunLock};
use crate::probe::{deadline_after, Budget, HttpProbe, Outcome, Predicate, Probe, Prober, ReadinessCheck};
use crate::propagation::PropagationWaiter;
use crate::runner::{CommandRunner, TestEnvironment, TestReport, TestRunner};
use crate::spire;
use crate::supervisor::{is_alive, ProcessHandle, ProcessSupervisor, ServiceSpec, Supervisor};
use crate::teardown::{recover_markers, Teardown, TeardownReport};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Status code a SPIRE health listener answers `/ready` with once ready.
const READY_STATUS: u16 = 200;

/// Lifecycle stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Idle,
    ServerStarting,
    ServerReady,
    CredentialIssued,
    AgentStarting,
    AgentReady,
    IdentityPropagated,
    TestsRunning,
    TornDown,
}

impl Stage {
    /// The only forward transition out of this stage. `down()` is the other
    /// way out of every stage.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Idle => Some(Stage::ServerStarting),
            Stage::ServerStarting => Some(Stage::ServerReady),
            Stage::ServerReady => Some(Stage::CredentialIssued),
            Stage::CredentialIssued => Some(Stage::AgentStarting),
            Stage::AgentStarting => Some(Stage::AgentReady),
            Stage::AgentReady => Some(Stage::IdentityPropagated),
            Stage::IdentityPropagated => Some(Stage::TestsRunning),
            Stage::TestsRunning => Some(Stage::TornDown),
            Stage::TornDown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::ServerStarting => "server_starting",
            Stage::ServerReady => "server_ready",
            Stage::CredentialIssued => "credential_issued",
            Stage::AgentStarting => "agent_starting",
            Stage::AgentReady => "agent_ready",
            Stage::IdentityPropagated => "identity_propagated",
            Stage::TestsRunning => "tests_running",
            Stage::TornDown => "torn_down",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The external-facing pieces of a run. Tests swap any of them for fakes.
#[derive(Clone)]
pub struct Components {
    pub supervisor: Arc<dyn Supervisor>,
    pub admin: Arc<dyn AdminClient>,
    /// Server health endpoint.
    pub server_probe: Arc<dyn Probe>,
    /// Agent health endpoint.
    pub agent_probe: Arc<dyn Probe>,
    /// Agent identity fetch.
    pub identity_probe: Arc<dyn Probe>,
    pub runner: Arc<dyn TestRunner>,
}

impl Components {
    /// Real SPIRE binaries, health endpoints and the configured test command.
    pub fn spire(config: &Config, layout: &Layout) -> Result<Self, TestbedError> {
        let http = reqwest::Client::builder()
            .timeout(config.command_timeout)
            .build()
            .map_err(TestbedError::HttpClient)?;

        Ok(Self {
            supervisor: Arc::new(ProcessSupervisor::new(layout.clone())),
            admin: Arc::new(ServerCli::new(
                config.server_binary.clone(),
                layout.socket_path(Service::Server),
                config.join_token_ttl,
                config.command_timeout,
            )),
            server_probe: Arc::new(HttpProbe::new(
                http.clone(),
                spire::ready_url(config, Service::Server),
            )),
            agent_probe: Arc::new(HttpProbe::new(
                http,
                spire::ready_url(config, Service::Agent),
            )),
            identity_probe: Arc::new(spire::identity_fetch_probe(config, layout)),
            runner: Arc::new(CommandRunner::new(config.test_command.clone())),
        })
    }
}

/// What the current run has created.
#[derive(Debug, Default)]
pub struct RunState {
    handles: Vec<ProcessHandle>,
    receipt: Option<EntryReceipt>,
    lock: Option<RunLock>,
}

impl RunState {
    /// Processes launched by this orchestrator and not yet torn down.
    pub fn handles(&self) -> &[ProcessHandle] {
        &self.handles
    }

    pub fn entry_receipt(&self) -> Option<&EntryReceipt> {
        self.receipt.as_ref()
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.is_some()
    }
}

/// Whether any process recorded under `layout` still runs.
fn environment_alive(layout: &Layout, supervisor: &dyn Supervisor) -> bool {
    recover_markers(layout)
        .iter()
        .any(|handle| supervisor.is_running(handle))
}

/// Liveness of one recorded process, as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub handle: ProcessHandle,
    pub alive: bool,
}

/// Processes recorded under `layout` and whether they still run.
pub fn status(layout: &Layout) -> Vec<ServiceStatus> {
    recover_markers(layout)
        .into_iter()
        .map(|handle| ServiceStatus {
            alive: is_alive(handle.pid),
            handle,
        })
        .collect()
}

pub struct Orchestrator {
    config: Config,
    layout: Layout,
    components: Components,
    stage: Stage,
    state: RunState,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config, components: Components) -> Self {
        let layout = Layout::new(config.work_dir.clone(), config.temp_dir.clone());
        Self {
            config,
            layout,
            components,
            stage: Stage::Idle,
            state: RunState::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Cancelling aborts an in-flight readiness wait. A cancelled
    /// orchestrator stays cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bring the environment up to `IdentityPropagated`.
    ///
    /// On failure everything started so far is torn down before the error
    /// is returned. Failing to take the run lock leaves the holder's
    /// environment untouched. Dropping the orchestrator while the
    /// environment is up parks the lock with it, so only `down` frees the
    /// temp root again.
    pub async fn up(&mut self) -> Result<(), TestbedError> {
        if !matches!(self.stage, Stage::Idle | Stage::TornDown) {
            warn!(stage = %self.stage, "up() called on a live run, tearing it down first");
            self.down();
        }

        let lock = RunLock::acquire(&self.layout.lock_file(), Claim::Run, || {
            environment_alive(&self.layout, self.components.supervisor.as_ref())
        })?;
        let run_id = lock.run_id();
        self.state.lock = Some(lock);
        self.stage = Stage::Idle;

        let span = info_span!("run", %run_id);
        let result = self.bring_up().instrument(span).await;
        if let Err(e) = &result {
            error!(%run_id, stage = %self.stage, error = %e, "Bring-up failed, tearing down");
            self.down();
        }
        result
    }

    async fn bring_up(&mut self) -> Result<(), TestbedError> {
        // Leftovers of an earlier run that never reached down().
        let recovered = Teardown::new(&self.layout, self.components.supervisor.as_ref()).run(&[]);
        if !recovered.stopped.is_empty() {
            warn!(
                stopped = recovered.stopped.len(),
                "Stopped processes left behind by an earlier run"
            );
        }

        let prober = Prober::new(self.cancel.clone())
            .with_run_deadline(deadline_after(self.config.run_timeout));
        let budget = Budget::new(self.config.stage_timeout, self.config.poll_interval);

        self.advance()?;
        let server_config = self.prepare(Service::Server)?;
        let spec = spire::server_spec(&self.config, &self.layout, &server_config);
        self.launch(Service::Server, &spec)?;
        let check = ReadinessCheck::new("server ready", Predicate::StatusEquals(READY_STATUS), budget);
        let outcome = prober
            .wait_until(&check, self.components.server_probe.as_ref())
            .await;
        self.apply_timeout_policy(&check.name, outcome)?;
        self.advance()?;

        let token = self
            .components
            .admin
            .issue_join_token(&self.config.agent_id)
            .await
            .map_err(TestbedError::JoinToken)?;
        token
            .persist(&self.layout.join_token_file())
            .map_err(TestbedError::JoinToken)?;
        self.advance()?;

        let entry = RegistrationEntry::new(
            self.config.agent_id.clone(),
            self.config.workload_id.clone(),
            self.config.selectors.clone(),
            self.config.dns_names.clone(),
        )
        .map_err(TestbedError::RegistrationEntry)?;
        let receipt = self
            .components
            .admin
            .create_registration_entry(&entry)
            .await
            .map_err(TestbedError::RegistrationEntry)?;
        self.state.receipt = Some(receipt.clone());
        self.advance()?;

        let agent_config = self.prepare(Service::Agent)?;
        // The agent consumes the hand-off file, not the in-memory token.
        let token = JoinToken::load(&self.layout.join_token_file()).map_err(TestbedError::JoinToken)?;
        let spec = spire::agent_spec(&self.config, &self.layout, &agent_config, &token);
        self.launch(Service::Agent, &spec)?;
        let check = ReadinessCheck::new("agent ready", Predicate::StatusEquals(READY_STATUS), budget);
        let outcome = prober
            .wait_until(&check, self.components.agent_probe.as_ref())
            .await;
        self.apply_timeout_policy(&check.name, outcome)?;
        self.advance()?;

        let waiter = PropagationWaiter::new(&prober, self.components.identity_probe.as_ref());
        let outcome = waiter
            .wait_for_identity(&receipt, &self.config.workload_id, budget)
            .await;
        self.apply_timeout_policy("workload identity", outcome)?;
        self.advance()?;

        info!(workload_id = %self.config.workload_id, "Environment up");
        Ok(())
    }

    /// Run the dependent tests. Only valid once the identity is visible.
    pub async fn run_tests(&mut self) -> Result<TestReport, TestbedError> {
        if self.stage != Stage::IdentityPropagated {
            return Err(TestbedError::NotReady { stage: self.stage });
        }
        self.advance()?;

        let env = TestEnvironment {
            workload_socket: self.layout.socket_path(Service::Agent),
            workload_id: self.config.workload_id.clone(),
            work_dir: self.layout.work_dir().to_path_buf(),
        };
        Ok(self.components.runner.run(&env).await?)
    }

    /// Stop everything and delete every artifact. Callable from any stage,
    /// any number of times.
    pub fn down(&mut self) -> TeardownReport {
        if self.state.lock.is_none() {
            // Not our run: only tear down what no live run claims.
            match RunLock::acquire(&self.layout.lock_file(), Claim::Teardown, || false) {
                Ok(lock) => self.state.lock = Some(lock),
                Err(LockError::Held { pid, run_id, .. }) => {
                    warn!(pid, %run_id, "Another run holds the lock, leaving it alone");
                    self.stage = Stage::TornDown;
                    return TeardownReport {
                        stopped: Vec::new(),
                        failures: vec![format!("run lock held by pid {pid} (run {run_id})")],
                    };
                }
                Err(e) => warn!(error = %e, "Run lock unavailable, tearing down anyway"),
            }
        }

        let report = Teardown::new(&self.layout, self.components.supervisor.as_ref())
            .run(&self.state.handles);
        self.state.handles.clear();
        self.state.receipt = None;
        // Dropping the lock releases it.
        self.state.lock = None;
        if self.stage != Stage::TornDown {
            info!(from = %self.stage, "Run torn down");
        }
        self.stage = Stage::TornDown;
        report
    }

    /// `up`, then the tests, then `down` on every path.
    pub async fn run(&mut self) -> Result<TestReport, TestbedError> {
        let result = match self.up().await {
            Ok(()) => self.run_tests().await,
            Err(e) => Err(e),
        };
        self.down();
        result
    }

    fn advance(&mut self) -> Result<(), TestbedError> {
        if self.cancel.is_cancelled() {
            return Err(TestbedError::Cancelled { stage: self.stage });
        }
        if let Some(next) = self.stage.next() {
            info!(from = %self.stage, to = %next, "Stage transition");
            self.stage = next;
        }
        Ok(())
    }

    fn prepare(&self, service: Service) -> Result<PathBuf, TestbedError> {
        spire::prepare(service, &self.config, &self.layout).map_err(|source| {
            TestbedError::Artifact {
                path: self.layout.private_dir(service),
                source,
            }
        })
    }

    fn launch(
        &mut self,
        service: Service,
        spec: &ServiceSpec,
    ) -> Result<(), TestbedError> {
        let handle = self
            .components
            .supervisor
            .start(spec)
            .map_err(|source| TestbedError::Launch { service, source })?;
        self.state.handles.push(handle);
        Ok(())
    }

    fn apply_timeout_policy(&self, check: &str, outcome: Outcome) -> Result<(), TestbedError> {
        match outcome {
            Outcome::Ready { .. } => Ok(()),
            Outcome::Cancelled { .. } => Err(TestbedError::Cancelled { stage: self.stage }),
            Outcome::TimedOut { attempts } if self.config.abort_on_timeout => {
                Err(TestbedError::ReadinessTimeout {
                    stage: self.stage,
                    check: check.to_string(),
                    attempts,
                })
            }
            Outcome::TimedOut { attempts } => {
                warn!(
                    stage = %self.stage,
                    check,
                    attempts,
                    "Not ready within budget, proceeding"
                );
                Ok(())
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let Some(lock) = self.state.lock.take() else {
            return;
        };
        if self.state.handles.is_empty() {
            return;
        }
        match lock.park() {
            Ok(run_id) => info!(%run_id, stage = %self.stage, "Environment left running"),
            Err(e) => warn!(error = %e, "Failed to park run lock, it is released"),
        }
    }
}
