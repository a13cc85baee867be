//! SPIRE Integration Testbed
//!
//! Stands up a `spire-server` and a `spire-agent` as external processes, hands
//! a join token from one to the other, waits until a workload SVID is
//! observable through the agent's Workload API, runs a dependent test command
//! against that socket and tears everything down again.
//!
//! # Stages
//!
//! ```text
//! Idle -> ServerStarting -> ServerReady -> CredentialIssued -> AgentStarting
//!      -> AgentReady -> IdentityPropagated -> TestsRunning -> TornDown
//! ```
//!
//! `down()` is callable from any stage and always converges to `TornDown`.
//!
//! # Usage
//!
//! ```bash
//! # Bring up, run `cargo test` against the agent socket, tear down
//! spire-testbed run
//!
//! # Leave the environment running for manual poking
//! spire-testbed up
//! spire-testbed status
//! spire-testbed down
//! ```
//!
//! # Modules
//!
//! - `supervisor` - launches and signals external processes, pid markers
//! - `probe` - bounded poll-until-true primitive shared by every readiness wait
//! - `admin` - join token issuance and registration entry creation
//! - `propagation` - waits for the workload identity to reach the agent
//! - `orchestrator` - the stage machine tying it together
//! - `teardown` - idempotent best-effort cleanup
//! - `lock` - run-scoped mutual exclusion over ports and the temp root

pub mod admin;
pub mod config;
pub mod errors;
pub mod layout;
pub mod lock;
pub mod orchestrator;
pub mod probe;
pub mod propagation;
pub mod runner;
pub mod spire;
pub mod supervisor;
pub mod teardown;

pub use config::Config;
pub use errors::TestbedError;
pub use layout::{Layout, Service};
pub use orchestrator::{Components, Orchestrator, Stage};
