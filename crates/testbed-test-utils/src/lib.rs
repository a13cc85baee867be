//! # Testbed Test Utilities
//!
//! Fakes for every injectable seam of the orchestrator plus a fixture that
//! gives each test its own temp and work roots.
//!
//! ## Modules
//!
//! - `events` - shared, ordered log of what the fakes were asked to do
//! - `fake_supervisor` - records launches, writes real pid markers
//! - `fake_probe` - scripted probe observations
//! - `fake_admin` - join token / registration entry outcomes
//! - `fake_runner` - test runner with a fixed result
//! - `fixtures` - `TestBed` and the `FakeComponents` builder
//!
//! ## Usage
//!
//! ```rust,ignore
//! use testbed_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let bed = TestBed::new();
//!     let fakes = bed.fakes().server_ready_after(3).build();
//!     let mut orchestrator = Orchestrator::new(bed.config.clone(), fakes.components());
//!
//!     orchestrator.up().await.unwrap();
//!     assert_eq!(fakes.server_probe.calls(), 3);
//! }
//! ```

pub mod events;
pub mod fake_admin;
pub mod fake_probe;
pub mod fake_runner;
pub mod fake_supervisor;
pub mod fixtures;

pub use events::{Event, EventLog};
pub use fake_admin::FakeAdmin;
pub use fake_probe::ScriptedProbe;
pub use fake_runner::FakeRunner;
pub use fake_supervisor::FakeSupervisor;
pub use fixtures::{FakeComponents, FakeComponentsBuilder, TestBed};
