//! Test runner with a fixed result.

use crate::events::{Event, EventLog};
use async_trait::async_trait;
use spire_testbed::runner::{RunnerError, TestEnvironment, TestReport, TestRunner};
use std::sync::Mutex;

#[derive(Debug)]
pub struct FakeRunner {
    events: EventLog,
    exit_code: i32,
    seen: Mutex<Vec<TestEnvironment>>,
}

impl FakeRunner {
    pub fn passing(events: EventLog) -> Self {
        Self::exiting(events, 0)
    }

    pub fn exiting(events: EventLog, exit_code: i32) -> Self {
        Self {
            events,
            exit_code,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Environments the runner was invoked with.
    pub fn seen(&self) -> Vec<TestEnvironment> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TestRunner for FakeRunner {
    async fn run(&self, env: &TestEnvironment) -> Result<TestReport, RunnerError> {
        self.events.push(Event::TestsRun);
        self.seen.lock().unwrap().push(env.clone());
        Ok(TestReport {
            success: self.exit_code == 0,
            exit_code: Some(self.exit_code),
        })
    }
}
