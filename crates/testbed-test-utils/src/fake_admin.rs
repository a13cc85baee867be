//! Administrative client with canned results.

use crate::events::{Event, EventLog};
use async_trait::async_trait;
use common::types::SpiffeId;
use spire_testbed::admin::{AdminClient, AdminError, EntryReceipt, JoinToken, RegistrationEntry};
use std::sync::Mutex;

pub const FAKE_JOIN_TOKEN: &str = "4f9a0a5e-1d6b-4c1e-9a57-0d2f6b1e8c33";
pub const FAKE_ENTRY_ID: &str = "entry-0001";

#[derive(Debug)]
pub struct FakeAdmin {
    events: EventLog,
    token_failure: Option<String>,
    entry_failure: Option<String>,
    token_requests: Mutex<Vec<SpiffeId>>,
    entries: Mutex<Vec<RegistrationEntry>>,
}

impl FakeAdmin {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            token_failure: None,
            entry_failure: None,
            token_requests: Mutex::new(Vec::new()),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Token issuance fails with `stderr`, like an unreachable admin socket.
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

    pub fn token_requests(&self) -> Vec<SpiffeId> {
        self.token_requests.lock().unwrap().clone()
    }

    pub fn entries(&self) -> Vec<RegistrationEntry> {
        self.entries.lock().unwrap().clone()
    }
}

fn command_failed(command: &str, stderr: &str) -> AdminError {
    AdminError::CommandFailed {
        command: command.to_string(),
        status: "exit status: 1".to_string(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl AdminClient for FakeAdmin {
    async fn issue_join_token(&self, agent_id: &SpiffeId) -> Result<JoinToken, AdminError> {
        self.token_requests.lock().unwrap().push(agent_id.clone());
        if let Some(stderr) = &self.token_failure {
            return Err(command_failed("spire-server token generate", stderr));
        }
        self.events.push(Event::TokenIssued);
        Ok(JoinToken::new(FAKE_JOIN_TOKEN))
    }

    async fn create_registration_entry(
        &self,
        entry: &RegistrationEntry,
    ) -> Result<EntryReceipt, AdminError> {
        self.entries.lock().unwrap().push(entry.clone());
        if let Some(stderr) = &self.entry_failure {
            return Err(command_failed("spire-server entry create", stderr));
        }
        self.events.push(Event::EntryCreated);
        Ok(EntryReceipt::new(Some(FAKE_ENTRY_ID.to_string())))
    }
}
