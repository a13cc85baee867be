//! Top-level error type.
//!
//! Every variant names the stage it came from. Cleanup problems have no
//! variant: they end up in a `TeardownReport`, never here.

use crate::admin::AdminError;
use crate::layout::Service;
use crate::lock::LockError;
use crate::orchestrator::Stage;
use crate::runner::RunnerError;
use crate::supervisor::SupervisorError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TestbedError {
    #[error("Failed to launch {service}: {source}")]
    Launch {
        service: Service,
        #[source]
        source: SupervisorError,
    },

    #[error("Readiness check '{check}' timed out during {stage} after {attempts} attempts")]
    ReadinessTimeout {
        stage: Stage,
        check: String,
        attempts: u32,
    },

    #[error("Join token issuance failed: {0}")]
    JoinToken(#[source] AdminError),

    #[error("Registration entry creation failed: {0}")]
    RegistrationEntry(#[source] AdminError),

    #[error("Run cancelled during {stage}")]
    Cancelled { stage: Stage },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Failed to prepare {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("Tests can only run once the identity is visible (current stage: {stage})")]
    NotReady { stage: Stage },

    #[error("Test runner failed: {0}")]
    TestRunner(#[from] RunnerError),
}

impl TestbedError {
    /// The stage the failure belongs to, where there is one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            TestbedError::Launch {
                service: Service::Server,
                ..
            } => Some(Stage::ServerStarting),
            TestbedError::Launch {
                service: Service::Agent,
                ..
            } => Some(Stage::AgentStarting),
            TestbedError::ReadinessTimeout { stage, .. }
            | TestbedError::Cancelled { stage }
            | TestbedError::NotReady { stage } => Some(*stage),
            TestbedError::JoinToken(_) => Some(Stage::ServerReady),
            TestbedError::RegistrationEntry(_) => Some(Stage::CredentialIssued),
            TestbedError::TestRunner(_) => Some(Stage::TestsRunning),
            TestbedError::Lock(_)
            | TestbedError::Artifact { .. }
            | TestbedError::HttpClient(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_stage_follows_service() {
        let err = TestbedError::Launch {
            service: Service::Agent,
            source: SupervisorError::MissingPid {
                binary: PathBuf::from("spire-agent"),
            },
        };
        assert_eq!(err.stage(), Some(Stage::AgentStarting));
        assert!(err.to_string().contains("spire-agent"));
    }

    #[test]
    fn test_admin_failures_belong_to_server_ready() {
        let err = TestbedError::JoinToken(AdminError::CommandFailed {
            command: "spire-server token generate".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "connection refused".to_string(),
        });
        assert_eq!(err.stage(), Some(Stage::ServerReady));
        assert!(err.to_string().contains("connection refused"));
    }
}
