//! Dependent test runner.
//!
//! The test suite is opaque: a shell command that learns where the Workload
//! API lives from `SPIFFE_ENDPOINT_SOCKET` and reports through its exit code.

use async_trait::async_trait;
use common::types::SpiffeId;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Environment variable the SPIFFE client libraries read.
pub const ENDPOINT_SOCKET_ENV: &str = "SPIFFE_ENDPOINT_SOCKET";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to start test command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

/// What a test run gets to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEnvironment {
    /// Agent Workload API socket.
    pub workload_socket: PathBuf,
    /// Identity the tests should receive.
    pub workload_id: SpiffeId,
    pub work_dir: PathBuf,
}

impl TestEnvironment {
    /// `unix://` URI form of the workload socket.
    pub fn endpoint_socket(&self) -> String {
        format!("unix://{}", self.workload_socket.display())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestReport {
    pub success: bool,
    /// `None` when the command was killed by a signal.
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, env: &TestEnvironment) -> Result<TestReport, RunnerError>;
}

/// Runs a shell command with inherited stdio.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: String,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl TestRunner for CommandRunner {
    #[instrument(skip_all, fields(command = %self.command))]
    async fn run(&self, env: &TestEnvironment) -> Result<TestReport, RunnerError> {
        let endpoint = env.endpoint_socket();
        info!(endpoint = %endpoint, workload_id = %env.workload_id, "Running tests");

        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&env.work_dir)
            .env(ENDPOINT_SOCKET_ENV, &endpoint)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| RunnerError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let report = TestReport {
            success: status.success(),
            exit_code: status.code(),
        };
        if report.success {
            info!("Tests passed");
        } else {
            warn!(exit_code = ?report.exit_code, "Tests failed");
        }
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn env(dir: &std::path::Path) -> TestEnvironment {
        TestEnvironment {
            workload_socket: PathBuf::from("/tmp/spire-testbed/agent/public/api.sock"),
            workload_id: SpiffeId::new("spiffe://example.org/testservice").unwrap(),
            work_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_endpoint_socket_uri() {
        let env = env(std::path::Path::new("/work"));
        assert_eq!(
            env.endpoint_socket(),
            "unix:///tmp/spire-testbed/agent/public/api.sock"
        );
    }

    #[tokio::test]
    async fn test_command_sees_endpoint_socket() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandRunner::new(
            "test \"$SPIFFE_ENDPOINT_SOCKET\" = unix:///tmp/spire-testbed/agent/public/api.sock",
        );

        let report = runner.run(&env(dir.path())).await.unwrap();

        assert!(report.success);
        assert_eq!(report.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let report = CommandRunner::new("exit 3")
            .run(&env(dir.path()))
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_runs_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        CommandRunner::new("touch ran")
            .run(&env(dir.path()))
            .await
            .unwrap();
        assert!(dir.path().join("ran").exists());
    }
}
