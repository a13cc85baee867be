//! Bootstrap credential exchange against the server's admin socket.
//!
//! Two calls, each made exactly once per run and only after the server has
//! passed (or been waved through) its readiness gate. Neither retries: a
//! failure here means the server is not usable and the run aborts.

use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::SpiffeId;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Failed to run {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Unexpected output from `{command}`: {detail}")]
    MalformedOutput { command: String, detail: String },

    #[error("Invalid registration entry: {0}")]
    InvalidEntry(String),

    #[error("Join token file {path}: {source}")]
    TokenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One-time join credential for the agent.
///
/// Expiry and single use are enforced by the server. The value is never
/// formatted; `Debug` is redacted.
#[derive(Debug, Clone)]
pub struct JoinToken(SecretString);

impl JoinToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Write the hand-off file readable only by the current user.
    pub fn persist(&self, path: &Path) -> Result<(), AdminError> {
        let file_err = |source| AdminError::TokenFile {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(file_err)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).map_err(file_err)?;
        file.write_all(self.expose().as_bytes()).map_err(file_err)?;
        file.sync_all().map_err(file_err)
    }

    /// Read the hand-off file written by [`JoinToken::persist`].
    pub fn load(path: &Path) -> Result<Self, AdminError> {
        let raw = fs::read_to_string(path).map_err(|source| AdminError::TokenFile {
            path: path.to_path_buf(),
            source,
        })?;
        let value = raw.trim();
        if value.is_empty() {
            return Err(AdminError::TokenFile {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidData, "empty join token"),
            });
        }
        Ok(Self::new(value))
    }
}

/// Binding from the agent's node identity to a workload identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEntry {
    parent_id: SpiffeId,
    spiffe_id: SpiffeId,
    selectors: Vec<String>,
    dns_names: Vec<String>,
}

impl RegistrationEntry {
    /// Validate and build an entry.
    ///
    /// Requires at least one `type:value` selector and both IDs in the same
    /// trust domain.
    pub fn new(
        parent_id: SpiffeId,
        spiffe_id: SpiffeId,
        selectors: Vec<String>,
        dns_names: Vec<String>,
    ) -> Result<Self, AdminError> {
        if selectors.is_empty() {
            return Err(AdminError::InvalidEntry(
                "at least one selector is required".to_string(),
            ));
        }
        if let Some(bad) = selectors.iter().find(|s| !is_selector(s)) {
            return Err(AdminError::InvalidEntry(format!(
                "selector '{bad}' is not of the form type:value"
            )));
        }
        if parent_id.trust_domain() != spiffe_id.trust_domain() {
            return Err(AdminError::InvalidEntry(format!(
                "parent '{parent_id}' and workload '{spiffe_id}' are in different trust domains"
            )));
        }
        Ok(Self {
            parent_id,
            spiffe_id,
            selectors,
            dns_names,
        })
    }

    pub fn parent_id(&self) -> &SpiffeId {
        &self.parent_id
    }

    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    pub fn selectors(&self) -> &[String] {
        &self.selectors
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }
}

fn is_selector(s: &str) -> bool {
    matches!(s.split_once(':'), Some((kind, value)) if !kind.is_empty() && !value.is_empty())
}

/// What [`AdminClient::create_registration_entry`] returns once the server
/// has accepted an entry.
///
/// The orchestrator starts the propagation wait only with the receipt it got
/// back from that call. Constructing one elsewhere proves nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReceipt {
    entry_id: Option<String>,
}

impl EntryReceipt {
    pub fn new(entry_id: Option<String>) -> Self {
        Self { entry_id }
    }

    pub fn entry_id(&self) -> Option<&str> {
        self.entry_id.as_deref()
    }
}

/// Administrative interface of the control-plane server.
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Mint a join token for `agent_id`.
    async fn issue_join_token(&self, agent_id: &SpiffeId) -> Result<JoinToken, AdminError>;

    /// Declare the entry the agent will serve to matching workloads.
    async fn create_registration_entry(
        &self,
        entry: &RegistrationEntry,
    ) -> Result<EntryReceipt, AdminError>;
}

/// [`AdminClient`] backed by the `spire-server` CLI on the admin socket.
#[derive(Debug, Clone)]
pub struct ServerCli {
    binary: PathBuf,
    socket_path: PathBuf,
    token_ttl: Duration,
    timeout: Duration,
}

impl ServerCli {
    pub fn new(binary: PathBuf, socket_path: PathBuf, token_ttl: Duration, timeout: Duration) -> Self {
        Self {
            binary,
            socket_path,
            token_ttl,
            timeout,
        }
    }

    fn token_args(&self, agent_id: &SpiffeId) -> Vec<String> {
        vec![
            "token".to_string(),
            "generate".to_string(),
            "-socketPath".to_string(),
            self.socket_path.display().to_string(),
            "-spiffeID".to_string(),
            agent_id.to_string(),
            "-ttl".to_string(),
            self.token_ttl.as_secs().to_string(),
        ]
    }

    fn entry_args(&self, entry: &RegistrationEntry) -> Vec<String> {
        let mut args = vec![
            "entry".to_string(),
            "create".to_string(),
            "-socketPath".to_string(),
            self.socket_path.display().to_string(),
            "-parentID".to_string(),
            entry.parent_id().to_string(),
            "-spiffeID".to_string(),
            entry.spiffe_id().to_string(),
        ];
        for selector in entry.selectors() {
            args.push("-selector".to_string());
            args.push(selector.clone());
        }
        for dns in entry.dns_names() {
            args.push("-dns".to_string());
            args.push(dns.clone());
        }
        args
    }

    /// Run one subcommand; `command` is the redaction-safe label for errors.
    async fn run(&self, command: &str, args: &[String]) -> Result<Output, AdminError> {
        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| AdminError::Timeout {
                command: command.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|source| AdminError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(command, status = %output.status, stderr = %stderr, "Admin command failed");
            return Err(AdminError::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr,
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl AdminClient for ServerCli {
    #[instrument(skip_all, fields(agent_id = %agent_id))]
    async fn issue_join_token(&self, agent_id: &SpiffeId) -> Result<JoinToken, AdminError> {
        let command = "spire-server token generate";
        let output = self.run(command, &self.token_args(agent_id)).await?;
        let token = parse_token_output(&String::from_utf8_lossy(&output.stdout)).ok_or_else(
            || AdminError::MalformedOutput {
                command: command.to_string(),
                detail: "no 'Token:' line".to_string(),
            },
        )?;
        info!(ttl_secs = self.token_ttl.as_secs(), "Join token issued");
        Ok(token)
    }

    #[instrument(skip_all, fields(spiffe_id = %entry.spiffe_id(), parent_id = %entry.parent_id()))]
    async fn create_registration_entry(
        &self,
        entry: &RegistrationEntry,
    ) -> Result<EntryReceipt, AdminError> {
        let output = self
            .run("spire-server entry create", &self.entry_args(entry))
            .await?;
        let receipt = EntryReceipt::new(parse_entry_id(&String::from_utf8_lossy(&output.stdout)));
        info!(
            entry_id = receipt.entry_id().unwrap_or("unknown"),
            selectors = entry.selectors().len(),
            "Registration entry created"
        );
        Ok(receipt)
    }
}

/// Extract the token from `Token: <value>`.
fn parse_token_output(stdout: &str) -> Option<JoinToken> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("Token:"))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(JoinToken::new)
}

/// Extract the ID from an `Entry ID : <id>` line when the server prints one.
fn parse_entry_id(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "Entry ID")
            .then(|| value.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}
