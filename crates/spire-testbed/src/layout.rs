//! Filesystem layout of one testbed run.
//!
//! Every ephemeral artifact lives at a path computed here, so that a later
//! `down` invocation (possibly from a different process) finds exactly what
//! an earlier `up` created.
//!
//! ```text
//! <temp>/spire-testbed.lock              run lock
//! <temp>/spire-testbed/server.pid        pid markers
//! <temp>/spire-testbed/agent.pid
//! <temp>/spire-testbed/join_token        credential hand-off
//! <temp>/spire-testbed/server/           server private dir (data, socket, conf)
//! <temp>/spire-testbed/agent/            agent private dir (data, socket, conf)
//! <work>/spire-server.log                log sinks
//! <work>/spire-agent.log
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

const STATE_DIR_NAME: &str = "spire-testbed";
const LOCK_FILE_NAME: &str = "spire-testbed.lock";

/// The two external processes the testbed manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Server,
    Agent,
}

impl Service {
    /// Teardown order: the agent goes first so it does not log a storm of
    /// reconnect failures against a dead server.
    pub const TEARDOWN_ORDER: [Service; 2] = [Service::Agent, Service::Server];

    fn short_name(self) -> &'static str {
        match self {
            Service::Server => "server",
            Service::Agent => "agent",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Server => f.write_str("spire-server"),
            Service::Agent => f.write_str("spire-agent"),
        }
    }
}

/// Paths of every artifact created by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    work_dir: PathBuf,
    temp_dir: PathBuf,
}

impl Layout {
    pub fn new(work_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            temp_dir: temp_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Directory holding markers and both private dirs.
    pub fn state_dir(&self) -> PathBuf {
        self.temp_dir.join(STATE_DIR_NAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.temp_dir.join(LOCK_FILE_NAME)
    }

    /// Private state directory of one service. Removed recursively on teardown.
    pub fn private_dir(&self, service: Service) -> PathBuf {
        self.state_dir().join(service.short_name())
    }

    pub fn data_dir(&self, service: Service) -> PathBuf {
        self.private_dir(service).join("data")
    }

    /// Server admin socket or agent Workload API socket.
    pub fn socket_path(&self, service: Service) -> PathBuf {
        match service {
            Service::Server => self.private_dir(service).join("private").join("api.sock"),
            Service::Agent => self.private_dir(service).join("public").join("api.sock"),
        }
    }

    /// Where a default config is rendered when the operator supplies none.
    pub fn rendered_config(&self, service: Service) -> PathBuf {
        self.private_dir(service)
            .join(format!("{}.conf", service.short_name()))
    }

    pub fn pid_marker(&self, service: Service) -> PathBuf {
        self.state_dir().join(format!("{}.pid", service.short_name()))
    }

    pub fn join_token_file(&self) -> PathBuf {
        self.state_dir().join("join_token")
    }

    pub fn log_file(&self, service: Service) -> PathBuf {
        self.work_dir.join(format!("{service}.log"))
    }

    /// Marker files deleted by teardown (pid records and the credential).
    pub fn marker_files(&self) -> Vec<PathBuf> {
        vec![
            self.pid_marker(Service::Agent),
            self.pid_marker(Service::Server),
            self.join_token_file(),
        ]
    }
}
