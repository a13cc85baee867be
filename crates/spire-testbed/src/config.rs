//! Testbed configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default, so an empty environment yields a working local setup that uses
//! `spire-server`/`spire-agent` from `PATH` and the `example.org` trust domain.

use common::types::{id_in, SpiffeId, TrustDomain};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default per-stage readiness timeout in seconds.
pub const DEFAULT_STAGE_TIMEOUT_SECONDS: u64 = 30;

/// Default delay between readiness probes in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Readiness waits per run; the default run deadline is this many stage timeouts.
pub const READINESS_WAITS_PER_RUN: u32 = 3;

/// Default trust domain.
pub const DEFAULT_TRUST_DOMAIN: &str = "example.org";

/// Default agent (node) ID path.
pub const DEFAULT_AGENT_PATH: &str = "/myagent";

/// Default workload ID path.
pub const DEFAULT_WORKLOAD_PATH: &str = "/testservice";

/// Default server port agents attach to.
pub const DEFAULT_SERVER_PORT: u16 = 8081;

/// Default server health listener port.
pub const DEFAULT_SERVER_HEALTH_PORT: u16 = 8080;

/// Default agent health listener port.
pub const DEFAULT_AGENT_HEALTH_PORT: u16 = 8088;

/// Default join token TTL in seconds.
pub const DEFAULT_JOIN_TOKEN_TTL_SECONDS: u64 = 600;

/// Default timeout for one administrative or fetch command in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 10;

/// Default dependent test command.
pub const DEFAULT_TEST_COMMAND: &str = "cargo test";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Testbed configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// `spire-server` binary (default: resolved from `PATH`).
    pub server_binary: PathBuf,

    /// `spire-agent` binary (default: resolved from `PATH`).
    pub agent_binary: PathBuf,

    /// Operator-supplied server config; rendered into the private dir when unset.
    pub server_config: Option<PathBuf>,

    /// Operator-supplied agent config; rendered into the private dir when unset.
    pub agent_config: Option<PathBuf>,

    /// Working directory for child processes, log files and the test command.
    pub work_dir: PathBuf,

    /// Root for markers, sockets and private state.
    pub temp_dir: PathBuf,

    /// Budget of each readiness wait.
    pub stage_timeout: Duration,

    /// Delay between readiness probes.
    pub poll_interval: Duration,

    /// Deadline for the whole bring-up, caps every readiness wait.
    pub run_timeout: Duration,

    /// Abort the run when a readiness wait times out instead of proceeding.
    pub abort_on_timeout: bool,

    pub trust_domain: TrustDomain,

    /// Node identity the join token is minted for; parent of the entry.
    pub agent_id: SpiffeId,

    /// Workload identity the dependent tests expect to receive.
    pub workload_id: SpiffeId,

    /// Selector expressions of the registration entry (`type:value`).
    pub selectors: Vec<String>,

    /// DNS SAN hints of the registration entry.
    pub dns_names: Vec<String>,

    pub server_port: u16,
    pub server_health_port: u16,
    pub agent_health_port: u16,

    pub join_token_ttl: Duration,

    /// Timeout of one administrative or fetch command.
    pub command_timeout: Duration,

    /// Shell command run once the identity is visible.
    pub test_command: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let server_binary = PathBuf::from(lookup(vars, "TESTBED_SERVER_BIN").unwrap_or("spire-server"));
        let agent_binary = PathBuf::from(lookup(vars, "TESTBED_AGENT_BIN").unwrap_or("spire-agent"));
        let server_config = lookup(vars, "TESTBED_SERVER_CONFIG").map(PathBuf::from);
        let agent_config = lookup(vars, "TESTBED_AGENT_CONFIG").map(PathBuf::from);

        let work_dir = PathBuf::from(lookup(vars, "TESTBED_WORK_DIR").unwrap_or("."));
        let temp_dir = lookup(vars, "TESTBED_TEMP_DIR").map_or_else(env::temp_dir, PathBuf::from);

        let stage_timeout = Duration::from_secs(parse_positive(
            lookup(vars, "TESTBED_STAGE_TIMEOUT_SECONDS"),
            "TESTBED_STAGE_TIMEOUT_SECONDS",
            DEFAULT_STAGE_TIMEOUT_SECONDS,
        )?);

        let poll_interval = Duration::from_millis(parse_positive(
            lookup(vars, "TESTBED_POLL_INTERVAL_MS"),
            "TESTBED_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        )?);

        let run_timeout = match lookup(vars, "TESTBED_RUN_TIMEOUT_SECONDS") {
            Some(value) => Duration::from_secs(parse_positive(
                Some(value),
                "TESTBED_RUN_TIMEOUT_SECONDS",
                0,
            )?),
            None => stage_timeout.checked_mul(READINESS_WAITS_PER_RUN).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "TESTBED_STAGE_TIMEOUT_SECONDS is too large to derive a run timeout; \
                     set TESTBED_RUN_TIMEOUT_SECONDS"
                        .to_string(),
                )
            })?,
        };

        let abort_on_timeout = match lookup(vars, "TESTBED_ABORT_ON_TIMEOUT") {
            None => false,
            Some(value) => parse_bool(value).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "TESTBED_ABORT_ON_TIMEOUT must be true or false, got '{value}'"
                ))
            })?,
        };

        let trust_domain =
            TrustDomain::new(lookup(vars, "TESTBED_TRUST_DOMAIN").unwrap_or(DEFAULT_TRUST_DOMAIN))
                .map_err(|e| ConfigError::InvalidValue(format!("TESTBED_TRUST_DOMAIN: {e}")))?;

        let agent_id = parse_id(
            lookup(vars, "TESTBED_AGENT_ID"),
            "TESTBED_AGENT_ID",
            &trust_domain,
            DEFAULT_AGENT_PATH,
        )?;
        let workload_id = parse_id(
            lookup(vars, "TESTBED_WORKLOAD_ID"),
            "TESTBED_WORKLOAD_ID",
            &trust_domain,
            DEFAULT_WORKLOAD_PATH,
        )?;

        let selectors = match lookup(vars, "TESTBED_SELECTORS") {
            Some(list) => split_list(list),
            None => vec![format!("unix:uid:{}", current_uid())],
        };
        if selectors.is_empty() {
            return Err(ConfigError::InvalidValue(
                "TESTBED_SELECTORS must contain at least one selector".to_string(),
            ));
        }

        let dns_names = lookup(vars, "TESTBED_DNS_NAMES")
            .map_or_else(|| vec!["localhost".to_string()], split_list);

        let server_port = parse_port(
            lookup(vars, "TESTBED_SERVER_PORT"),
            "TESTBED_SERVER_PORT",
            DEFAULT_SERVER_PORT,
        )?;
        let server_health_port = parse_port(
            lookup(vars, "TESTBED_SERVER_HEALTH_PORT"),
            "TESTBED_SERVER_HEALTH_PORT",
            DEFAULT_SERVER_HEALTH_PORT,
        )?;
        let agent_health_port = parse_port(
            lookup(vars, "TESTBED_AGENT_HEALTH_PORT"),
            "TESTBED_AGENT_HEALTH_PORT",
            DEFAULT_AGENT_HEALTH_PORT,
        )?;

        let join_token_ttl = Duration::from_secs(parse_positive(
            lookup(vars, "TESTBED_JOIN_TOKEN_TTL_SECONDS"),
            "TESTBED_JOIN_TOKEN_TTL_SECONDS",
            DEFAULT_JOIN_TOKEN_TTL_SECONDS,
        )?);

        let command_timeout = Duration::from_secs(parse_positive(
            lookup(vars, "TESTBED_COMMAND_TIMEOUT_SECONDS"),
            "TESTBED_COMMAND_TIMEOUT_SECONDS",
            DEFAULT_COMMAND_TIMEOUT_SECONDS,
        )?);

        let test_command = lookup(vars, "TESTBED_TEST_COMMAND")
            .unwrap_or(DEFAULT_TEST_COMMAND)
            .to_string();

        Ok(Config {
            server_binary,
            agent_binary,
            server_config,
            agent_config,
            work_dir,
            temp_dir,
            stage_timeout,
            poll_interval,
            run_timeout,
            abort_on_timeout,
            trust_domain,
            agent_id,
            workload_id,
            selectors,
            dns_names,
            server_port,
            server_health_port,
            agent_health_port,
            join_token_ttl,
            command_timeout,
            test_command,
        })
    }
}

fn lookup<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key).map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn parse_positive(value: Option<&str>, key: &str, default: u64) -> Result<u64, ConfigError> {
    let Some(value_str) = value else {
        return Ok(default);
    };
    let value: u64 = value_str.parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "{key} must be a valid positive integer, got '{value_str}': {e}"
        ))
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(value)
}

fn parse_port(value: Option<&str>, key: &str, default: u16) -> Result<u16, ConfigError> {
    let Some(value_str) = value else {
        return Ok(default);
    };
    match value_str.parse::<u16>() {
        Ok(0) => Err(ConfigError::InvalidValue(format!("{key} must not be 0"))),
        Ok(port) => Ok(port),
        Err(e) => Err(ConfigError::InvalidValue(format!(
            "{key} must be a valid port, got '{value_str}': {e}"
        ))),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_id(
    value: Option<&str>,
    key: &str,
    trust_domain: &TrustDomain,
    default_path: &str,
) -> Result<SpiffeId, ConfigError> {
    let id = match value {
        Some(raw) => SpiffeId::new(raw),
        None => id_in(trust_domain, default_path),
    }
    .map_err(|e| ConfigError::InvalidValue(format!("{key}: {e}")))?;

    if id.trust_domain() != trust_domain {
        return Err(ConfigError::InvalidValue(format!(
            "{key} '{id}' is not in trust domain '{trust_domain}'"
        )));
    }
    Ok(id)
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn current_uid() -> u32 {
    // SAFETY: getuid(2) takes no arguments, cannot fail and touches no memory.
    unsafe { libc::getuid() }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_from_empty_environment() {
        let config = Config::from_vars(&HashMap::new()).unwrap();

        assert_eq!(config.server_binary, PathBuf::from("spire-server"));
        assert_eq!(config.agent_binary, PathBuf::from("spire-agent"));
        assert!(config.server_config.is_none());
        assert_eq!(config.stage_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.run_timeout, Duration::from_secs(90));
        assert!(!config.abort_on_timeout);
        assert_eq!(config.agent_id.to_string(), "spiffe://example.org/myagent");
        assert_eq!(
            config.workload_id.to_string(),
            "spiffe://example.org/testservice"
        );
        assert_eq!(config.selectors.len(), 1);
        assert!(config.selectors.first().unwrap().starts_with("unix:uid:"));
        assert_eq!(config.dns_names, vec!["localhost".to_string()]);
        assert_eq!(config.server_health_port, 8080);
        assert_eq!(config.agent_health_port, 8088);
        assert_eq!(config.test_command, "cargo test");
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_vars(&vars(&[
            ("TESTBED_TRUST_DOMAIN", "test.local"),
            ("TESTBED_WORKLOAD_ID", "spiffe://test.local/ns/default/sa/web"),
            ("TESTBED_SELECTORS", "unix:uid:1000, unix:gid:1000"),
            ("TESTBED_DNS_NAMES", ""),
            ("TESTBED_STAGE_TIMEOUT_SECONDS", "5"),
            ("TESTBED_POLL_INTERVAL_MS", "250"),
            ("TESTBED_ABORT_ON_TIMEOUT", "true"),
            ("TESTBED_TEMP_DIR", "/var/tmp/tb"),
        ]))
        .unwrap();

        assert_eq!(config.agent_id.to_string(), "spiffe://test.local/myagent");
        assert_eq!(config.workload_id.path(), "/ns/default/sa/web");
        assert_eq!(
            config.selectors,
            vec!["unix:uid:1000".to_string(), "unix:gid:1000".to_string()]
        );
        // Blank falls back to the default.
        assert_eq!(config.dns_names, vec!["localhost".to_string()]);
        assert_eq!(config.run_timeout, Duration::from_secs(15));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(config.abort_on_timeout);
        assert_eq!(config.temp_dir, PathBuf::from("/var/tmp/tb"));
    }

    #[test]
    fn test_explicit_run_timeout() {
        let config = Config::from_vars(&vars(&[("TESTBED_RUN_TIMEOUT_SECONDS", "42")])).unwrap();
        assert_eq!(config.run_timeout, Duration::from_secs(42));
    }

    #[test]
    fn test_huge_stage_timeout_needs_explicit_run_timeout() {
        let max = u64::MAX.to_string();

        let err = Config::from_vars(&vars(&[("TESTBED_STAGE_TIMEOUT_SECONDS", &max)])).unwrap_err();
        assert!(err.to_string().contains("TESTBED_RUN_TIMEOUT_SECONDS"));

        let config = Config::from_vars(&vars(&[
            ("TESTBED_STAGE_TIMEOUT_SECONDS", &max),
            ("TESTBED_RUN_TIMEOUT_SECONDS", &max),
        ]))
        .unwrap();
        assert_eq!(config.run_timeout, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_rejects_zero_and_garbage_durations() {
        let err = Config::from_vars(&vars(&[("TESTBED_POLL_INTERVAL_MS", "0")])).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));

        let err =
            Config::from_vars(&vars(&[("TESTBED_STAGE_TIMEOUT_SECONDS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("TESTBED_STAGE_TIMEOUT_SECONDS"));
    }

    #[test]
    fn test_rejects_bad_bool_and_port() {
        assert!(Config::from_vars(&vars(&[("TESTBED_ABORT_ON_TIMEOUT", "maybe")])).is_err());
        assert!(Config::from_vars(&vars(&[("TESTBED_SERVER_HEALTH_PORT", "0")])).is_err());
        assert!(Config::from_vars(&vars(&[("TESTBED_AGENT_HEALTH_PORT", "70000")])).is_err());
    }

    #[test]
    fn test_rejects_id_outside_trust_domain() {
        let err = Config::from_vars(&vars(&[(
            "TESTBED_WORKLOAD_ID",
            "spiffe://other.org/testservice",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("not in trust domain"));
    }

    #[test]
    fn test_rejects_invalid_trust_domain() {
        let err = Config::from_vars(&vars(&[("TESTBED_TRUST_DOMAIN", "Not Valid")])).unwrap_err();
        assert!(err.to_string().contains("TESTBED_TRUST_DOMAIN"));
    }

    #[test]
    fn test_rejects_empty_selector_list() {
        let err = Config::from_vars(&vars(&[("TESTBED_SELECTORS", " , ,")])).unwrap_err();
        assert!(err.to_string().contains("at least one selector"));
    }
}
