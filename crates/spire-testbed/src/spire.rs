//! SPIRE-specific wiring: configs, command lines and probe targets.
//!
//! Everything that knows the `spire-server`/`spire-agent` command grammar or
//! config format lives here. The rest of the crate only sees `ServiceSpec`s,
//! probes and an `AdminClient`.

use crate::admin::JoinToken;
use crate::config::Config;
use crate::layout::{Layout, Service};
use crate::probe::CommandProbe;
use crate::supervisor::ServiceSpec;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exported to both children so operator configs can use `${...}` expansion.
pub const SERVER_DIR_ENV: &str = "SPIRE_TESTBED_SERVER_DIR";
pub const AGENT_DIR_ENV: &str = "SPIRE_TESTBED_AGENT_DIR";

const LOOPBACK: &str = "127.0.0.1";

/// `http://127.0.0.1:<port>/ready` of a service's health listener.
pub fn ready_url(config: &Config, service: Service) -> String {
    let port = match service {
        Service::Server => config.server_health_port,
        Service::Agent => config.agent_health_port,
    };
    format!("http://{LOOPBACK}:{port}/ready")
}

/// `spire-agent api fetch` against the agent's Workload API socket.
pub fn identity_fetch_probe(config: &Config, layout: &Layout) -> CommandProbe {
    CommandProbe::new(
        config.agent_binary.clone(),
        vec![
            "api".to_string(),
            "fetch".to_string(),
            "-socketPath".to_string(),
            layout.socket_path(Service::Agent).display().to_string(),
        ],
        config.command_timeout,
    )
}

/// Create the private directories of `service` and return the config path
/// to launch it with.
///
/// An operator-supplied config is used as-is; otherwise a default one is
/// rendered into the private directory.
pub fn prepare(service: Service, config: &Config, layout: &Layout) -> io::Result<PathBuf> {
    fs::create_dir_all(layout.data_dir(service))?;
    if let Some(parent) = layout.socket_path(service).parent() {
        fs::create_dir_all(parent)?;
    }

    let supplied = match service {
        Service::Server => config.server_config.as_ref(),
        Service::Agent => config.agent_config.as_ref(),
    };
    if let Some(path) = supplied {
        debug!(%service, config = %path.display(), "Using supplied config");
        return Ok(path.clone());
    }

    let rendered = match service {
        Service::Server => render_server_config(config, layout),
        Service::Agent => render_agent_config(config, layout),
    };
    let path = layout.rendered_config(service);
    fs::write(&path, rendered)?;
    debug!(%service, config = %path.display(), "Rendered default config");
    Ok(path)
}

/// `spire-server run -config <path> -expandEnv`
pub fn server_spec(config: &Config, layout: &Layout, config_path: &Path) -> ServiceSpec {
    ServiceSpec {
        service: Service::Server,
        binary: config.server_binary.clone(),
        args: vec![
            "run".to_string(),
            "-config".to_string(),
            config_path.display().to_string(),
            "-expandEnv".to_string(),
        ],
        log_path: layout.log_file(Service::Server),
        working_dir: layout.work_dir().to_path_buf(),
        env: child_env(layout),
    }
}

/// `spire-agent run -config <path> -joinToken <token> -expandEnv`
pub fn agent_spec(
    config: &Config,
    layout: &Layout,
    config_path: &Path,
    token: &JoinToken,
) -> ServiceSpec {
    ServiceSpec {
        service: Service::Agent,
        binary: config.agent_binary.clone(),
        args: vec![
            "run".to_string(),
            "-config".to_string(),
            config_path.display().to_string(),
            "-joinToken".to_string(),
            token.expose().to_string(),
            "-expandEnv".to_string(),
        ],
        log_path: layout.log_file(Service::Agent),
        working_dir: layout.work_dir().to_path_buf(),
        env: child_env(layout),
    }
}

fn child_env(layout: &Layout) -> Vec<(String, String)> {
    vec![
        (
            SERVER_DIR_ENV.to_string(),
            layout.private_dir(Service::Server).display().to_string(),
        ),
        (
            AGENT_DIR_ENV.to_string(),
            layout.private_dir(Service::Agent).display().to_string(),
        ),
    ]
}

pub fn render_server_config(config: &Config, layout: &Layout) -> String {
    let data_dir = layout.data_dir(Service::Server);
    format!(
        r#"server {{
    bind_address = "{LOOPBACK}"
    bind_port = "{port}"
    socket_path = {socket}
    trust_domain = {trust_domain}
    data_dir = {data_dir}
    log_level = "DEBUG"
}}

plugins {{
    DataStore "sql" {{
        plugin_data {{
            database_type = "sqlite3"
            connection_string = {datastore}
        }}
    }}

    NodeAttestor "join_token" {{
        plugin_data {{}}
    }}

    KeyManager "memory" {{
        plugin_data {{}}
    }}
}}

{health}
"#,
        port = config.server_port,
        socket = hcl_string(&layout.socket_path(Service::Server).display().to_string()),
        trust_domain = hcl_string(&config.trust_domain.to_string()),
        data_dir = hcl_string(&data_dir.display().to_string()),
        datastore = hcl_string(&data_dir.join("datastore.sqlite3").display().to_string()),
        health = health_checks(config.server_health_port),
    )
}

pub fn render_agent_config(config: &Config, layout: &Layout) -> String {
    format!(
        r#"agent {{
    data_dir = {data_dir}
    log_level = "DEBUG"
    server_address = "{LOOPBACK}"
    server_port = "{port}"
    socket_path = {socket}
    trust_domain = {trust_domain}
    insecure_bootstrap = true
}}

plugins {{
    NodeAttestor "join_token" {{
        plugin_data {{}}
    }}

    KeyManager "memory" {{
        plugin_data {{}}
    }}

    WorkloadAttestor "unix" {{
        plugin_data {{}}
    }}
}}

{health}
"#,
        data_dir = hcl_string(&layout.data_dir(Service::Agent).display().to_string()),
        port = config.server_port,
        socket = hcl_string(&layout.socket_path(Service::Agent).display().to_string()),
        trust_domain = hcl_string(&config.trust_domain.to_string()),
        health = health_checks(config.agent_health_port),
    )
}

fn health_checks(port: u16) -> String {
    format!(
        r#"health_checks {{
    listener_enabled = true
    bind_address = "{LOOPBACK}"
    bind_port = "{port}"
    live_path = "/live"
    ready_path = "/ready"
}}"#
    )
}

fn hcl_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> Config {
        Config::from_vars(&HashMap::new()).unwrap()
    }

    #[test]
    fn test_ready_urls_use_health_ports() {
        let config = config();
        assert_eq!(
            ready_url(&config, Service::Server),
            "http://127.0.0.1:8080/ready"
        );
        assert_eq!(
            ready_url(&config, Service::Agent),
            "http://127.0.0.1:8088/ready"
        );
    }

    #[test]
    fn test_agent_command_line_carries_token() {
        let config = config();
        let layout = Layout::new("/work", "/tmp");
        let spec = agent_spec(
            &config,
            &layout,
            Path::new("/tmp/agent.conf"),
            &JoinToken::new("abc123"),
        );

        assert_eq!(
            spec.args,
            vec![
                "run",
                "-config",
                "/tmp/agent.conf",
                "-joinToken",
                "abc123",
                "-expandEnv"
            ]
        );
        assert_eq!(spec.log_path, PathBuf::from("/work/spire-agent.log"));
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == AGENT_DIR_ENV && v == "/tmp/spire-testbed/agent"));
    }

    #[test]
    fn test_server_command_line() {
        let config = config();
        let layout = Layout::new("/work", "/tmp");
        let spec = server_spec(&config, &layout, Path::new("/etc/server.conf"));

        assert_eq!(spec.binary, PathBuf::from("spire-server"));
        assert_eq!(
            spec.args,
            vec!["run", "-config", "/etc/server.conf", "-expandEnv"]
        );
        assert_eq!(spec.working_dir, PathBuf::from("/work"));
    }

    #[test]
    fn test_rendered_configs_point_into_private_dirs() {
        let config = config();
        let layout = Layout::new("/work", "/tmp");

        let server = render_server_config(&config, &layout);
        assert!(server.contains(r#"socket_path = "/tmp/spire-testbed/server/private/api.sock""#));
        assert!(server.contains(r#"trust_domain = "example.org""#));
        assert!(server.contains(r#"NodeAttestor "join_token""#));
        assert!(server.contains(r#"bind_port = "8080""#));

        let agent = render_agent_config(&config, &layout);
        assert!(agent.contains(r#"server_port = "8081""#));
        assert!(agent.contains(r#"WorkloadAttestor "unix""#));
        assert!(agent.contains(r#"bind_port = "8088""#));
        assert!(agent.contains(r#"ready_path = "/ready""#));
    }

    #[test]
    fn test_prepare_renders_when_unsupplied() {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path(), temp.path());
        let config = config();

        let path = prepare(Service::Agent, &config, &layout).unwrap();

        assert_eq!(path, layout.rendered_config(Service::Agent));
        assert!(path.exists());
        assert!(layout.data_dir(Service::Agent).is_dir());
        assert!(layout
            .socket_path(Service::Agent)
            .parent()
            .unwrap()
            .is_dir());
    }

    #[test]
    fn test_prepare_keeps_supplied_config() {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path(), temp.path());
        let mut config = config();
        config.server_config = Some(PathBuf::from("/etc/spire/server.conf"));

        let path = prepare(Service::Server, &config, &layout).unwrap();

        assert_eq!(path, PathBuf::from("/etc/spire/server.conf"));
        assert!(!layout.rendered_config(Service::Server).exists());
    }

    #[test]
    fn test_hcl_string_escapes() {
        assert_eq!(hcl_string(r#"a"b\c"#), r#""a\"b\\c""#);
    }
}
