//! Configuration parsing and validation.
//!
//! The gateway is driven by a JSON config file with a single `mcpServers`
//! mapping (upstream name -> transport definition), plus CLI/env settings.

use crate::error::{GatewayError, Result};
use crate::timeouts;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    #[value(name = "info")]
    Info,
    #[value(name = "none")]
    None,
    #[value(name = "debug")]
    Debug,
}

/// CLI arguments for the gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "manifold-gateway")]
#[command(
    version,
    about = "Aggregating MCP gateway: one endpoint for many stdio/HTTP/SSE MCP servers"
)]
pub struct CliArgs {
    /// Path to the MCP servers JSON config (mcpServers format).
    #[arg(short = 'c', long = "config", env = "MANIFOLD_CONFIG")]
    pub config: PathBuf,

    /// Listener port.
    #[arg(long, env = "MANIFOLD_PORT", default_value_t = 3006)]
    pub port: u16,

    /// Log level.
    #[arg(
        long = "log-level",
        env = "MANIFOLD_LOG",
        value_enum,
        default_value_t = LogLevel::Info
    )]
    pub log_level: LogLevel,

    /// Shorthand for --log-level debug.
    #[arg(long, env = "MANIFOLD_DEBUG", default_value_t = false)]
    pub debug: bool,

    /// Emit permissive CORS headers (browser clients).
    #[arg(
        long,
        env = "MANIFOLD_CORS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub cors: bool,

    /// Extra health-check path(s) answering 200 "ok". Repeatable.
    #[arg(long = "health-endpoint", env = "MANIFOLD_HEALTH_ENDPOINT")]
    pub health_endpoint: Vec<String>,

    /// Upstream connect timeout in milliseconds.
    #[arg(
        long,
        env = "MANIFOLD_TIMEOUT_MS",
        default_value_t = timeouts::DEFAULT_CONNECT_TIMEOUT_MS
    )]
    pub timeout: u64,

    /// Maximum in-flight requests per client session.
    #[arg(
        long = "max-concurrent-requests-per-session",
        env = "MANIFOLD_MAX_CONCURRENT_REQUESTS_PER_SESSION",
        default_value_t = 10
    )]
    pub max_concurrent_requests_per_session: usize,

    /// Maximum parallel upstream connects at startup (<= 0 means unbounded).
    #[arg(
        long = "max-concurrent-server-connections",
        env = "MANIFOLD_MAX_CONCURRENT_SERVER_CONNECTIONS"
    )]
    pub max_concurrent_server_connections: Option<i64>,
}

/// Effective runtime settings (after merging defaults + env + CLI).
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub port: u16,
    pub log_level: LogLevel,
    pub cors: bool,
    pub health_endpoints: Vec<String>,
    pub connect_timeout: Duration,
    pub max_requests_per_session: usize,
    /// `None` = unbounded (collapses to the number of configured upstreams).
    pub max_parallel_connects: Option<usize>,
}

impl GatewaySettings {
    pub fn from_cli(cli: &CliArgs) -> Self {
        let log_level = if cli.debug {
            LogLevel::Debug
        } else {
            cli.log_level
        };
        Self {
            port: cli.port,
            log_level,
            cors: cli.cors,
            health_endpoints: cli
                .health_endpoint
                .iter()
                .map(|p| normalize_path(p))
                .collect(),
            connect_timeout: timeouts::effective_connect_timeout(cli.timeout),
            max_requests_per_session: cli.max_concurrent_requests_per_session.max(1),
            max_parallel_connects: sanitize_parallelism(cli.max_concurrent_server_connections),
        }
    }
}

/// Non-positive values collapse to "unbounded".
pub fn sanitize_parallelism(value: Option<i64>) -> Option<usize> {
    match value {
        Some(v) if v > 0 => Some(v as usize),
        _ => None,
    }
}

fn normalize_path(p: &str) -> String {
    if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{p}")
    }
}

// ============================================================================
// MCP Servers Config File
// ============================================================================

/// `mcpServers` configuration file format.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfigFile {
    #[serde(default)]
    pub mcp_servers: HashMap<String, ServerEntry>,
}

/// One upstream definition as written in the config file.
///
/// Either `command` (stdio) or `url` (remote) must be present; `type` can
/// force a specific remote transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// A validated upstream definition.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone)]
pub enum TransportConfig {
    Stdio(StdioConfig),
    Remote { url: String, mode: RemoteMode },
}

#[derive(Debug, Clone)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Merged over the gateway's own environment at spawn time (these win).
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    /// Try the modern streaming transport, fall back to legacy SSE.
    Fallback,
    /// `type: "sse"` — legacy SSE only.
    ForceLegacy,
    /// `type: "stream"` — modern streaming only.
    ForceModern,
}

/// Load, expand and validate the config file.
pub fn load_config(path: &std::path::Path) -> Result<Vec<UpstreamConfig>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("Failed to read {}: {e}", path.display())))?;
    let file: McpConfigFile = serde_json::from_str(&content)
        .map_err(|e| GatewayError::Config(format!("Failed to parse {}: {e}", path.display())))?;
    resolve_config(file)
}

pub fn resolve_config(file: McpConfigFile) -> Result<Vec<UpstreamConfig>> {
    if file.mcp_servers.is_empty() {
        return Err(GatewayError::Config(
            "config must define at least one entry under mcpServers".to_string(),
        ));
    }

    let mut upstreams: Vec<UpstreamConfig> = Vec::with_capacity(file.mcp_servers.len());
    for (name, entry) in file.mcp_servers {
        validate_name(&name)?;
        let transport = resolve_entry(&name, entry)?;
        upstreams.push(UpstreamConfig { name, transport });
    }
    // Deterministic connect order regardless of map iteration.
    upstreams.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(upstreams)
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(GatewayError::Config(
            "mcpServers keys must be non-empty".to_string(),
        ));
    }
    // '.' and '://' are the namespacing separators for tools/prompts and
    // resources; an upstream name containing them could not be routed back.
    if name.contains('.') || name.contains("://") {
        return Err(GatewayError::Config(format!(
            "mcpServers key '{name}' must not contain '.' or '://'"
        )));
    }
    Ok(())
}

fn resolve_entry(name: &str, entry: ServerEntry) -> Result<TransportConfig> {
    let kind = entry.kind.as_deref();
    match (&entry.command, &entry.url) {
        (Some(_), Some(_)) => Err(GatewayError::Config(format!(
            "mcpServers.{name}: 'command' and 'url' are mutually exclusive"
        ))),
        (Some(command), None) => {
            if !matches!(kind, None | Some("stdio")) {
                return Err(GatewayError::Config(format!(
                    "mcpServers.{name}: type '{}' requires 'url'",
                    kind.unwrap_or_default()
                )));
            }
            Ok(TransportConfig::Stdio(StdioConfig {
                command: expand(command)?,
                args: entry
                    .args
                    .iter()
                    .map(|a| expand(a))
                    .collect::<Result<Vec<_>>>()?,
                env: entry
                    .env
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), expand(v)?)))
                    .collect::<Result<HashMap<_, _>>>()?,
            }))
        }
        (None, Some(url)) => {
            let mode = match kind {
                None | Some("http") => RemoteMode::Fallback,
                Some("sse") => RemoteMode::ForceLegacy,
                Some("stream") => RemoteMode::ForceModern,
                Some("stdio") => {
                    return Err(GatewayError::Config(format!(
                        "mcpServers.{name}: type 'stdio' requires 'command'"
                    )));
                }
                Some(other) => {
                    return Err(GatewayError::Config(format!(
                        "mcpServers.{name}: unknown type '{other}' (expected stdio|http|sse|stream)"
                    )));
                }
            };
            Ok(TransportConfig::Remote {
                url: expand(url)?,
                mode,
            })
        }
        (None, None) => Err(GatewayError::Config(format!(
            "mcpServers.{name}: one of 'command' or 'url' is required"
        ))),
    }
}

/// Expand `${VAR}` patterns in a config string.
fn expand(s: &str) -> Result<String> {
    manifold_env::expand_env_string(s).map_err(GatewayError::Config)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Vec<UpstreamConfig>> {
        resolve_config(serde_json::from_str(json).expect("valid json"))
    }

    #[test]
    fn stdio_entry_is_inferred_from_command() {
        let ups = parse(r#"{"mcpServers":{"fs":{"command":"mcp-fs","args":["--root","/tmp"]}}}"#)
            .expect("config");
        assert_eq!(ups.len(), 1);
        assert_eq!(ups[0].name, "fs");
        match &ups[0].transport {
            TransportConfig::Stdio(s) => {
                assert_eq!(s.command, "mcp-fs");
                assert_eq!(s.args, vec!["--root", "/tmp"]);
            }
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn url_entry_defaults_to_fallback() {
        let ups = parse(r#"{"mcpServers":{"x":{"url":"http://h/"}}}"#).expect("config");
        match &ups[0].transport {
            TransportConfig::Remote { url, mode } => {
                assert_eq!(url, "http://h/");
                assert_eq!(*mode, RemoteMode::Fallback);
            }
            other => panic!("expected remote, got {other:?}"),
        }
    }

    #[test]
    fn type_forces_transport() {
        let ups =
            parse(r#"{"mcpServers":{"a":{"url":"http://h/","type":"sse"},"b":{"url":"http://h/","type":"stream"}}}"#)
                .expect("config");
        let mode_of = |name: &str| {
            ups.iter()
                .find(|u| u.name == name)
                .map(|u| match &u.transport {
                    TransportConfig::Remote { mode, .. } => *mode,
                    TransportConfig::Stdio(_) => panic!("expected remote"),
                })
                .unwrap()
        };
        assert_eq!(mode_of("a"), RemoteMode::ForceLegacy);
        assert_eq!(mode_of("b"), RemoteMode::ForceModern);
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(parse(r#"{"mcpServers":{}}"#).is_err());
        assert!(parse(r#"{}"#).is_err());
    }

    #[test]
    fn reserved_separators_in_names_are_rejected() {
        assert!(parse(r#"{"mcpServers":{"a.b":{"command":"x"}}}"#).is_err());
        assert!(parse(r#"{"mcpServers":{"a://b":{"command":"x"}}}"#).is_err());
        assert!(parse(r#"{"mcpServers":{"  ":{"command":"x"}}}"#).is_err());
    }

    #[test]
    fn conflicting_and_missing_fields_are_rejected() {
        assert!(parse(r#"{"mcpServers":{"a":{"command":"x","url":"http://h/"}}}"#).is_err());
        assert!(parse(r#"{"mcpServers":{"a":{}}}"#).is_err());
        assert!(parse(r#"{"mcpServers":{"a":{"url":"http://h/","type":"bogus"}}}"#).is_err());
        assert!(parse(r#"{"mcpServers":{"a":{"command":"x","type":"sse"}}}"#).is_err());
    }

    #[test]
    fn env_vars_are_expanded_in_stdio_entries() {
        unsafe { std::env::set_var("MANIFOLD_CFG_TEST_BIN", "/opt/bin/server") };
        let ups = parse(
            r#"{"mcpServers":{"s":{"command":"${MANIFOLD_CFG_TEST_BIN}","env":{"KEY":"${MANIFOLD_CFG_TEST_BIN}"}}}}"#,
        )
        .expect("config");
        match &ups[0].transport {
            TransportConfig::Stdio(s) => {
                assert_eq!(s.command, "/opt/bin/server");
                assert_eq!(s.env.get("KEY").map(String::as_str), Some("/opt/bin/server"));
            }
            other => panic!("expected stdio, got {other:?}"),
        }
        unsafe { std::env::remove_var("MANIFOLD_CFG_TEST_BIN") };
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("servers.json");
        std::fs::write(&path, r#"{"mcpServers":{"fs":{"command":"mcp-fs"}}}"#).expect("write");
        let ups = load_config(&path).expect("load");
        assert_eq!(ups[0].name, "fs");
        assert!(load_config(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn parallelism_sanitization_collapses_nonpositive() {
        assert_eq!(sanitize_parallelism(None), None);
        assert_eq!(sanitize_parallelism(Some(0)), None);
        assert_eq!(sanitize_parallelism(Some(-3)), None);
        assert_eq!(sanitize_parallelism(Some(4)), Some(4));
    }

    #[test]
    fn settings_normalize_health_paths_and_debug_flag() {
        let cli = CliArgs::parse_from([
            "manifold-gateway",
            "-c",
            "servers.json",
            "--debug",
            "--health-endpoint",
            "healthz",
            "--health-endpoint",
            "/ready",
        ]);
        let settings = GatewaySettings::from_cli(&cli);
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.health_endpoints, vec!["/healthz", "/ready"]);
        assert_eq!(settings.port, 3006);
        assert_eq!(settings.max_requests_per_session, 10);
    }
}
