//! Configuration document types
//!
//! Field names mirror the on-disk JSON schema: camelCase for the structural
//! fields, plus the two historically snake_cased OAuth keys
//! (`mcp_oauth_credentials_store`, `mcp_oauth_callback_port`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Default seconds a downstream gets to complete the initialize handshake
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default per-call timeout for `tools/call`
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

/// Root configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Schema version; documents with a newer version are rejected
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    /// Downstream servers keyed by name
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,

    /// Namespaces keyed by name
    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespaceConfig>,

    /// Explicit per-tool permission overrides
    #[serde(default, rename = "toolPermissions")]
    pub tool_permissions: Vec<ToolPermission>,

    /// Namespace activated when `serve` is started without a flag
    #[serde(rename = "defaultNamespace", skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,

    /// Where OAuth tokens are persisted
    #[serde(default, rename = "mcp_oauth_credentials_store")]
    pub credentials_store: CredentialStoreMode,

    /// Fixed OAuth loopback callback port; absent means ephemeral
    #[serde(rename = "mcp_oauth_callback_port", skip_serializing_if = "Option::is_none")]
    pub oauth_callback_port: Option<u16>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            servers: BTreeMap::new(),
            namespaces: BTreeMap::new(),
            tool_permissions: Vec::new(),
            default_namespace: None,
            credentials_store: CredentialStoreMode::default(),
            oauth_callback_port: None,
        }
    }
}

impl GatewayConfig {
    /// Semantic validation applied on load and after every mutation batch.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.schema_version > SCHEMA_VERSION {
            return Err(ConfigError::validation(format!(
                "unsupported schema version {} (newest known is {})",
                self.schema_version, SCHEMA_VERSION
            )));
        }

        if self.oauth_callback_port == Some(0) {
            return Err(ConfigError::validation(
                "mcp_oauth_callback_port must be omitted for an ephemeral port, not 0",
            ));
        }

        for name in self.servers.keys() {
            validate_name(name)?;
        }
        for (name, ns) in &self.namespaces {
            validate_name(name)?;
            for member in &ns.servers {
                if !self.servers.contains_key(member) {
                    return Err(ConfigError::validation(format!(
                        "namespace '{name}' references unknown server '{member}'"
                    )));
                }
            }
        }
        for perm in &self.tool_permissions {
            if !self.namespaces.contains_key(&perm.namespace) {
                return Err(ConfigError::validation(format!(
                    "permission references unknown namespace '{}'",
                    perm.namespace
                )));
            }
            if !self.servers.contains_key(&perm.server) {
                return Err(ConfigError::validation(format!(
                    "permission references unknown server '{}'",
                    perm.server
                )));
            }
        }
        if let Some(ns) = &self.default_namespace {
            if !self.namespaces.contains_key(ns) {
                return Err(ConfigError::validation(format!(
                    "default namespace '{ns}' does not exist"
                )));
            }
        }

        Ok(())
    }

    /// Effective permission for a tool in a namespace: explicit override if
    /// present, otherwise the namespace's deny-by-default policy.
    pub fn tool_allowed(&self, namespace: &str, server: &str, tool: &str) -> bool {
        if let Some(perm) = self.tool_permissions.iter().find(|p| {
            p.namespace == namespace && p.server == server && p.tool_name == tool
        }) {
            return perm.enabled;
        }
        match self.namespaces.get(namespace) {
            Some(ns) => !ns.deny_by_default,
            // Implicit all-servers namespace allows by default.
            None => true,
        }
    }

    /// Members of a namespace, or every configured server for the implicit
    /// all-servers view when the namespace is unknown.
    pub fn namespace_members(&self, namespace: &str) -> Vec<String> {
        match self.namespaces.get(namespace) {
            Some(ns) => ns.servers.clone(),
            None => self.servers.keys().cloned().collect(),
        }
    }
}

/// A downstream server definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Transport-specific settings, tagged by `kind`
    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Absent means enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Start eagerly when `serve` begins (and restart after crashes)
    #[serde(default)]
    pub autostart: bool,

    /// Override of the initialize-handshake timeout
    #[serde(rename = "startupTimeoutSecs", skip_serializing_if = "Option::is_none")]
    pub startup_timeout_secs: Option<u64>,

    /// Override of the per-call tool timeout
    #[serde(rename = "toolTimeoutSecs", skip_serializing_if = "Option::is_none")]
    pub tool_timeout_secs: Option<u64>,
}

impl ServerConfig {
    /// Create a stdio server definition with defaults
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: TransportConfig::Stdio(StdioServerConfig {
                command: command.into(),
                args,
                cwd: None,
                env: BTreeMap::new(),
            }),
            enabled: None,
            autostart: false,
            startup_timeout_secs: None,
            tool_timeout_secs: None,
        }
    }

    /// Create a streamable-HTTP server definition with defaults
    pub fn streamable_http(url: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::StreamableHttp(HttpServerConfig {
                url: url.into(),
                bearer_token_env_var: None,
                oauth_scopes: Vec::new(),
                http_headers: BTreeMap::new(),
                env_http_headers: BTreeMap::new(),
            }),
            enabled: None,
            autostart: false,
            startup_timeout_secs: None,
            tool_timeout_secs: None,
        }
    }

    /// Absent `enabled` means enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Startup timeout with the gateway default applied
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(
            self.startup_timeout_secs
                .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
        )
    }

    /// Tool-call timeout with the gateway default applied
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS))
    }

    /// Whether two definitions describe the same running process or session.
    ///
    /// The hot-reload differ restarts a server only when this returns false;
    /// flags that do not affect the transport (`enabled`, `autostart`) are
    /// excluded.
    pub fn runtime_params_eq(&self, other: &ServerConfig) -> bool {
        self.transport == other.transport
            && self.startup_timeout_secs == other.startup_timeout_secs
            && self.tool_timeout_secs == other.tool_timeout_secs
    }
}

/// Transport-specific server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TransportConfig {
    /// Child process speaking line-delimited JSON-RPC on stdio
    #[serde(rename = "stdio")]
    Stdio(StdioServerConfig),

    /// Remote endpoint speaking streamable-HTTP JSON-RPC
    #[serde(rename = "streamable-http")]
    StreamableHttp(HttpServerConfig),
}

/// Settings for a stdio child process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioServerConfig {
    /// Executable path or name resolved via PATH
    pub command: String,

    /// Argument vector
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory; inherited when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Environment additions merged over the gateway's own environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Settings for a streamable-HTTP endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpServerConfig {
    /// Base URL requests are POSTed to
    pub url: String,

    /// Environment variable whose value is sent as a bearer token
    #[serde(rename = "bearerTokenEnvVar", skip_serializing_if = "Option::is_none")]
    pub bearer_token_env_var: Option<String>,

    /// Scopes requested during the OAuth flow
    #[serde(default, rename = "oauthScopes")]
    pub oauth_scopes: Vec<String>,

    /// Static headers added verbatim to every request
    #[serde(default, rename = "httpHeaders")]
    pub http_headers: BTreeMap<String, String>,

    /// Headers whose value is read from an environment variable per request
    #[serde(default, rename = "envHttpHeaders")]
    pub env_http_headers: BTreeMap<String, String>,
}

/// A named subset of servers with its own permission policy
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Ordered member server names
    #[serde(default)]
    pub servers: Vec<String>,

    /// When true, tools with no explicit permission are denied
    #[serde(default, rename = "denyByDefault")]
    pub deny_by_default: bool,
}

/// Explicit permission override for one tool in one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPermission {
    /// Namespace the override applies in
    pub namespace: String,

    /// Server exporting the tool
    pub server: String,

    /// Unqualified tool name as the downstream advertises it
    #[serde(rename = "toolName")]
    pub tool_name: String,

    /// Allow (`true`) or deny (`false`)
    pub enabled: bool,
}

/// Where OAuth tokens are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStoreMode {
    /// Prefer the OS keychain, fall back to the encrypted file
    #[default]
    Auto,
    /// OS keychain only
    Keyring,
    /// Encrypted file only
    File,
}

/// Validate a server or namespace name: non-empty and free of the `.`
/// qualification separator.
pub fn validate_name(name: &str) -> ConfigResult<()> {
    if name.is_empty() {
        return Err(ConfigError::InvalidName("name must not be empty".into()));
    }
    if name.contains('.') {
        return Err(ConfigError::InvalidName(format!(
            "'{name}' must not contain '.'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_rejects_empty_and_dotted() {
        assert!(validate_name("fs").is_ok());
        assert!(validate_name("my-server_2").is_ok());
        assert!(matches!(validate_name(""), Err(ConfigError::InvalidName(_))));
        assert!(matches!(
            validate_name("a.b"),
            Err(ConfigError::InvalidName(_))
        ));
    }

    #[test]
    fn serde_round_trip_preserves_document() {
        let mut config = GatewayConfig::default();
        config
            .servers
            .insert("fs".into(), ServerConfig::stdio("mcp-fs", vec!["--root".into(), "/".into()]));
        let mut http = ServerConfig::streamable_http("https://mcp.example.com/mcp");
        if let TransportConfig::StreamableHttp(ref mut h) = http.transport {
            h.oauth_scopes = vec!["read".into()];
            h.http_headers.insert("X-Tenant".into(), "t1".into());
        }
        config.servers.insert("remote".into(), http);
        config.namespaces.insert(
            "prod".into(),
            NamespaceConfig {
                description: "production".into(),
                servers: vec!["fs".into(), "remote".into()],
                deny_by_default: true,
            },
        );
        config.tool_permissions.push(ToolPermission {
            namespace: "prod".into(),
            server: "fs".into(),
            tool_name: "read_file".into(),
            enabled: true,
        });
        config.default_namespace = Some("prod".into());

        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn kind_tag_is_serialized() {
        let server = ServerConfig::stdio("echo", vec![]);
        let value = serde_json::to_value(&server).unwrap();
        assert_eq!(value["kind"], "stdio");

        let server = ServerConfig::streamable_http("https://example.com");
        let value = serde_json::to_value(&server).unwrap();
        assert_eq!(value["kind"], "streamable-http");
    }

    #[test]
    fn oauth_keys_use_legacy_names() {
        let mut config = GatewayConfig::default();
        config.credentials_store = CredentialStoreMode::Keyring;
        config.oauth_callback_port = Some(8675);
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["mcp_oauth_credentials_store"], "keyring");
        assert_eq!(value["mcp_oauth_callback_port"], 8675);
        assert_eq!(value["schemaVersion"], SCHEMA_VERSION);
    }

    #[test]
    fn callback_port_zero_is_rejected() {
        let mut config = GatewayConfig::default();
        config.oauth_callback_port = Some(0);
        assert!(config.validate().is_err());
        config.oauth_callback_port = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn dangling_references_fail_validation() {
        let mut config = GatewayConfig::default();
        config.namespaces.insert(
            "ns".into(),
            NamespaceConfig {
                servers: vec!["ghost".into()],
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn permission_lookup_respects_deny_by_default() {
        let mut config = GatewayConfig::default();
        config
            .servers
            .insert("fs".into(), ServerConfig::stdio("mcp-fs", vec![]));
        config.namespaces.insert(
            "prod".into(),
            NamespaceConfig {
                servers: vec!["fs".into()],
                deny_by_default: true,
                ..Default::default()
            },
        );

        assert!(!config.tool_allowed("prod", "fs", "read_file"));
        config.tool_permissions.push(ToolPermission {
            namespace: "prod".into(),
            server: "fs".into(),
            tool_name: "read_file".into(),
            enabled: true,
        });
        assert!(config.tool_allowed("prod", "fs", "read_file"));
    }

    #[test]
    fn runtime_params_ignore_enabled_and_autostart() {
        let a = ServerConfig::stdio("echo", vec!["x".into()]);
        let mut b = a.clone();
        b.enabled = Some(false);
        b.autostart = true;
        assert!(a.runtime_params_eq(&b));

        let mut c = a.clone();
        if let TransportConfig::Stdio(ref mut s) = c.transport {
            s.args.push("y".into());
        }
        assert!(!a.runtime_params_eq(&c));
    }
}
