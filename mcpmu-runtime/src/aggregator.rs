//! Tool aggregation and request routing
//!
//! The aggregator holds the active namespace and presents its members' tools
//! as one list under `serverName.toolName` qualified names. Because server
//! names cannot contain `.`, splitting a qualified name on the *first* dot
//! is unambiguous even for tools whose own names contain dots
//! (`myfs.fs.read_file` → server `myfs`, tool `fs.read_file`).
//!
//! Listing draws from running clients when possible and from the persistent
//! cache otherwise, so a stopped server's tools stay visible until it is
//! removed. Calls enforce the namespace permission policy before any
//! downstream traffic happens.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;

use mcpmu_cache::ToolCache;
use mcpmu_config::{ConfigStore, GatewayConfig};
use mcpmu_mcp::server::{GatewayHandler, RouterError};
use mcpmu_mcp::Tool;

use crate::error::RuntimeError;
use crate::supervisor::Supervisor;

/// Name of the implicit all-servers namespace used when nothing else
/// resolves
pub const FALLBACK_NAMESPACE: &str = "default";

/// The aggregating router; implements the facade's [`GatewayHandler`].
pub struct Aggregator {
    config: Arc<RwLock<ConfigStore>>,
    supervisor: Supervisor,
    cache: Arc<ToolCache>,
    active_namespace: std::sync::RwLock<String>,
}

impl Aggregator {
    pub fn new(
        config: Arc<RwLock<ConfigStore>>,
        supervisor: Supervisor,
        cache: Arc<ToolCache>,
        namespace: String,
    ) -> Self {
        Self {
            config,
            supervisor,
            cache,
            active_namespace: std::sync::RwLock::new(namespace),
        }
    }

    /// Resolution order: explicit flag, config default, the single
    /// configured namespace, the implicit all-servers view.
    pub fn resolve_default_namespace(config: &GatewayConfig, flag: Option<&str>) -> String {
        if let Some(flag) = flag {
            return flag.to_string();
        }
        if let Some(default) = &config.default_namespace {
            return default.clone();
        }
        if config.namespaces.len() == 1 {
            if let Some(name) = config.namespaces.keys().next() {
                return name.clone();
            }
        }
        FALLBACK_NAMESPACE.to_string()
    }

    /// The currently exported namespace.
    pub fn active_namespace(&self) -> String {
        self.active_namespace
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolve a possibly-qualified tool argument for `permission_set`.
    ///
    /// `server.tool` input is accepted when the prefix names `server`
    /// itself; a prefix naming a *different* configured server is an error
    /// rather than a silent correction. Anything else is taken verbatim,
    /// since tool names may legitimately contain dots.
    fn normalize_permission_tool(
        config: &GatewayConfig,
        server: &str,
        tool: &str,
    ) -> Result<String, RouterError> {
        if let Some((prefix, rest)) = tool.split_once('.') {
            if prefix == server {
                return Ok(rest.to_string());
            }
            if config.servers.contains_key(prefix) {
                return Err(RouterError::InvalidParams(format!(
                    "tool '{tool}' is qualified with server '{prefix}' but --server is '{server}'"
                )));
            }
        }
        Ok(tool.to_string())
    }

    fn map_err(err: RuntimeError) -> RouterError {
        match err {
            RuntimeError::NotFound(name) => RouterError::NotFound(format!("not found: {name}")),
            RuntimeError::Disabled(name) => {
                RouterError::NotFound(format!("server '{name}' is disabled"))
            }
            other => RouterError::Internal(other.to_string()),
        }
    }
}

#[async_trait]
impl GatewayHandler for Aggregator {
    async fn list_tools(&self) -> Vec<Tool> {
        let config = self.config.read().await.snapshot();
        let namespace = self.active_namespace();

        let mut members = config.namespace_members(&namespace);
        members.sort();
        members.dedup();

        let mut tools = Vec::new();
        for server in members {
            let Some(server_cfg) = config.servers.get(&server) else {
                continue;
            };
            if !server_cfg.is_enabled() {
                continue;
            }

            // Running servers answer live; everything else serves the cache.
            let server_tools: Vec<Tool> = match self.supervisor.tools(&server).await {
                Some(live) => live,
                None => match self.cache.get(&server).await {
                    Some(cached) => cached
                        .into_iter()
                        .map(|t| Tool::new(t.name, t.description, t.input_schema))
                        .collect(),
                    None => continue,
                },
            };

            for tool in server_tools {
                if !config.tool_allowed(&namespace, &server, &tool.name) {
                    continue;
                }
                tools.push(Tool::new(
                    format!("{server}.{}", tool.name),
                    format!("[{server}] {}", tool.description),
                    tool.input_schema,
                ));
            }
        }
        tools
    }

    async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, RouterError> {
        let Some((server, tool)) = qualified_name.split_once('.') else {
            return Err(RouterError::NotFound(format!(
                "tool name '{qualified_name}' is not qualified as server.tool"
            )));
        };
        let namespace = self.active_namespace();
        let (deadline, allowed) = {
            let config = self.config.read().await;
            let config = config.config();

            let members = config.namespace_members(&namespace);
            if !members.iter().any(|m| m == server) {
                return Err(RouterError::NotFound(format!(
                    "server '{server}' is not in namespace '{namespace}'"
                )));
            }
            let Some(server_cfg) = config.servers.get(server) else {
                return Err(RouterError::NotFound(format!("unknown server '{server}'")));
            };
            if !server_cfg.is_enabled() {
                return Err(RouterError::NotFound(format!(
                    "server '{server}' is disabled"
                )));
            }
            (
                server_cfg.tool_timeout(),
                config.tool_allowed(&namespace, server, tool),
            )
        };
        if !allowed {
            return Err(RouterError::PermissionDenied(format!(
                "tool '{tool}' on server '{server}' is denied in namespace '{namespace}'"
            )));
        }

        debug!(server, tool, "routing tool call");
        self.supervisor
            .call_tool(server, tool, arguments, deadline)
            .await
            .map_err(Self::map_err)
    }

    async fn servers_list(&self) -> Result<Value, RouterError> {
        let config = self.config.read().await.snapshot();
        let statuses = self.supervisor.statuses();
        let list: Vec<Value> = statuses
            .into_iter()
            .map(|status| {
                let enabled = config
                    .servers
                    .get(&status.name)
                    .map(|s| s.is_enabled())
                    .unwrap_or(false);
                let mut value = serde_json::to_value(&status).unwrap_or_else(|_| json!({}));
                if let Some(object) = value.as_object_mut() {
                    object.insert("enabled".to_string(), json!(enabled));
                }
                value
            })
            .collect();
        Ok(Value::Array(list))
    }

    async fn server_start(&self, name: &str) -> Result<Value, RouterError> {
        self.supervisor.start(name).await.map_err(Self::map_err)?;
        Ok(json!({"name": name, "state": "running"}))
    }

    async fn server_stop(&self, name: &str) -> Result<Value, RouterError> {
        self.supervisor.stop(name).await.map_err(Self::map_err)?;
        Ok(json!({"name": name, "state": "stopped"}))
    }

    async fn namespace_set(&self, name: &str) -> Result<Value, RouterError> {
        {
            let config = self.config.read().await;
            if !config.config().namespaces.contains_key(name) && name != FALLBACK_NAMESPACE {
                return Err(RouterError::NotFound(format!("unknown namespace '{name}'")));
            }
        }
        *self
            .active_namespace
            .write()
            .unwrap_or_else(|e| e.into_inner()) = name.to_string();
        debug!(namespace = name, "active namespace switched");
        Ok(json!({"namespace": name}))
    }

    async fn permission_set(
        &self,
        namespace: Option<&str>,
        server: &str,
        tool: &str,
        enabled: bool,
    ) -> Result<Value, RouterError> {
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| self.active_namespace());
        let mut config = self.config.write().await;
        let tool = Self::normalize_permission_tool(config.config(), server, tool)?;
        config
            .set_tool_permission(&namespace, server, &tool, enabled)
            .map_err(|err| match err {
                mcpmu_config::ConfigError::NotFound(name) => {
                    RouterError::NotFound(format!("not found: {name}"))
                }
                other => RouterError::Internal(other.to_string()),
            })?;
        config
            .save()
            .map_err(|err| RouterError::Internal(err.to_string()))?;
        Ok(json!({
            "namespace": namespace,
            "server": server,
            "tool": tool,
            "enabled": enabled
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpmu_auth::{AuthResult, CredentialStore, TokenRecord};
    use mcpmu_cache::ToolInfo;
    use mcpmu_config::{NamespaceConfig, ServerConfig};
    use mcpmu_events::EventBus;
    use tempfile::TempDir;

    struct NullStore;

    #[async_trait]
    impl CredentialStore for NullStore {
        async fn get(&self, _server_url: &str) -> AuthResult<Option<TokenRecord>> {
            Ok(None)
        }
        async fn put(&self, _server_url: &str, _record: &TokenRecord) -> AuthResult<()> {
            Ok(())
        }
        async fn delete(&self, _server_url: &str) -> AuthResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        aggregator: Aggregator,
        cache: Arc<ToolCache>,
        _dir: TempDir,
    }

    async fn fixture(mutate: impl FnOnce(&mut ConfigStore)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut store = ConfigStore::load(dir.path().join("config.json")).unwrap();
        mutate(&mut store);

        let bus = EventBus::new();
        let cache = Arc::new(ToolCache::in_memory());
        let supervisor = Supervisor::new(bus.clone(), Arc::clone(&cache), Arc::new(NullStore));
        supervisor.sync_config(store.config()).await;

        let namespace = Aggregator::resolve_default_namespace(store.config(), None);
        let aggregator = Aggregator::new(
            Arc::new(RwLock::new(store)),
            supervisor,
            Arc::clone(&cache),
            namespace,
        );
        Fixture {
            aggregator,
            cache,
            _dir: dir,
        }
    }

    fn quick_stdio(command: &str) -> ServerConfig {
        let mut config = ServerConfig::stdio(command, vec![]);
        config.startup_timeout_secs = Some(1);
        config
    }

    fn tool(name: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: format!("does {name}"),
            input_schema: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn lists_cached_tools_with_qualified_names() {
        let f = fixture(|store| {
            store.add_server("myfs", quick_stdio("cat")).unwrap();
        })
        .await;
        f.cache.update("myfs", &[tool("fs.read_file")]).await;

        let tools = f.aggregator.list_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "myfs.fs.read_file");
        assert_eq!(tools[0].description, "[myfs] does fs.read_file");
    }

    #[tokio::test]
    async fn list_is_ordered_by_server_name() {
        let f = fixture(|store| {
            store.add_server("zeta", quick_stdio("cat")).unwrap();
            store.add_server("alpha", quick_stdio("cat")).unwrap();
        })
        .await;
        f.cache.update("zeta", &[tool("b"), tool("a")]).await;
        f.cache.update("alpha", &[tool("z")]).await;

        let names: Vec<String> = f
            .aggregator
            .list_tools()
            .await
            .into_iter()
            .map(|t| t.name)
            .collect();
        // Servers sorted by name, tools in original downstream order.
        assert_eq!(names, vec!["alpha.z", "zeta.b", "zeta.a"]);
    }

    #[tokio::test]
    async fn disabled_servers_are_omitted() {
        let f = fixture(|store| {
            store.add_server("off", quick_stdio("cat")).unwrap();
            store.set_server_enabled("off", false).unwrap();
        })
        .await;
        f.cache.update("off", &[tool("t")]).await;

        assert!(f.aggregator.list_tools().await.is_empty());
    }

    #[tokio::test]
    async fn deny_by_default_hides_and_blocks_tools() {
        let f = fixture(|store| {
            store.add_server("fs", quick_stdio("cat")).unwrap();
            store
                .add_namespace(
                    "prod",
                    NamespaceConfig {
                        servers: vec!["fs".to_string()],
                        deny_by_default: true,
                        ..Default::default()
                    },
                )
                .unwrap();
            store.set_default_namespace(Some("prod")).unwrap();
        })
        .await;
        f.cache.update("fs", &[tool("read_file")]).await;

        assert_eq!(f.aggregator.active_namespace(), "prod");
        assert!(f.aggregator.list_tools().await.is_empty());

        let err = f.aggregator.call_tool("fs.read_file", None).await.unwrap_err();
        assert!(matches!(err, RouterError::PermissionDenied(_)));

        // An explicit allow flips both listing and calling.
        f.aggregator
            .permission_set(Some("prod"), "fs", "read_file", true)
            .await
            .unwrap();
        let tools = f.aggregator.list_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "fs.read_file");
    }

    #[tokio::test]
    async fn call_splits_on_first_dot_only() {
        let f = fixture(|store| {
            store.add_server("myfs", quick_stdio("cat")).unwrap();
        })
        .await;

        // `cat` is not an MCP server, so the lazy start fails; reaching an
        // Internal error (rather than NotFound) proves the name resolved to
        // server `myfs` and tool `fs.read_file`.
        let err = f
            .aggregator
            .call_tool("myfs.fs.read_file", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Internal(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn unknown_targets_are_not_found() {
        let f = fixture(|_| {}).await;
        assert!(matches!(
            f.aggregator.call_tool("ghost.tool", None).await.unwrap_err(),
            RouterError::NotFound(_)
        ));
        assert!(matches!(
            f.aggregator.call_tool("unqualified", None).await.unwrap_err(),
            RouterError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn out_of_namespace_server_is_not_found() {
        let f = fixture(|store| {
            store.add_server("fs", quick_stdio("cat")).unwrap();
            store.add_server("other", quick_stdio("cat")).unwrap();
            store
                .add_namespace(
                    "prod",
                    NamespaceConfig {
                        servers: vec!["fs".to_string()],
                        ..Default::default()
                    },
                )
                .unwrap();
            store.set_default_namespace(Some("prod")).unwrap();
        })
        .await;

        let err = f.aggregator.call_tool("other.t", None).await.unwrap_err();
        assert!(matches!(err, RouterError::NotFound(_)));
    }

    #[tokio::test]
    async fn namespace_set_validates_and_switches() {
        let f = fixture(|store| {
            store.add_server("fs", quick_stdio("cat")).unwrap();
            store
                .add_namespace("prod", NamespaceConfig::default())
                .unwrap();
        })
        .await;

        assert!(matches!(
            f.aggregator.namespace_set("ghost").await.unwrap_err(),
            RouterError::NotFound(_)
        ));
        f.aggregator.namespace_set("prod").await.unwrap();
        assert_eq!(f.aggregator.active_namespace(), "prod");
    }

    #[test]
    fn default_namespace_resolution_order() {
        let mut config = GatewayConfig::default();
        assert_eq!(
            Aggregator::resolve_default_namespace(&config, Some("cli")),
            "cli"
        );
        assert_eq!(
            Aggregator::resolve_default_namespace(&config, None),
            FALLBACK_NAMESPACE
        );

        config
            .namespaces
            .insert("only".to_string(), NamespaceConfig::default());
        assert_eq!(Aggregator::resolve_default_namespace(&config, None), "only");

        config
            .namespaces
            .insert("second".to_string(), NamespaceConfig::default());
        assert_eq!(
            Aggregator::resolve_default_namespace(&config, None),
            FALLBACK_NAMESPACE
        );

        config.default_namespace = Some("second".to_string());
        assert_eq!(
            Aggregator::resolve_default_namespace(&config, None),
            "second"
        );
    }

    #[tokio::test]
    async fn qualified_permission_input_with_wrong_server_errors() {
        let f = fixture(|store| {
            store.add_server("a", quick_stdio("cat")).unwrap();
            store.add_server("b", quick_stdio("cat")).unwrap();
            store
                .add_namespace(
                    "ns",
                    NamespaceConfig {
                        servers: vec!["a".to_string(), "b".to_string()],
                        ..Default::default()
                    },
                )
                .unwrap();
        })
        .await;

        // Prefix matches --server: stripped.
        let result = f
            .aggregator
            .permission_set(Some("ns"), "a", "a.read", true)
            .await
            .unwrap();
        assert_eq!(result["tool"], "read");

        // Prefix names a different configured server: rejected.
        let err = f
            .aggregator
            .permission_set(Some("ns"), "a", "b.read", true)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidParams(_)));

        // Prefix that is no server at all is part of the tool name.
        let result = f
            .aggregator
            .permission_set(Some("ns"), "a", "fs.read_file", true)
            .await
            .unwrap();
        assert_eq!(result["tool"], "fs.read_file");
    }
}
