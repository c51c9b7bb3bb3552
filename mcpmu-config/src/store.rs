//! Transactional configuration store
//!
//! [`ConfigStore`] owns the in-memory [`GatewayConfig`] plus its file path.
//! Mutations are applied to a scratch copy, validated, and only then
//! committed, so every failed call leaves the live document untouched.
//! Saving goes through a 0600 temp file renamed over the target.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::model::{
    validate_name, CredentialStoreMode, GatewayConfig, NamespaceConfig, ServerConfig,
    ToolPermission,
};

/// Owns the configuration document and its on-disk location.
#[derive(Debug)]
pub struct ConfigStore {
    config: GatewayConfig,
    path: PathBuf,
}

impl ConfigStore {
    /// Load from `path`, or start from an empty document when the file does
    /// not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let path = path.into();
        let config = match fs::read_to_string(&path) {
            Ok(content) => {
                let config: GatewayConfig = serde_json::from_str(&content)?;
                config.validate()?;
                config
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file yet, starting empty");
                GatewayConfig::default()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self { config, path })
    }

    /// Wrap an already-validated document (used by the reload watcher).
    pub fn from_parts(config: GatewayConfig, path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            path: path.into(),
        }
    }

    /// Read access to the live document.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Cloned snapshot for consumers that outlive the borrow.
    pub fn snapshot(&self) -> GatewayConfig {
        self.config.clone()
    }

    /// Path of the config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the live document wholesale (hot reload).
    pub fn replace(&mut self, config: GatewayConfig) -> ConfigResult<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Persist the document atomically with file mode 0600.
    pub fn save(&self) -> ConfigResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.config)?;
        write_private_atomic(&self.path, json.as_bytes())?;
        debug!(path = %self.path.display(), "config saved");
        Ok(())
    }

    /// Apply a mutation transactionally: scratch copy, validate, commit.
    fn transact<F>(&mut self, mutate: F) -> ConfigResult<()>
    where
        F: FnOnce(&mut GatewayConfig) -> ConfigResult<()>,
    {
        let mut next = self.config.clone();
        mutate(&mut next)?;
        next.validate()?;
        self.config = next;
        Ok(())
    }

    // === Server mutations ===

    /// Add a new server. Fails with `NameExists` on duplicates.
    pub fn add_server(&mut self, name: &str, server: ServerConfig) -> ConfigResult<()> {
        validate_name(name)?;
        self.transact(|config| {
            if config.servers.contains_key(name) {
                return Err(ConfigError::NameExists(name.to_string()));
            }
            config.servers.insert(name.to_string(), server);
            Ok(())
        })
    }

    /// Replace an existing server definition.
    pub fn update_server(&mut self, name: &str, server: ServerConfig) -> ConfigResult<()> {
        self.transact(|config| {
            if !config.servers.contains_key(name) {
                return Err(ConfigError::NotFound(name.to_string()));
            }
            config.servers.insert(name.to_string(), server);
            Ok(())
        })
    }

    /// Delete a server and purge every namespace membership and permission
    /// referencing it, in one transaction.
    pub fn delete_server(&mut self, name: &str) -> ConfigResult<()> {
        self.transact(|config| {
            if config.servers.remove(name).is_none() {
                return Err(ConfigError::NotFound(name.to_string()));
            }
            for ns in config.namespaces.values_mut() {
                ns.servers.retain(|s| s != name);
            }
            config.tool_permissions.retain(|p| p.server != name);
            Ok(())
        })
    }

    /// Rename a server, rewriting every reference before returning.
    pub fn rename_server(&mut self, old: &str, new: &str) -> ConfigResult<()> {
        validate_name(new)?;
        self.transact(|config| {
            if config.servers.contains_key(new) {
                return Err(ConfigError::NameExists(new.to_string()));
            }
            let server = config
                .servers
                .remove(old)
                .ok_or_else(|| ConfigError::NotFound(old.to_string()))?;
            config.servers.insert(new.to_string(), server);
            for ns in config.namespaces.values_mut() {
                for member in ns.servers.iter_mut() {
                    if member == old {
                        *member = new.to_string();
                    }
                }
            }
            for perm in config.tool_permissions.iter_mut() {
                if perm.server == old {
                    perm.server = new.to_string();
                }
            }
            Ok(())
        })?;
        info!(old, new, "server renamed");
        Ok(())
    }

    /// Toggle the enabled flag without touching the rest of the definition.
    pub fn set_server_enabled(&mut self, name: &str, enabled: bool) -> ConfigResult<()> {
        self.transact(|config| {
            let server = config
                .servers
                .get_mut(name)
                .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
            server.enabled = if enabled { None } else { Some(false) };
            Ok(())
        })
    }

    // === Namespace mutations ===

    /// Add a new namespace.
    pub fn add_namespace(&mut self, name: &str, namespace: NamespaceConfig) -> ConfigResult<()> {
        validate_name(name)?;
        self.transact(|config| {
            if config.namespaces.contains_key(name) {
                return Err(ConfigError::NameExists(name.to_string()));
            }
            config.namespaces.insert(name.to_string(), namespace);
            Ok(())
        })
    }

    /// Delete a namespace; cascades to its permissions and clears the
    /// default-namespace pointer if it referenced it.
    pub fn delete_namespace(&mut self, name: &str) -> ConfigResult<()> {
        self.transact(|config| {
            if config.namespaces.remove(name).is_none() {
                return Err(ConfigError::NotFound(name.to_string()));
            }
            config.tool_permissions.retain(|p| p.namespace != name);
            if config.default_namespace.as_deref() == Some(name) {
                config.default_namespace = None;
            }
            Ok(())
        })
    }

    /// Rename a namespace, rewriting permissions and the default pointer.
    pub fn rename_namespace(&mut self, old: &str, new: &str) -> ConfigResult<()> {
        validate_name(new)?;
        self.transact(|config| {
            if config.namespaces.contains_key(new) {
                return Err(ConfigError::NameExists(new.to_string()));
            }
            let ns = config
                .namespaces
                .remove(old)
                .ok_or_else(|| ConfigError::NotFound(old.to_string()))?;
            config.namespaces.insert(new.to_string(), ns);
            for perm in config.tool_permissions.iter_mut() {
                if perm.namespace == old {
                    perm.namespace = new.to_string();
                }
            }
            if config.default_namespace.as_deref() == Some(old) {
                config.default_namespace = Some(new.to_string());
            }
            Ok(())
        })
    }

    /// Add a server to a namespace's member list. Idempotent.
    pub fn assign_server(&mut self, namespace: &str, server: &str) -> ConfigResult<()> {
        self.transact(|config| {
            if !config.servers.contains_key(server) {
                return Err(ConfigError::NotFound(server.to_string()));
            }
            let ns = config
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| ConfigError::NotFound(namespace.to_string()))?;
            if !ns.servers.iter().any(|s| s == server) {
                ns.servers.push(server.to_string());
            }
            Ok(())
        })
    }

    /// Remove a server from a namespace's member list.
    pub fn unassign_server(&mut self, namespace: &str, server: &str) -> ConfigResult<()> {
        self.transact(|config| {
            let ns = config
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| ConfigError::NotFound(namespace.to_string()))?;
            let before = ns.servers.len();
            ns.servers.retain(|s| s != server);
            if ns.servers.len() == before {
                return Err(ConfigError::NotFound(server.to_string()));
            }
            Ok(())
        })
    }

    /// Set the deny-by-default policy of a namespace.
    pub fn set_deny_by_default(&mut self, namespace: &str, deny: bool) -> ConfigResult<()> {
        self.transact(|config| {
            let ns = config
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| ConfigError::NotFound(namespace.to_string()))?;
            ns.deny_by_default = deny;
            Ok(())
        })
    }

    /// Set or clear the default namespace.
    pub fn set_default_namespace(&mut self, namespace: Option<&str>) -> ConfigResult<()> {
        self.transact(|config| {
            if let Some(ns) = namespace {
                if !config.namespaces.contains_key(ns) {
                    return Err(ConfigError::NotFound(ns.to_string()));
                }
            }
            config.default_namespace = namespace.map(str::to_string);
            Ok(())
        })
    }

    // === Permission mutations ===

    /// Set an explicit tool permission override; replaces an existing entry
    /// for the same (namespace, server, tool) triple.
    pub fn set_tool_permission(
        &mut self,
        namespace: &str,
        server: &str,
        tool: &str,
        enabled: bool,
    ) -> ConfigResult<()> {
        self.transact(|config| {
            if !config.namespaces.contains_key(namespace) {
                return Err(ConfigError::NotFound(namespace.to_string()));
            }
            if !config.servers.contains_key(server) {
                return Err(ConfigError::NotFound(server.to_string()));
            }
            config.tool_permissions.retain(|p| {
                !(p.namespace == namespace && p.server == server && p.tool_name == tool)
            });
            config.tool_permissions.push(ToolPermission {
                namespace: namespace.to_string(),
                server: server.to_string(),
                tool_name: tool.to_string(),
                enabled,
            });
            Ok(())
        })
    }

    /// Remove an explicit override, reverting to the namespace default.
    pub fn unset_tool_permission(
        &mut self,
        namespace: &str,
        server: &str,
        tool: &str,
    ) -> ConfigResult<()> {
        self.transact(|config| {
            let before = config.tool_permissions.len();
            config.tool_permissions.retain(|p| {
                !(p.namespace == namespace && p.server == server && p.tool_name == tool)
            });
            if config.tool_permissions.len() == before {
                return Err(ConfigError::NotFound(format!("{namespace}/{server}/{tool}")));
            }
            Ok(())
        })
    }

    // === Gateway defaults ===

    /// Select the credential-store backend.
    pub fn set_credentials_store(&mut self, mode: CredentialStoreMode) -> ConfigResult<()> {
        self.transact(|config| {
            config.credentials_store = mode;
            Ok(())
        })
    }

    /// Set the fixed OAuth callback port, or `None` for ephemeral.
    pub fn set_oauth_callback_port(&mut self, port: Option<u16>) -> ConfigResult<()> {
        self.transact(|config| {
            config.oauth_callback_port = port;
            Ok(())
        })
    }
}

/// Write `contents` to `path` via a same-directory temp file with mode 0600,
/// fsync, and rename.
pub(crate) fn write_private_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
