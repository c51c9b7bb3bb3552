//! Tool permission management

use std::path::Path;

use anyhow::{bail, Result};

use mcpmu_config::GatewayConfig;

use crate::cli::PermissionAction;
use crate::commands::open_store;

pub fn set(
    config_path: Option<&Path>,
    namespace: &str,
    server: &str,
    tool: &str,
    action: PermissionAction,
) -> Result<()> {
    let mut store = open_store(config_path)?;
    let tool = normalize_tool(store.config(), server, tool)?;
    let enabled = matches!(action, PermissionAction::Allow);
    store.set_tool_permission(namespace, server, &tool, enabled)?;
    store.save()?;
    println!(
        "{} '{server}.{tool}' in '{namespace}'",
        if enabled { "allowed" } else { "denied" }
    );
    Ok(())
}

pub fn unset(config_path: Option<&Path>, namespace: &str, server: &str, tool: &str) -> Result<()> {
    let mut store = open_store(config_path)?;
    let tool = normalize_tool(store.config(), server, tool)?;
    store.unset_tool_permission(namespace, server, &tool)?;
    store.save()?;
    println!("cleared override for '{server}.{tool}' in '{namespace}'");
    Ok(())
}

pub fn list(config_path: Option<&Path>, namespace: Option<&str>) -> Result<()> {
    let store = open_store(config_path)?;
    let permissions: Vec<_> = store
        .config()
        .tool_permissions
        .iter()
        .filter(|p| namespace.is_none_or(|ns| p.namespace == ns))
        .collect();
    if permissions.is_empty() {
        println!("no explicit permissions");
        return Ok(());
    }
    for perm in permissions {
        println!(
            "{}  {}.{}  {}",
            perm.namespace,
            perm.server,
            perm.tool_name,
            if perm.enabled { "allow" } else { "deny" }
        );
    }
    Ok(())
}

/// Accept `server.tool` qualified input when the prefix matches `server`;
/// reject a prefix naming a different configured server instead of silently
/// correcting it. A dotted name whose prefix is no server at all is a plain
/// tool name.
fn normalize_tool(config: &GatewayConfig, server: &str, tool: &str) -> Result<String> {
    if let Some((prefix, rest)) = tool.split_once('.') {
        if prefix == server {
            return Ok(rest.to_string());
        }
        if config.servers.contains_key(prefix) {
            bail!(
                "tool '{tool}' is qualified with server '{prefix}', but the server argument is '{server}'"
            );
        }
    }
    Ok(tool.to_string())
}
