//! Server add/remove/rename/list

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Result};

use mcpmu_cache::ToolCache;
use mcpmu_config::{HttpServerConfig, ServerConfig, StdioServerConfig, TransportConfig};

use crate::cli::AddArgs;
use crate::commands::{open_store, parse_key_value};

pub fn add(config_path: Option<&Path>, args: AddArgs) -> Result<()> {
    let mut store = open_store(config_path)?;

    let transport = if let Some(url) = args.url {
        if !args.command.is_empty() {
            bail!("--url and a stdio command are mutually exclusive");
        }
        let mut http_headers = BTreeMap::new();
        for header in &args.headers {
            let (name, value) = parse_key_value(header)?;
            http_headers.insert(name, value);
        }
        let mut env_http_headers = BTreeMap::new();
        for header in &args.env_headers {
            let (name, env_var) = parse_key_value(header)?;
            env_http_headers.insert(name, env_var);
        }
        TransportConfig::StreamableHttp(HttpServerConfig {
            url,
            bearer_token_env_var: args.bearer_env,
            oauth_scopes: args.scopes,
            http_headers,
            env_http_headers,
        })
    } else {
        let Some((command, command_args)) = args.command.split_first() else {
            bail!("a stdio server needs a command after `--` (or pass --url)");
        };
        let mut env = BTreeMap::new();
        for entry in &args.env {
            let (key, value) = parse_key_value(entry)?;
            env.insert(key, value);
        }
        TransportConfig::Stdio(StdioServerConfig {
            command: command.clone(),
            args: command_args.to_vec(),
            cwd: args.cwd,
            env,
        })
    };

    let server = ServerConfig {
        transport,
        enabled: None,
        autostart: args.autostart,
        startup_timeout_secs: args.startup_timeout,
        tool_timeout_secs: args.tool_timeout,
    };
    store.add_server(&args.name, server)?;
    store.save()?;
    println!("added server '{}'", args.name);
    Ok(())
}

pub async fn remove(config_path: Option<&Path>, name: &str) -> Result<()> {
    let mut store = open_store(config_path)?;
    store.delete_server(name)?;
    store.save()?;

    if let Some(dir) = store.path().parent() {
        let cache = ToolCache::load(dir);
        cache.delete(name).await;
        cache.save().await;
    }
    println!("removed server '{name}'");
    Ok(())
}

pub async fn rename(config_path: Option<&Path>, old: &str, new: &str) -> Result<()> {
    let mut store = open_store(config_path)?;
    store.rename_server(old, new)?;
    store.save()?;

    // The cache keys token counts by server name; migrate before reporting
    // success so no reference to the old name survives.
    if let Some(dir) = store.path().parent() {
        let cache = ToolCache::load(dir);
        cache.rename(old, new).await;
        cache.save().await;
    }
    println!("renamed server '{old}' to '{new}'");
    Ok(())
}

pub async fn list(config_path: Option<&Path>) -> Result<()> {
    let store = open_store(config_path)?;
    let config = store.config();
    if config.servers.is_empty() {
        println!("no servers configured");
        return Ok(());
    }

    let cache = store.path().parent().map(ToolCache::load);
    for (name, server) in &config.servers {
        let kind = match &server.transport {
            TransportConfig::Stdio(s) => format!("stdio: {} {}", s.command, s.args.join(" ")),
            TransportConfig::StreamableHttp(h) => format!("streamable-http: {}", h.url),
        };
        let mut flags = Vec::new();
        if !server.is_enabled() {
            flags.push("disabled");
        }
        if server.autostart {
            flags.push("autostart");
        }
        let tools = match &cache {
            Some(cache) => {
                let tools = cache.tool_count(name).await;
                let tokens: usize = cache
                    .get(name)
                    .await
                    .map(|ts| ts.iter().map(|t| t.token_count).sum())
                    .unwrap_or(0);
                format!("{tools} tools, {tokens} tokens")
            }
            None => "no cache".to_string(),
        };
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!("{name}  {kind}  ({tools}){flags}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn add_args(name: &str, command: &[&str]) -> AddArgs {
        AddArgs {
            name: name.to_string(),
            url: None,
            cwd: None,
            env: vec![],
            autostart: false,
            startup_timeout: None,
            tool_timeout: None,
            scopes: vec![],
            bearer_env: None,
            headers: vec![],
            env_headers: vec![],
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn add_then_remove_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        add(Some(&path), add_args("fs", &["echo", "hello"])).unwrap();
        let store = open_store(Some(&path)).unwrap();
        assert!(store.config().servers.contains_key("fs"));

        remove(Some(&path), "fs").await.unwrap();
        let store = open_store(Some(&path)).unwrap();
        assert!(store.config().servers.is_empty());
    }

    #[tokio::test]
    async fn add_requires_command_or_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        assert!(add(Some(&path), add_args("fs", &[])).is_err());
    }

    #[tokio::test]
    async fn rename_rejects_dotted_target() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        add(Some(&path), add_args("old", &["cat"])).unwrap();
        assert!(rename(Some(&path), "old", "a.b").await.is_err());
    }
}
