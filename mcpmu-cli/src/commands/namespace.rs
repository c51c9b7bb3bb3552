//! Namespace management

use std::path::Path;

use anyhow::Result;

use mcpmu_config::NamespaceConfig;

use crate::commands::open_store;

pub fn add(config_path: Option<&Path>, name: &str, description: Option<&str>) -> Result<()> {
    let mut store = open_store(config_path)?;
    store.add_namespace(
        name,
        NamespaceConfig {
            description: description.unwrap_or_default().to_string(),
            ..Default::default()
        },
    )?;
    store.save()?;
    println!("added namespace '{name}'");
    Ok(())
}

pub fn remove(config_path: Option<&Path>, name: &str) -> Result<()> {
    let mut store = open_store(config_path)?;
    store.delete_namespace(name)?;
    store.save()?;
    println!("removed namespace '{name}'");
    Ok(())
}

pub fn list(config_path: Option<&Path>) -> Result<()> {
    let store = open_store(config_path)?;
    let config = store.config();
    if config.namespaces.is_empty() {
        println!("no namespaces configured");
        return Ok(());
    }
    for (name, ns) in &config.namespaces {
        let default = if config.default_namespace.as_deref() == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        let policy = if ns.deny_by_default {
            "deny-by-default"
        } else {
            "allow-by-default"
        };
        println!("{name}{default}  {policy}  members: {}", ns.servers.join(", "));
    }
    Ok(())
}

pub fn rename(config_path: Option<&Path>, old: &str, new: &str) -> Result<()> {
    let mut store = open_store(config_path)?;
    store.rename_namespace(old, new)?;
    store.save()?;
    println!("renamed namespace '{old}' to '{new}'");
    Ok(())
}

pub fn assign(config_path: Option<&Path>, namespace: &str, server: &str) -> Result<()> {
    let mut store = open_store(config_path)?;
    store.assign_server(namespace, server)?;
    store.save()?;
    println!("assigned '{server}' to '{namespace}'");
    Ok(())
}

pub fn unassign(config_path: Option<&Path>, namespace: &str, server: &str) -> Result<()> {
    let mut store = open_store(config_path)?;
    store.unassign_server(namespace, server)?;
    store.save()?;
    println!("unassigned '{server}' from '{namespace}'");
    Ok(())
}

pub fn set_default(config_path: Option<&Path>, name: Option<&str>) -> Result<()> {
    let mut store = open_store(config_path)?;
    store.set_default_namespace(name)?;
    store.save()?;
    match name {
        Some(name) => println!("default namespace is '{name}'"),
        None => println!("default namespace cleared"),
    }
    Ok(())
}

pub fn set_deny_default(config_path: Option<&Path>, namespace: &str, deny: bool) -> Result<()> {
    let mut store = open_store(config_path)?;
    store.set_deny_by_default(namespace, deny)?;
    store.save()?;
    println!(
        "namespace '{namespace}' is now {}",
        if deny { "deny-by-default" } else { "allow-by-default" }
    );
    Ok(())
}
