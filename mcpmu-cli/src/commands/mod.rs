//! Command implementations
//!
//! Every subcommand is a thin wrapper over the config API; `serve` is the
//! one that stands up the full runtime.

pub mod auth;
pub mod namespace;
pub mod permission;
pub mod serve;
pub mod server;

use std::path::Path;

use anyhow::{Context, Result};
use mcpmu_config::{resolve_config_path, ConfigStore};

/// Open the config store for a mutation command.
pub(crate) fn open_store(config_path: Option<&Path>) -> Result<ConfigStore> {
    let path = resolve_config_path(config_path)?;
    ConfigStore::load(&path).with_context(|| format!("loading {}", path.display()))
}

/// Parse a `KEY=VALUE` argument.
pub(crate) fn parse_key_value(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("'{raw}' is not KEY=VALUE"))?;
    anyhow::ensure!(!key.is_empty(), "'{raw}' has an empty key");
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_parsing() {
        assert_eq!(
            parse_key_value("A=1").unwrap(),
            ("A".to_string(), "1".to_string())
        );
        assert_eq!(
            parse_key_value("A=x=y").unwrap(),
            ("A".to_string(), "x=y".to_string())
        );
        assert!(parse_key_value("A").is_err());
        assert!(parse_key_value("=v").is_err());
    }
}
