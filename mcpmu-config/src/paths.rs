//! Config file path resolution

use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "MCPMU_CONFIG";

/// File name of the configuration document
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Directory that holds the config file, the tool cache, and the encrypted
/// credential file: `<user config dir>/mcpmu`.
pub fn config_dir() -> ConfigResult<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("mcpmu"))
        .ok_or_else(|| ConfigError::validation("cannot determine user config directory"))
}

/// Default path of the configuration document.
pub fn default_config_path() -> ConfigResult<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the effective config path: explicit argument (with `~` expansion),
/// then `$MCPMU_CONFIG`, then the per-user default.
pub fn resolve_config_path(explicit: Option<&Path>) -> ConfigResult<PathBuf> {
    if let Some(path) = explicit {
        return Ok(expand_tilde(path));
    }
    if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
        if !env_path.is_empty() {
            return Ok(expand_tilde(Path::new(&env_path)));
        }
    }
    default_config_path()
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
