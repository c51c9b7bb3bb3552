//! Cache storage and persistence

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::tokens::{aggregated_tool_text, count_tokens};

/// Current cache file format version
pub const CACHE_VERSION: u32 = 1;

/// File name, co-located with the config file
pub const CACHE_FILE_NAME: &str = "toolcache.json";

/// Tool description as reported by a downstream, before caching.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One cached tool with its precomputed token count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTool {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(rename = "inputSchema")]
    pub input_schema: Value,

    /// Tokens the tool contributes to the upstream context in its aggregated
    /// form; depends on the server name
    #[serde(rename = "tokenCount")]
    pub token_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheEntry {
    tools: Vec<CachedTool>,

    #[serde(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    servers: BTreeMap<String, CacheEntry>,
}

impl Default for CacheFile {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            servers: BTreeMap::new(),
        }
    }
}

/// Persistent map from server name to its last-known tool list.
///
/// Readers never block each other; updates take the write lock briefly.
#[derive(Debug)]
pub struct ToolCache {
    path: PathBuf,
    inner: RwLock<CacheFile>,
}

impl ToolCache {
    /// Load the cache from `dir/toolcache.json`. Missing files, version
    /// mismatches, and parse errors all start from an empty cache.
    pub fn load(dir: impl AsRef<Path>) -> Self {
        let path = dir.as_ref().join(CACHE_FILE_NAME);
        let file = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
                Ok(file) if file.version == CACHE_VERSION => file,
                Ok(file) => {
                    warn!(
                        found = file.version,
                        expected = CACHE_VERSION,
                        "tool cache version mismatch, reinitializing"
                    );
                    CacheFile::default()
                }
                Err(err) => {
                    warn!(error = %err, "tool cache unreadable, reinitializing");
                    CacheFile::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CacheFile::default(),
            Err(err) => {
                warn!(error = %err, "tool cache unreadable, reinitializing");
                CacheFile::default()
            }
        };
        Self {
            path,
            inner: RwLock::new(file),
        }
    }

    /// In-memory cache for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            inner: RwLock::new(CacheFile::default()),
        }
    }

    /// Replace a server's entry with a fresh tool list, recomputing token
    /// counts against the aggregated form.
    pub async fn update(&self, server: &str, tools: &[ToolInfo]) {
        let cached = tools
            .iter()
            .map(|t| recount(server, t))
            .collect::<Vec<_>>();
        let mut inner = self.inner.write().await;
        inner.servers.insert(
            server.to_string(),
            CacheEntry {
                tools: cached,
                updated_at: Utc::now(),
            },
        );
    }

    /// Last-known tools for a server, or `None` on a miss.
    pub async fn get(&self, server: &str) -> Option<Vec<CachedTool>> {
        self.inner
            .read()
            .await
            .servers
            .get(server)
            .map(|e| e.tools.clone())
    }

    /// When the server was last observed, or `None` on a miss.
    pub async fn updated_at(&self, server: &str) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .await
            .servers
            .get(server)
            .map(|e| e.updated_at)
    }

    /// Number of cached tools for a server.
    pub async fn tool_count(&self, server: &str) -> usize {
        self.inner
            .read()
            .await
            .servers
            .get(server)
            .map(|e| e.tools.len())
            .unwrap_or(0)
    }

    /// Migrate an entry to a new server name, recomputing token counts
    /// because the aggregated form embeds the name.
    pub async fn rename(&self, old: &str, new: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.servers.remove(old) {
            let tools = entry
                .tools
                .iter()
                .map(|t| {
                    recount(
                        new,
                        &ToolInfo {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            input_schema: t.input_schema.clone(),
                        },
                    )
                })
                .collect();
            inner.servers.insert(
                new.to_string(),
                CacheEntry {
                    tools,
                    updated_at: entry.updated_at,
                },
            );
        }
    }

    /// Drop a server's entry.
    pub async fn delete(&self, server: &str) {
        self.inner.write().await.servers.remove(server);
    }

    /// Persist the cache with mode 0600. A failure is logged, not fatal:
    /// the data is recoverable from the servers.
    pub async fn save(&self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        let json = {
            let inner = self.inner.read().await;
            match serde_json::to_string_pretty(&*inner) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize tool cache");
                    return;
                }
            }
        };
        if let Err(err) = write_private_atomic(&self.path, json.as_bytes()) {
            warn!(error = %err, path = %self.path.display(), "failed to save tool cache");
        } else {
            debug!(path = %self.path.display(), "tool cache saved");
        }
    }
}

fn recount(server: &str, tool: &ToolInfo) -> CachedTool {
    let text = aggregated_tool_text(server, &tool.name, &tool.description, &tool.input_schema);
    CachedTool {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
        token_count: count_tokens(&text),
    }
}

fn write_private_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn tool(name: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: format!("description of {name}"),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    #[tokio::test]
    async fn update_then_get() {
        let cache = ToolCache::in_memory();
        cache.update("fs", &[tool("read_file"), tool("write_file")]).await;

        let tools = cache.get("fs").await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "read_file");
        assert!(tools[0].token_count > 0);
        assert!(cache.get("other").await.is_none());
    }

    #[tokio::test]
    async fn update_replaces_previous_list() {
        let cache = ToolCache::in_memory();
        cache.update("fs", &[tool("a"), tool("b")]).await;
        cache.update("fs", &[tool("c")]).await;

        let tools = cache.get("fs").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "c");
    }

    #[tokio::test]
    async fn rename_migrates_and_recounts() {
        let cache = ToolCache::in_memory();
        cache.update("a", &[tool("t")]).await;
        let before = cache.get("a").await.unwrap()[0].token_count;

        cache.rename("a", "a-considerably-longer-name").await;
        assert!(cache.get("a").await.is_none());
        let after = cache.get("a-considerably-longer-name").await.unwrap()[0].token_count;
        assert!(after > before);
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let dir = TempDir::new().unwrap();
        let cache = ToolCache::load(dir.path());
        cache.update("fs", &[tool("read_file")]).await;
        cache.save().await;

        let reloaded = ToolCache::load(dir.path());
        let tools = reloaded.get("fs").await.unwrap();
        assert_eq!(tools[0].name, "read_file");
    }

    #[tokio::test]
    async fn corrupt_file_reinitializes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CACHE_FILE_NAME), b"{ not json").unwrap();

        let cache = ToolCache::load(dir.path());
        assert!(cache.get("fs").await.is_none());
    }

    #[tokio::test]
    async fn version_mismatch_reinitializes() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CACHE_FILE_NAME),
            serde_json::to_string(&json!({"version": 99, "servers": {"fs": {"tools": [], "updatedAt": "2024-01-01T00:00:00Z"}}}))
                .unwrap(),
        )
        .unwrap();

        let cache = ToolCache::load(dir.path());
        assert!(cache.get("fs").await.is_none());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = ToolCache::in_memory();
        cache.update("fs", &[tool("t")]).await;
        cache.delete("fs").await;
        assert!(cache.get("fs").await.is_none());
        assert_eq!(cache.tool_count("fs").await, 0);
    }
}
