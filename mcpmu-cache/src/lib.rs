//! Persistent tool cache for the mcpmu gateway
//!
//! The cache remembers the last `tools/list` result every downstream server
//! produced, together with a token count of each tool's aggregated form
//! (qualified name, bracketed description, schema JSON). The aggregator
//! serves cached entries for servers that are not currently running so the
//! upstream client sees a stable tool surface across restarts, and the CLI
//! can show context-window cost without starting anything.
//!
//! The cache file lives beside the config file and is disposable: a version
//! mismatch or parse error silently reinitializes it, since the data is
//! recoverable from the servers themselves.

pub mod cache;
pub mod tokens;

pub use cache::{CachedTool, ToolCache, ToolInfo, CACHE_FILE_NAME, CACHE_VERSION};
pub use tokens::{aggregated_tool_text, count_tokens};
