//! Configuration model for the mcpmu gateway
//!
//! The configuration is a single JSON document holding downstream server
//! definitions, namespaces, tool permissions, and gateway-wide defaults.
//! [`ConfigStore`] owns the in-memory document plus its on-disk path and
//! exposes the transactional mutations the CLI, the manager tools, and the
//! hot-reload watcher go through. Every mutation validates before it touches
//! the document, so a failed call leaves the in-memory state unchanged.
//!
//! Persistence is atomic: the document is written to a temp file with mode
//! 0600 and renamed over the target, so a partially written config is never
//! observable.

pub mod error;
pub mod model;
pub mod paths;
pub mod store;

pub use error::{ConfigError, ConfigResult};
pub use model::{
    validate_name, CredentialStoreMode, GatewayConfig, HttpServerConfig, NamespaceConfig,
    ServerConfig, StdioServerConfig, ToolPermission, TransportConfig, SCHEMA_VERSION,
};
pub use paths::{config_dir, default_config_path, expand_tilde, resolve_config_path};
pub use store::ConfigStore;
