//! Runtime context
//!
//! One value owning every shared service of the gateway: the config store,
//! the event bus, the tool cache, the credential store, and the supervisor.
//! The CLI builds one per invocation and threads it through; nothing in the
//! workspace reaches for globals.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use mcpmu_auth::{open_store, CredentialStore};
use mcpmu_cache::ToolCache;
use mcpmu_config::{resolve_config_path, ConfigStore};
use mcpmu_events::EventBus;

use crate::aggregator::Aggregator;
use crate::error::RuntimeResult;
use crate::reload::ConfigWatcher;
use crate::supervisor::Supervisor;

/// Deadline for stopping every child during process shutdown
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Shared services of a running gateway.
pub struct RuntimeContext {
    pub config: Arc<RwLock<ConfigStore>>,
    pub bus: EventBus,
    pub cache: Arc<ToolCache>,
    pub credentials: Arc<dyn CredentialStore>,
    pub supervisor: Supervisor,
}

impl RuntimeContext {
    /// Load configuration and stand up the supervisor. No servers are
    /// started yet; `start_autostart` or lazy starts do that.
    pub async fn initialize(config_path: Option<&Path>) -> RuntimeResult<Self> {
        let path = resolve_config_path(config_path)?;
        let store = ConfigStore::load(&path)?;
        let data_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| std::path::PathBuf::from("."));

        let cache = Arc::new(ToolCache::load(&data_dir));
        let credentials: Arc<dyn CredentialStore> =
            Arc::from(open_store(store.config().credentials_store, &data_dir)?);
        let bus = EventBus::new();
        let supervisor = Supervisor::new(bus.clone(), Arc::clone(&cache), Arc::clone(&credentials));
        supervisor.sync_config(store.config()).await;

        info!(config = %path.display(), "runtime initialized");
        Ok(Self {
            config: Arc::new(RwLock::new(store)),
            bus,
            cache,
            credentials,
            supervisor,
        })
    }

    /// Build the aggregator for this runtime with the resolved namespace.
    pub async fn aggregator(&self, namespace_flag: Option<&str>) -> Arc<Aggregator> {
        let namespace = {
            let config = self.config.read().await;
            Aggregator::resolve_default_namespace(config.config(), namespace_flag)
        };
        info!(namespace = %namespace, "active namespace resolved");
        Arc::new(Aggregator::new(
            Arc::clone(&self.config),
            self.supervisor.clone(),
            Arc::clone(&self.cache),
            namespace,
        ))
    }

    /// Start the config hot-reload watcher.
    pub async fn watch_config(&self) -> RuntimeResult<ConfigWatcher> {
        ConfigWatcher::spawn(
            Arc::clone(&self.config),
            self.supervisor.clone(),
            Arc::clone(&self.cache),
            self.bus.clone(),
        )
        .await
    }

    /// Eagerly start every enabled server flagged `autostart`.
    pub async fn start_autostart(&self) {
        let servers: Vec<String> = {
            let config = self.config.read().await;
            config
                .config()
                .servers
                .iter()
                .filter(|(_, s)| s.autostart && s.is_enabled())
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in servers {
            if let Err(err) = self.supervisor.start(&name).await {
                warn!(server = %name, error = %err, "autostart failed");
            }
        }
    }

    /// Stop every server, persist the cache, and close the bus.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.supervisor.stop_all(SHUTDOWN_DEADLINE).await;
        self.cache.save().await;
        self.bus.close();
    }
}
