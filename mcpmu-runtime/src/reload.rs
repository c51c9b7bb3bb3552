//! Config hot-reload watcher
//!
//! Watches the directory containing the config file (editors that
//! save-via-rename would otherwise detach a file-level watch), debounces
//! bursts, reloads the document, and applies the minimum set of lifecycle
//! changes: a server whose effective start parameters are unchanged is left
//! alone, and an old-name/new-name pair with identical parameters is treated
//! as a rename: actor and cache entry migrate without a restart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mcpmu_cache::ToolCache;
use mcpmu_config::{ConfigStore, GatewayConfig};
use mcpmu_events::{EventBus, GatewayEvent};

use crate::error::{RuntimeError, RuntimeResult};
use crate::supervisor::Supervisor;

/// Quiet period before a burst of file events is processed
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Running watcher; dropping it stops watching.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    /// Start watching the config file behind `config`.
    pub async fn spawn(
        config: Arc<RwLock<ConfigStore>>,
        supervisor: Supervisor,
        cache: Arc<ToolCache>,
        bus: EventBus,
    ) -> RuntimeResult<ConfigWatcher> {
        let path = config.read().await.path().to_path_buf();
        let dir = path
            .parent()
            .map(PathBuf::from)
            .ok_or_else(|| RuntimeError::Watcher("config path has no parent".to_string()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| RuntimeError::Watcher("config path has no file name".to_string()))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if relevant {
                        let _ = event_tx.send(());
                    }
                }
                Err(err) => warn!(error = %err, "config watcher error"),
            },
            NotifyConfig::default(),
        )
        .map_err(|e| RuntimeError::Watcher(e.to_string()))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| RuntimeError::Watcher(e.to_string()))?;
        info!(path = %path.display(), "watching config file");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(process_events(
            event_rx,
            shutdown_rx,
            path,
            config,
            supervisor,
            cache,
            bus,
        ));

        Ok(ConfigWatcher {
            _watcher: watcher,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Stop the watcher and wait for its processor task.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_events(
    mut events: mpsc::UnboundedReceiver<()>,
    mut shutdown: oneshot::Receiver<()>,
    path: PathBuf,
    config: Arc<RwLock<ConfigStore>>,
    supervisor: Supervisor,
    cache: Arc<ToolCache>,
    bus: EventBus,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                if event.is_none() {
                    break;
                }
                // Debounce: editors produce bursts of writes and renames.
                loop {
                    match tokio::time::timeout(DEBOUNCE, events.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) | Err(_) => break,
                    }
                }
                apply_reload(&path, &config, &supervisor, &cache, &bus).await;
            }
            _ = &mut shutdown => break,
        }
    }
    debug!("config watcher processor stopped");
}

async fn apply_reload(
    path: &PathBuf,
    config: &Arc<RwLock<ConfigStore>>,
    supervisor: &Supervisor,
    cache: &Arc<ToolCache>,
    bus: &EventBus,
) {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) => {
            // Transient during save-via-rename; the next event retries.
            debug!(error = %err, "config file unreadable, skipping reload");
            return;
        }
    };
    let fresh: GatewayConfig = match serde_json::from_str(&content) {
        Ok(fresh) => fresh,
        Err(err) => {
            warn!(error = %err, "reloaded config does not parse, keeping previous");
            let _ = bus.publish(GatewayEvent::Error {
                server: None,
                message: format!("config reload failed: {err}"),
            });
            return;
        }
    };
    if let Err(err) = fresh.validate() {
        warn!(error = %err, "reloaded config invalid, keeping previous");
        let _ = bus.publish(GatewayEvent::Error {
            server: None,
            message: format!("config reload failed: {err}"),
        });
        return;
    }

    let previous = config.read().await.snapshot();
    if previous == fresh {
        debug!("config unchanged after reload");
        return;
    }
    info!("applying reloaded configuration");

    let mut removed: Vec<String> = previous
        .servers
        .keys()
        .filter(|name| !fresh.servers.contains_key(*name))
        .cloned()
        .collect();
    let mut added: Vec<String> = fresh
        .servers
        .keys()
        .filter(|name| !previous.servers.contains_key(*name))
        .cloned()
        .collect();

    // Cross-key diff: an old name vanishing while a new name appears with
    // identical effective parameters is a rename, not a restart.
    let mut renames = Vec::new();
    for old_name in removed.clone() {
        let old_cfg = &previous.servers[&old_name];
        if let Some(new_name) = added
            .iter()
            .find(|candidate| fresh.servers[*candidate].runtime_params_eq(old_cfg))
            .cloned()
        {
            renames.push((old_name.clone(), new_name.clone()));
            removed.retain(|n| n != &old_name);
            added.retain(|n| n != &new_name);
        }
    }

    for (old_name, new_name) in &renames {
        info!(old = %old_name, new = %new_name, "rename detected, migrating without restart");
        supervisor.rename_server(old_name, new_name).await;
        cache.rename(old_name, new_name).await;
    }
    for name in &removed {
        supervisor.remove_server(name).await;
        cache.delete(name).await;
    }

    if let Err(err) = config.write().await.replace(fresh.clone()) {
        warn!(error = %err, "reloaded config rejected");
        return;
    }
    supervisor.sync_config(&fresh).await;

    for name in &added {
        let server = &fresh.servers[name];
        if server.autostart && server.is_enabled() {
            if let Err(err) = supervisor.start(name).await {
                warn!(server = %name, error = %err, "autostart after reload failed");
            }
        }
    }

    cache.save().await;
    let _ = bus.publish(GatewayEvent::ConfigReloaded);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpmu_auth::{AuthResult, CredentialStore, TokenRecord};
    use mcpmu_cache::ToolInfo;
    use mcpmu_config::ServerConfig;
    use serde_json::json;
    use tempfile::TempDir;

    struct NullStore;

    #[async_trait::async_trait]
    impl CredentialStore for NullStore {
        async fn get(&self, _server_url: &str) -> AuthResult<Option<TokenRecord>> {
            Ok(None)
        }
        async fn put(&self, _server_url: &str, _record: &TokenRecord) -> AuthResult<()> {
            Ok(())
        }
        async fn delete(&self, _server_url: &str) -> AuthResult<()> {
            Ok(())
        }
    }

    async fn wait_for_reload(events: &mut mcpmu_events::EventStream) {
        let deadline = Duration::from_secs(10);
        tokio::time::timeout(deadline, async {
            while let Some(event) = events.recv().await {
                if event == GatewayEvent::ConfigReloaded {
                    return;
                }
            }
            panic!("bus closed before reload event");
        })
        .await
        .expect("reload event within deadline");
    }

    struct Fixture {
        dir: TempDir,
        config: Arc<RwLock<ConfigStore>>,
        supervisor: Supervisor,
        cache: Arc<ToolCache>,
        bus: EventBus,
    }

    async fn fixture(initial: impl FnOnce(&mut ConfigStore)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut store = ConfigStore::load(dir.path().join("config.json")).unwrap();
        initial(&mut store);
        store.save().unwrap();

        let bus = EventBus::new();
        let cache = Arc::new(ToolCache::in_memory());
        let supervisor = Supervisor::new(bus.clone(), Arc::clone(&cache), Arc::new(NullStore));
        supervisor.sync_config(store.config()).await;

        Fixture {
            dir,
            config: Arc::new(RwLock::new(store)),
            supervisor,
            cache,
            bus,
        }
    }

    fn quick_stdio(command: &str, args: &[&str]) -> ServerConfig {
        let mut config =
            ServerConfig::stdio(command, args.iter().map(|s| s.to_string()).collect());
        config.startup_timeout_secs = Some(1);
        config
    }

    async fn rewrite_config(fixture: &Fixture, mutate: impl FnOnce(&mut GatewayConfig)) {
        let mut snapshot = fixture.config.read().await.snapshot();
        mutate(&mut snapshot);
        let staged = ConfigStore::from_parts(snapshot, fixture.dir.path().join("config.json"));
        staged.save().unwrap();
    }

    #[tokio::test]
    async fn reload_picks_up_added_server() {
        let f = fixture(|_| {}).await;
        let mut events = f.bus.subscribe();
        let watcher = ConfigWatcher::spawn(
            Arc::clone(&f.config),
            f.supervisor.clone(),
            Arc::clone(&f.cache),
            f.bus.clone(),
        )
        .await
        .unwrap();

        rewrite_config(&f, |config| {
            config
                .servers
                .insert("fresh".to_string(), quick_stdio("cat", &[]));
        })
        .await;

        wait_for_reload(&mut events).await;
        assert!(f.supervisor.status("fresh").is_some());
        assert!(f.config.read().await.config().servers.contains_key("fresh"));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn rename_with_identical_params_migrates_without_restart() {
        let f = fixture(|store| {
            store
                .add_server("alpha", quick_stdio("cat", &["-u"]))
                .unwrap();
        })
        .await;
        f.cache
            .update(
                "alpha",
                &[ToolInfo {
                    name: "t".to_string(),
                    description: "a tool".to_string(),
                    input_schema: json!({"type": "object"}),
                }],
            )
            .await;

        let mut events = f.bus.subscribe();
        let watcher = ConfigWatcher::spawn(
            Arc::clone(&f.config),
            f.supervisor.clone(),
            Arc::clone(&f.cache),
            f.bus.clone(),
        )
        .await
        .unwrap();

        rewrite_config(&f, |config| {
            let server = config.servers.remove("alpha").unwrap();
            config.servers.insert("beta".to_string(), server);
        })
        .await;

        wait_for_reload(&mut events).await;
        assert!(f.supervisor.status("alpha").is_none());
        assert!(f.supervisor.status("beta").is_some());
        assert!(f.cache.get("alpha").await.is_none());
        assert_eq!(f.cache.get("beta").await.unwrap()[0].name, "t");
        watcher.stop().await;
    }

    #[tokio::test]
    async fn removed_server_is_stopped_and_purged() {
        let f = fixture(|store| {
            store.add_server("gone", quick_stdio("cat", &[])).unwrap();
        })
        .await;
        f.cache
            .update(
                "gone",
                &[ToolInfo {
                    name: "t".to_string(),
                    description: String::new(),
                    input_schema: json!({}),
                }],
            )
            .await;

        let mut events = f.bus.subscribe();
        let watcher = ConfigWatcher::spawn(
            Arc::clone(&f.config),
            f.supervisor.clone(),
            Arc::clone(&f.cache),
            f.bus.clone(),
        )
        .await
        .unwrap();

        rewrite_config(&f, |config| {
            config.servers.clear();
        })
        .await;

        wait_for_reload(&mut events).await;
        assert!(f.supervisor.status("gone").is_none());
        assert!(f.cache.get("gone").await.is_none());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn invalid_reload_keeps_previous_config() {
        let f = fixture(|store| {
            store.add_server("keep", quick_stdio("cat", &[])).unwrap();
        })
        .await;
        let mut events = f.bus.subscribe();
        let watcher = ConfigWatcher::spawn(
            Arc::clone(&f.config),
            f.supervisor.clone(),
            Arc::clone(&f.cache),
            f.bus.clone(),
        )
        .await
        .unwrap();

        std::fs::write(f.dir.path().join("config.json"), b"{ broken json").unwrap();

        // An Error event is published instead of ConfigReloaded.
        let deadline = Duration::from_secs(10);
        tokio::time::timeout(deadline, async {
            while let Some(event) = events.recv().await {
                match event {
                    GatewayEvent::Error { .. } => return,
                    GatewayEvent::ConfigReloaded => panic!("broken config was applied"),
                    _ => continue,
                }
            }
        })
        .await
        .expect("error event within deadline");

        assert!(f.config.read().await.config().servers.contains_key("keep"));
        assert!(f.supervisor.status("keep").is_some());
        watcher.stop().await;
    }
}
